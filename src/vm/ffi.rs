//! The libffi bridge.
//!
//! Outgoing: `lib_call` reads argument values off the byte stack, points
//! a libffi argument vector at them, invokes the resolved symbol through
//! its call interface, and pushes the return bytes.
//!
//! Incoming: `proc_to_c_fun` wraps an interpreted proc in a libffi
//! closure whose trampoline re-enters the interpreter; `c_fun_to_proc`
//! maps a code pointer back to the proc it was built from. The registry
//! takes ownership of each closure at registration and drops them all
//! with the interpreter, so a code pointer handed to C must not outlive
//! the VM.

use super::interpreter::Interpreter;
use super::stack::OperandStack;
use libffi::low;
use libffi::middle::{Arg, Cif, CodePtr, Type};
use rustc_hash::FxHashMap;
use std::ffi::c_void;
use vesper_core::{CifId, VmError, VmResult, align};

/// Foreign value types understood by the marshaler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiType {
    Void,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    Pointer,
}

impl FfiType {
    /// Semantic size on the operand stack.
    pub const fn size(self) -> usize {
        match self {
            FfiType::Void => 0,
            FfiType::U8 | FfiType::I8 => 1,
            FfiType::U16 | FfiType::I16 => 2,
            FfiType::U32 | FfiType::I32 | FfiType::F32 => 4,
            FfiType::U64 | FfiType::I64 | FfiType::F64 | FfiType::Pointer => 8,
        }
    }

    fn middle(self) -> Type {
        match self {
            FfiType::Void => Type::void(),
            FfiType::U8 => Type::u8(),
            FfiType::I8 => Type::i8(),
            FfiType::U16 => Type::u16(),
            FfiType::I16 => Type::i16(),
            FfiType::U32 => Type::u32(),
            FfiType::I32 => Type::i32(),
            FfiType::U64 => Type::u64(),
            FfiType::I64 => Type::i64(),
            FfiType::F32 => Type::f32(),
            FfiType::F64 => Type::f64(),
            FfiType::Pointer => Type::pointer(),
        }
    }
}

/// A prepared libffi call interface: argument types, return type, and the
/// variadic flag.
///
/// Variadic call sites are registered with the full concrete argument
/// list of that site (the compiler emits one interface per call shape),
/// so one prepared CIF serves each.
#[derive(Debug, Clone)]
pub struct CallInterface {
    pub args: Vec<FfiType>,
    pub ret: FfiType,
    pub variadic: bool,
    cif: Cif,
}

impl CallInterface {
    pub fn new(args: Vec<FfiType>, ret: FfiType) -> Self {
        let cif = Cif::new(args.iter().map(|t| t.middle()), ret.middle());
        Self {
            args,
            ret,
            variadic: false,
            cif,
        }
    }

    pub fn new_variadic(args: Vec<FfiType>, ret: FfiType) -> Self {
        let mut iface = Self::new(args, ret);
        iface.variadic = true;
        iface
    }

    /// Total stack footprint of the argument values.
    pub fn args_stack_size(&self) -> usize {
        self.args.iter().map(|t| align(t.size())).sum()
    }

    pub(crate) fn raw_cif(&self) -> *mut low::ffi_cif {
        self.cif.as_raw_ptr()
    }
}

/// A resolved native function: symbol address plus call interface.
#[derive(Debug)]
pub struct LibFunction {
    pub name: String,
    pub interface: CifId,
    code: CodePtr,
}

impl LibFunction {
    pub fn new(name: impl Into<String>, interface: CifId, address: *const c_void) -> Self {
        Self {
            name: name.into(),
            interface,
            code: CodePtr::from_ptr(address),
        }
    }

    pub(crate) fn code(&self) -> CodePtr {
        self.code
    }

    pub fn is_null(&self) -> bool {
        self.code.as_mut_ptr().is_null()
    }
}

/// Resolve a symbol from the running process image.
#[cfg(unix)]
pub fn resolve_in_process(symbol: &str) -> VmResult<*const c_void> {
    let lib = libloading::os::unix::Library::this();
    let sym: libloading::os::unix::Symbol<unsafe extern "C" fn()> = unsafe {
        lib.get(symbol.as_bytes())
            .map_err(|e| VmError::SymbolResolution(format!("{symbol}: {e}")))?
    };
    let f: unsafe extern "C" fn() = *sym;
    std::mem::forget(lib);
    Ok(f as usize as *const c_void)
}

/// Resolve a symbol from a shared library on disk.
pub fn resolve_in_library(path: &str, symbol: &str) -> VmResult<*const c_void> {
    let lib = unsafe { libloading::Library::new(path) }
        .map_err(|e| VmError::SymbolResolution(format!("{path}: {e}")))?;
    let sym: libloading::Symbol<'_, unsafe extern "C" fn()> = unsafe {
        lib.get(symbol.as_bytes())
            .map_err(|e| VmError::SymbolResolution(format!("{symbol}: {e}")))?
    };
    let f: unsafe extern "C" fn() = *sym;
    // The library handle is deliberately leaked: resolved code must stay
    // mapped for the VM's lifetime, matching the native backend's static
    // linkage.
    std::mem::forget(lib);
    Ok(f as usize as *const c_void)
}

/// Marshal a `lib_call`: arguments were pushed left to right and are
/// consumed; the return value (if any) is pushed.
pub(crate) fn marshal_call(
    stack: &mut OperandStack,
    iface: &CallInterface,
    code: CodePtr,
) -> VmResult<()> {
    let args_bytes = iface.args_stack_size();
    let base = stack.sp() - args_bytes;

    let mut args = Vec::with_capacity(iface.args.len());
    let mut offset = base;
    for ty in &iface.args {
        let ptr = stack.ptr_at(offset);
        // Arg records the value's address; libffi reads it per the CIF.
        args.push(unsafe { Arg::new(&*ptr) });
        offset += align(ty.size());
    }

    unsafe {
        match iface.ret {
            FfiType::Void => {
                iface.cif.call::<()>(code, &args);
                stack.truncate(base);
            }
            FfiType::U8 => {
                let v = iface.cif.call::<u8>(code, &args);
                stack.truncate(base);
                stack.push_u8(v)?;
            }
            FfiType::I8 => {
                let v = iface.cif.call::<i8>(code, &args);
                stack.truncate(base);
                stack.push_u8(v as u8)?;
            }
            FfiType::U16 => {
                let v = iface.cif.call::<u16>(code, &args);
                stack.truncate(base);
                stack.push_u16(v)?;
            }
            FfiType::I16 => {
                let v = iface.cif.call::<i16>(code, &args);
                stack.truncate(base);
                stack.push_u16(v as u16)?;
            }
            FfiType::U32 => {
                let v = iface.cif.call::<u32>(code, &args);
                stack.truncate(base);
                stack.push_u32(v)?;
            }
            FfiType::I32 => {
                let v = iface.cif.call::<i32>(code, &args);
                stack.truncate(base);
                stack.push_i32(v)?;
            }
            FfiType::U64 => {
                let v = iface.cif.call::<u64>(code, &args);
                stack.truncate(base);
                stack.push_u64(v)?;
            }
            FfiType::I64 => {
                let v = iface.cif.call::<i64>(code, &args);
                stack.truncate(base);
                stack.push_i64(v)?;
            }
            FfiType::F32 => {
                let v = iface.cif.call::<f32>(code, &args);
                stack.truncate(base);
                stack.push_f32(v)?;
            }
            FfiType::F64 => {
                let v = iface.cif.call::<f64>(code, &args);
                stack.truncate(base);
                stack.push_f64(v)?;
            }
            FfiType::Pointer => {
                let v = iface.cif.call::<*mut c_void>(code, &args);
                stack.truncate(base);
                stack.push_u64(v as u64)?;
            }
        }
    }
    Ok(())
}

/// Everything the closure trampoline needs, boxed so its address is
/// stable while libffi holds it as userdata.
pub(crate) struct ClosureUser {
    pub vm: *mut Interpreter,
    pub def_index: u64,
    pub closure_data: u64,
    pub iface: CallInterface,
}

struct RegisteredClosure {
    def_index: u64,
    closure_data: u64,
    closure: *mut low::ffi_closure,
    // Keeps the CIF and userdata alive as long as the closure.
    _user: Box<ClosureUser>,
}

impl Drop for RegisteredClosure {
    fn drop(&mut self) {
        unsafe { low::closure_free(self.closure) };
    }
}

// The trampoline receives userdata through libffi; RegisteredClosure is
// only touched from the interpreter's thread.
unsafe impl Send for RegisteredClosure {}

/// Code pointer → proc mapping for `proc_to_c_fun`/`c_fun_to_proc`.
///
/// Owns every closure it creates; all are freed when the interpreter
/// drops.
#[derive(Default)]
pub(crate) struct ClosureRegistry {
    by_code: FxHashMap<usize, RegisteredClosure>,
}

impl ClosureRegistry {
    /// Build a native-callable closure around a proc; returns the code
    /// pointer address.
    pub fn register(&mut self, user: Box<ClosureUser>) -> VmResult<usize> {
        let (closure, code) = low::closure_alloc();
        if closure.is_null() {
            return Err(VmError::Ffi("closure allocation failed".into()));
        }
        let result = unsafe {
            low::prep_closure(
                closure,
                user.iface.raw_cif(),
                closure_trampoline,
                &*user as *const ClosureUser,
                code,
            )
        };
        if let Err(status) = result {
            unsafe { low::closure_free(closure) };
            return Err(VmError::Ffi(format!("prep_closure failed: {status:?}")));
        }
        let address = code.as_mut_ptr() as usize;
        self.by_code.insert(
            address,
            RegisteredClosure {
                def_index: user.def_index,
                closure_data: user.closure_data,
                closure,
                _user: user,
            },
        );
        Ok(address)
    }

    /// Map a code pointer back to `(def index, closure data)`.
    pub fn lookup(&self, address: usize) -> Option<(u64, u64)> {
        self.by_code
            .get(&address)
            .map(|c| (c.def_index, c.closure_data))
    }
}

/// Entry point libffi jumps to when C invokes a bridged proc.
///
/// Errors cannot cross the C boundary; a failed re-entry logs and
/// returns zero bytes.
unsafe extern "C" fn closure_trampoline(
    _cif: &low::ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    user: &ClosureUser,
) {
    *result = 0;
    let vm = unsafe { &mut *user.vm };
    if let Err(err) = vm.enter_from_c(user, args, result) {
        log::error!("interpreter closure for def {} failed: {err}", user.def_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffi_type_sizes() {
        assert_eq!(FfiType::Void.size(), 0);
        assert_eq!(FfiType::I8.size(), 1);
        assert_eq!(FfiType::F32.size(), 4);
        assert_eq!(FfiType::Pointer.size(), 8);
    }

    #[test]
    fn args_stack_size_is_aligned() {
        let iface = CallInterface::new(vec![FfiType::U8, FfiType::I32, FfiType::F64], FfiType::Void);
        // Each argument occupies a full word on the operand stack.
        assert_eq!(iface.args_stack_size(), 24);
    }

    #[test]
    fn variadic_flag() {
        let iface = CallInterface::new_variadic(vec![FfiType::Pointer, FfiType::I32], FfiType::I32);
        assert!(iface.variadic);
        assert_eq!(iface.args.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn resolves_libc_symbols() {
        assert!(!resolve_in_process("abs").unwrap().is_null());
        assert!(resolve_in_process("definitely_not_a_symbol_x9").is_err());
    }
}
