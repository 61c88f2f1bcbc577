//! Context services shared by every frame of an execution.
//!
//! The context owns the side tables bytecode operands index into: the
//! type table built by the semantic analyzer, the def/block registries,
//! resolved lib functions and their call interfaces, the interned symbol
//! table, the constant and class-variable pools, and the materialized
//! process arguments. Registries are append-only; after the compiler
//! finishes registering, execution only reads.

use super::ffi::{CallInterface, LibFunction};
use rustc_hash::FxHashMap;
use std::ffi::{CString, c_char};
use vesper_bytecode::{
    BlockRegistry, CompiledBlock, CompiledDef, DefRegistry,
};
use vesper_core::{
    BlockId, CifId, DefId, LibFnId, SymbolId, TypeId, TypeTable, VmError, VmResult,
};

/// Type ids the semantic analyzer assigned to the built-in exception
/// classes the VM raises itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct WellKnownTypes {
    pub overflow_error: Option<TypeId>,
    pub library_error: Option<TypeId>,
    pub out_of_memory_error: Option<TypeId>,
}

/// Interned symbols: compact integers mapping to strings.
///
/// Each symbol also owns a length-prefixed byte buffer (`[u32 len]`
/// followed by the UTF-8 bytes) whose address is stable, pushed by
/// `symbol_to_s`.
#[derive(Debug, Default)]
struct SymbolTable {
    names: Vec<String>,
    buffers: Vec<Box<[u8]>>,
    map: FxHashMap<String, SymbolId>,
}

impl SymbolTable {
    fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.map.get(name) {
            return id;
        }
        let id = SymbolId::new(self.names.len() as u32);
        let mut buffer = Vec::with_capacity(4 + name.len());
        buffer.extend_from_slice(&(name.len() as u32).to_ne_bytes());
        buffer.extend_from_slice(name.as_bytes());
        self.names.push(name.to_string());
        self.buffers.push(buffer.into_boxed_slice());
        self.map.insert(name.to_string(), id);
        id
    }

    fn name(&self, id: SymbolId) -> Option<&str> {
        self.names.get(id.index() as usize).map(|s| s.as_str())
    }

    fn buffer_ptr(&self, id: SymbolId) -> Option<*const u8> {
        self.buffers.get(id.index() as usize).map(|b| b.as_ptr())
    }
}

/// One lazily initialized storage slot (constant or class variable).
#[derive(Debug)]
struct LazySlot {
    data: Box<[u8]>,
    initialized: bool,
}

impl LazySlot {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            initialized: false,
        }
    }
}

/// The interpreter's read-mostly service hub.
pub struct Context {
    types: TypeTable,
    defs: DefRegistry,
    blocks: BlockRegistry,
    lib_functions: Vec<LibFunction>,
    interfaces: Vec<CallInterface>,
    symbols: SymbolTable,
    constants: Vec<LazySlot>,
    class_vars: Vec<LazySlot>,
    well_known: WellKnownTypes,
    args: Vec<CString>,
    argv: Box<[*const c_char]>,
}

impl Context {
    pub fn new(types: TypeTable) -> Self {
        Self {
            types,
            defs: DefRegistry::new(),
            blocks: BlockRegistry::new(),
            lib_functions: Vec::new(),
            interfaces: Vec::new(),
            symbols: SymbolTable::default(),
            constants: Vec::new(),
            class_vars: Vec::new(),
            well_known: WellKnownTypes::default(),
            args: Vec::new(),
            argv: Box::new([std::ptr::null()]),
        }
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    // =========================================================================
    // Defs and blocks
    // =========================================================================

    pub fn register_def(&mut self, def: CompiledDef) -> DefId {
        self.defs.register(def)
    }

    pub fn register_block(&mut self, block: CompiledBlock) -> BlockId {
        self.blocks.register(block)
    }

    pub fn defs(&self) -> &DefRegistry {
        &self.defs
    }

    pub fn blocks(&self) -> &BlockRegistry {
        &self.blocks
    }

    // =========================================================================
    // FFI side tables
    // =========================================================================

    pub fn register_interface(&mut self, interface: CallInterface) -> CifId {
        let id = CifId::new(self.interfaces.len() as u32);
        self.interfaces.push(interface);
        id
    }

    pub fn register_lib_function(&mut self, function: LibFunction) -> LibFnId {
        let id = LibFnId::new(self.lib_functions.len() as u32);
        self.lib_functions.push(function);
        id
    }

    pub fn interface(&self, index: u64) -> VmResult<&CallInterface> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.interfaces.get(i))
            .ok_or(VmError::BadSideTableIndex {
                table: "call interface",
                index,
            })
    }

    pub fn lib_function(&self, index: u64) -> VmResult<&LibFunction> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.lib_functions.get(i))
            .ok_or(VmError::BadSideTableIndex {
                table: "lib function",
                index,
            })
    }

    // =========================================================================
    // Symbols
    // =========================================================================

    pub fn intern(&mut self, name: &str) -> SymbolId {
        self.symbols.intern(name)
    }

    pub fn symbol_name(&self, id: SymbolId) -> Option<&str> {
        self.symbols.name(id)
    }

    /// Stable address of the symbol's length-prefixed string buffer.
    pub fn symbol_buffer_ptr(&self, id: SymbolId) -> Option<*const u8> {
        self.symbols.buffer_ptr(id)
    }

    // =========================================================================
    // Constants and class variables
    // =========================================================================

    pub fn register_const(&mut self, size: usize) -> u32 {
        self.constants.push(LazySlot::new(size));
        (self.constants.len() - 1) as u32
    }

    pub fn register_class_var(&mut self, size: usize) -> u32 {
        self.class_vars.push(LazySlot::new(size));
        (self.class_vars.len() - 1) as u32
    }

    fn const_slot(&mut self, index: u32) -> VmResult<&mut LazySlot> {
        self.constants
            .get_mut(index as usize)
            .ok_or(VmError::BadSideTableIndex {
                table: "constant",
                index: index as u64,
            })
    }

    fn class_var_slot(&mut self, index: u32) -> VmResult<&mut LazySlot> {
        self.class_vars
            .get_mut(index as usize)
            .ok_or(VmError::BadSideTableIndex {
                table: "class variable",
                index: index as u64,
            })
    }

    /// Returns the previous initialized flag and sets it, so the
    /// compiler's `initialized? / branch / compute / store` sequence is
    /// safe against reentry from cooperative fibers.
    pub fn const_initialized(&mut self, index: u32) -> VmResult<bool> {
        let slot = self.const_slot(index)?;
        let was = slot.initialized;
        slot.initialized = true;
        Ok(was)
    }

    pub fn const_read(&self, index: u32, size: usize) -> VmResult<&[u8]> {
        let slot = self
            .constants
            .get(index as usize)
            .ok_or(VmError::BadSideTableIndex {
                table: "constant",
                index: index as u64,
            })?;
        slot.data
            .get(..size)
            .ok_or_else(|| VmError::InvalidBytecode(format!("constant {index} read of {size} bytes")))
    }

    pub fn const_write(&mut self, index: u32, bytes: &[u8]) -> VmResult<()> {
        let slot = self.const_slot(index)?;
        let size = bytes.len();
        slot.data
            .get_mut(..size)
            .ok_or_else(|| {
                VmError::InvalidBytecode(format!("constant {index} write of {size} bytes"))
            })?
            .copy_from_slice(bytes);
        Ok(())
    }

    pub fn class_var_initialized(&mut self, index: u32) -> VmResult<bool> {
        let slot = self.class_var_slot(index)?;
        let was = slot.initialized;
        slot.initialized = true;
        Ok(was)
    }

    pub fn class_var_read(&self, index: u32, size: usize) -> VmResult<&[u8]> {
        let slot = self
            .class_vars
            .get(index as usize)
            .ok_or(VmError::BadSideTableIndex {
                table: "class variable",
                index: index as u64,
            })?;
        slot.data.get(..size).ok_or_else(|| {
            VmError::InvalidBytecode(format!("class variable {index} read of {size} bytes"))
        })
    }

    pub fn class_var_write(&mut self, index: u32, bytes: &[u8]) -> VmResult<()> {
        let slot = self.class_var_slot(index)?;
        let size = bytes.len();
        slot.data
            .get_mut(..size)
            .ok_or_else(|| {
                VmError::InvalidBytecode(format!("class variable {index} write of {size} bytes"))
            })?
            .copy_from_slice(bytes);
        Ok(())
    }

    // =========================================================================
    // Well-known types and process arguments
    // =========================================================================

    pub fn set_well_known(&mut self, well_known: WellKnownTypes) {
        self.well_known = well_known;
    }

    pub fn well_known(&self) -> &WellKnownTypes {
        &self.well_known
    }

    /// Materialize the process argument vector in C form.
    pub fn set_args(&mut self, args: impl IntoIterator<Item = String>) {
        self.args = args
            .into_iter()
            .map(|a| CString::new(a).unwrap_or_default())
            .collect();
        let mut ptrs: Vec<*const c_char> = self.args.iter().map(|c| c.as_ptr()).collect();
        ptrs.push(std::ptr::null());
        self.argv = ptrs.into_boxed_slice();
    }

    pub fn argc(&self) -> i32 {
        self.args.len() as i32
    }

    /// Null-terminated `char**`, stable until the next `set_args`.
    pub fn argv(&self) -> *const *const c_char {
        self.argv.as_ptr()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("types", &self.types.len())
            .field("defs", &self.defs.len())
            .field("constants", &self.constants.len())
            .field("lib_functions", &self.lib_functions.len())
            .finish()
    }
}
