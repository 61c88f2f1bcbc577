//! The fetch-decode-dispatch execution engine.
//!
//! A classic interpreter loop: the instruction pointer indexes into the
//! current frame's bytecode; each opcode reads its inline operands, pops
//! its stack inputs, executes, and pushes at most one result. Dispatch is
//! a single exhaustive `match` over [`OpCode`].
//!
//! Call protocol: arguments are pushed left to right; `call` turns them
//! into the lowest slots of a zeroed local frame. `leave` copies the
//! return value over the whole callee frame. Exceptions unwind through
//! the per-chunk handler interval tables; anything uncaught surfaces as
//! [`VmError::UncaughtException`].
//!
//! Frames reference chunks through raw pointers. This is sound because
//! the def/block registries are append-only and box their entries, so a
//! registered chunk never moves or disappears while the VM lives.

use super::context::Context;
use super::ffi::{self, ClosureRegistry, ClosureUser};
use super::fiber::{FiberHost, FiberState, InlineFiberHost};
use super::heap::Heap;
use super::stack::{DEFAULT_STACK_CAPACITY, OperandStack};
use super::trap::{FrameView, Inspector, VmView};
use rustc_hash::FxHashMap;
use std::ffi::c_void;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicU8, AtomicU16, AtomicU32, AtomicU64,
};
use vesper_bytecode::{AtomicRmwOp, Chunk, OpCode};
use vesper_core::{
    BlockId, CELL_HEADER_SIZE, DefId, PrimitiveKind, TypeFlags, TypeId, TypeKind, VmError,
    VmResult, WORD_SIZE,
};

/// Tunables of one interpreter instance.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Operand stack capacity per fiber, in bytes.
    pub stack_capacity: usize,
    /// Maximum frame depth before a call is rejected.
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_capacity: DEFAULT_STACK_CAPACITY,
            max_call_depth: 2048,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameCode {
    Def(DefId),
    Block(BlockId),
}

/// Where a bound block executes: the frame that bound it supplies the
/// locals region and receiver its body addresses.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockContext {
    pub block: BlockId,
    pub definer_base: usize,
    pub definer_self: *mut u8,
}

/// One entry of the frame stack.
pub(crate) struct Frame {
    pub code: FrameCode,
    pub chunk: *const Chunk,
    /// Base of the locals region. Block frames alias their definer's.
    pub frame_base: usize,
    /// Stack pointer the frame's return value is copied down to.
    pub entry_sp: usize,
    /// Caller offset execution resumes at after this frame returns.
    pub return_ip: usize,
    pub self_ptr: *mut u8,
    /// Block bound by `call_with_block`, consumed by `call_block`.
    pub block_ctx: Option<BlockContext>,
}

enum BuiltinError {
    Overflow,
    Library,
    OutOfMemory,
}

/// The virtual machine.
pub struct Interpreter {
    context: Context,
    config: VmConfig,
    heap: Heap,
    stack: OperandStack,
    frames: Vec<Frame>,
    ip: usize,
    /// Frame depth the active `run` invocation must not unwind past.
    run_barrier: usize,
    current_fiber: u64,
    fiber_states: FxHashMap<u64, FiberState>,
    host: Box<dyn FiberHost>,
    inspector: Option<Box<dyn Inspector>>,
    closures: ClosureRegistry,
    last_exception: u64,
    exception_messages: FxHashMap<usize, String>,
    scratch: Vec<u8>,
}

impl Interpreter {
    pub fn new(context: Context) -> Self {
        Self::with_config(context, VmConfig::default())
    }

    pub fn with_config(context: Context, config: VmConfig) -> Self {
        let host: Box<dyn FiberHost> = Box::new(InlineFiberHost);
        log::debug!(
            "interpreter created: {} types, {} defs, stack {} bytes",
            context.types().len(),
            context.defs().len(),
            config.stack_capacity
        );
        Self {
            stack: OperandStack::new(config.stack_capacity),
            current_fiber: host.current(),
            context,
            config,
            heap: Heap::new(),
            frames: Vec::new(),
            ip: 0,
            run_barrier: 0,
            fiber_states: FxHashMap::default(),
            host,
            inspector: None,
            closures: ClosureRegistry::default(),
            last_exception: 0,
            exception_messages: FxHashMap::default(),
            scratch: Vec::new(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn stack(&self) -> &OperandStack {
        &self.stack
    }

    /// Mutable stack access, used by embedders to push arguments before
    /// [`Interpreter::execute`].
    pub fn stack_mut(&mut self) -> &mut OperandStack {
        &mut self.stack
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn set_inspector(&mut self, inspector: Box<dyn Inspector>) {
        self.inspector = Some(inspector);
    }

    pub fn set_fiber_host(&mut self, host: Box<dyn FiberHost>) {
        self.current_fiber = host.current();
        self.host = host;
    }

    /// Message recorded when the VM itself raised the given exception
    /// cell (overflow, FFI failure, out of memory).
    pub fn exception_message(&self, exception: *const u8) -> Option<&str> {
        self.exception_messages
            .get(&(exception as usize))
            .map(|s| s.as_str())
    }

    // =========================================================================
    // Execution entry points
    // =========================================================================

    /// Run a compiled def whose arguments were already pushed; returns
    /// the return value's semantic bytes.
    pub fn execute(&mut self, def: DefId) -> VmResult<Vec<u8>> {
        let return_size = self
            .context
            .defs()
            .lookup(def.index() as u64)?
            .return_size as usize;
        self.call_def_index(def.index() as u64, None)?;
        self.run()?;
        let mut out = vec![0u8; return_size];
        self.stack.pop_bytes(return_size, &mut out);
        Ok(out)
    }

    /// Re-entry path for libffi closures: push the C arguments, run the
    /// proc's def, hand back up to one word of return bytes.
    pub(crate) fn enter_from_c(
        &mut self,
        user: &ClosureUser,
        args: *const *const c_void,
        result: &mut u64,
    ) -> VmResult<()> {
        for (i, ty) in user.iface.args.iter().enumerate() {
            let src = unsafe { *args.add(i) } as *const u8;
            let bytes = unsafe { std::slice::from_raw_parts(src, ty.size()) };
            self.stack.push_bytes(bytes)?;
        }
        if user.closure_data != 0 {
            self.stack.push_u64(user.closure_data)?;
        }
        let return_size = self.context.defs().lookup(user.def_index)?.return_size as usize;
        if return_size > WORD_SIZE {
            return Err(VmError::Ffi(
                "aggregate returns across the closure bridge are not supported".into(),
            ));
        }
        self.call_def_index(user.def_index, None)?;
        self.run()?;
        let mut buf = [0u8; WORD_SIZE];
        self.stack.pop_bytes(return_size, &mut buf);
        *result = u64::from_ne_bytes(buf);
        Ok(())
    }

    fn run(&mut self) -> VmResult<()> {
        let saved = self.run_barrier;
        self.run_barrier = self.frames.len().saturating_sub(1);
        let result = loop {
            if self.frames.len() <= self.run_barrier {
                break Ok(());
            }
            if let Err(err) = self.step() {
                break Err(err);
            }
        };
        self.run_barrier = saved;
        result
    }

    // =========================================================================
    // Frame machinery
    // =========================================================================

    fn cur_frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    fn call_def_index(&mut self, index: u64, block_ctx: Option<BlockContext>) -> VmResult<()> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(VmError::CallDepthExceeded {
                max: self.config.max_call_depth,
            });
        }
        let def = self.context.defs().lookup(index)?;
        let chunk = &def.chunk as *const Chunk;
        let args_size = def.args_size as usize;
        let frame_size = (def.frame_size as usize).max(args_size);
        let takes_self = def.takes_self;
        log::trace!("call {} (frame {frame_size} bytes)", def.name);
        let frame_base = self.stack.sp() - args_size;
        self.stack.extend_to(frame_base + frame_size)?;
        let self_ptr = if takes_self {
            self.stack.read_u64_at(frame_base) as *mut u8
        } else {
            std::ptr::null_mut()
        };
        self.frames.push(Frame {
            code: FrameCode::Def(DefId::new(index as u32)),
            chunk,
            frame_base,
            entry_sp: frame_base,
            return_ip: self.ip,
            self_ptr,
            block_ctx,
        });
        self.ip = 0;
        Ok(())
    }

    fn call_block_index(&mut self, index: u64) -> VmResult<()> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(VmError::CallDepthExceeded {
                max: self.config.max_call_depth,
            });
        }
        let ctx = self
            .frames
            .iter()
            .rev()
            .find_map(|f| match f.code {
                FrameCode::Def(_) => Some(f.block_ctx),
                FrameCode::Block(_) => None,
            })
            .flatten()
            .ok_or_else(|| {
                VmError::InvalidBytecode("call_block outside a call_with_block frame".into())
            })?;
        let block = self.context.blocks().lookup(index)?;
        let args_size = block.args_size as usize;
        let args_offset = block.args_offset as usize;
        let chunk = &block.chunk as *const Chunk;
        log::trace!("yield {} ({args_size} arg bytes)", block.name);
        if args_size > 0 {
            self.stack
                .pop_to_within(ctx.definer_base + args_offset, args_size);
        }
        self.frames.push(Frame {
            code: FrameCode::Block(BlockId::new(index as u32)),
            chunk,
            frame_base: ctx.definer_base,
            entry_sp: self.stack.sp(),
            return_ip: self.ip,
            self_ptr: ctx.definer_self,
            block_ctx: None,
        });
        self.ip = 0;
        Ok(())
    }

    fn leave_frame(&mut self, size: usize) {
        let frame = self.frames.pop().expect("no active frame");
        self.stack.return_value(frame.entry_sp, size);
        self.ip = frame.return_ip;
    }

    fn leave_def(&mut self, size: usize) -> VmResult<()> {
        let target_base = self.cur_frame().frame_base;
        loop {
            if self.frames.len() <= self.run_barrier {
                return Err(VmError::InvalidBytecode(
                    "leave_def unwound past the execution boundary".into(),
                ));
            }
            let frame = self.frames.pop().expect("no active frame");
            if matches!(frame.code, FrameCode::Def(_)) && frame.frame_base == target_base {
                self.stack.return_value(frame.entry_sp, size);
                self.ip = frame.return_ip;
                return Ok(());
            }
        }
    }

    fn break_block(&mut self, size: usize) -> VmResult<()> {
        loop {
            if self.frames.len() <= self.run_barrier {
                return Err(VmError::InvalidBytecode(
                    "break_block unwound past the execution boundary".into(),
                ));
            }
            let frame = self.frames.pop().expect("no active frame");
            match frame.code {
                FrameCode::Block(_) => continue,
                FrameCode::Def(_) => {
                    self.stack.return_value(frame.entry_sp, size);
                    self.ip = frame.return_ip;
                    return Ok(());
                }
            }
        }
    }

    fn frame_name(&self, frame: &Frame) -> String {
        match frame.code {
            FrameCode::Def(id) => self
                .context
                .defs()
                .get(id)
                .map(|d| d.name.clone())
                .unwrap_or_else(|| id.to_string()),
            FrameCode::Block(id) => self
                .context
                .blocks()
                .get(id)
                .map(|b| b.name.clone())
                .unwrap_or_else(|| id.to_string()),
        }
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    fn raise(&mut self, exception: *mut u8) -> VmResult<()> {
        let tid = Heap::cell_type_id(exception);
        log::trace!("raise {tid} at ip {}", self.ip);
        let mut ip = self.ip;
        while self.frames.len() > self.run_barrier {
            let frame = self.frames.last().expect("no active frame");
            let chunk = unsafe { &*frame.chunk };
            let base = match frame.code {
                FrameCode::Def(_) => frame.frame_base,
                FrameCode::Block(_) => frame.entry_sp,
            };
            let handler = chunk.handlers_covering(ip).find(|h| {
                h.catch_types.is_empty()
                    || h.catch_types
                        .iter()
                        .any(|&t| self.context.types().is_subtype(tid, t))
            });
            if let Some(handler) = handler {
                let target = handler.target as usize;
                let depth = handler.stack_depth as usize;
                self.stack.truncate(base + depth);
                self.stack.push_ptr(exception)?;
                self.ip = target;
                self.last_exception = exception as u64;
                return Ok(());
            }
            let frame = self.frames.pop().expect("no active frame");
            self.stack.truncate(frame.entry_sp);
            ip = frame.return_ip;
        }
        Err(self.uncaught(tid, exception))
    }

    fn uncaught(&self, tid: TypeId, exception: *mut u8) -> VmError {
        let type_name = self
            .context
            .types()
            .get(tid)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| tid.to_string());
        let frame = match self.frames.last() {
            Some(f) => self.frame_name(f),
            None => "<top level>".to_string(),
        };
        let type_name = match self.exception_message(exception) {
            Some(msg) => format!("{type_name}: {msg}"),
            None => type_name,
        };
        VmError::UncaughtException {
            type_id: tid,
            type_name,
            frame,
        }
    }

    fn raise_builtin(&mut self, kind: BuiltinError, message: &str) -> VmResult<()> {
        let (tid, label) = match kind {
            BuiltinError::Overflow => (self.context.well_known().overflow_error, "OverflowError"),
            BuiltinError::Library => (self.context.well_known().library_error, "LibraryError"),
            BuiltinError::OutOfMemory => (
                self.context.well_known().out_of_memory_error,
                "OutOfMemoryError",
            ),
        };
        let tid = tid.ok_or(VmError::MissingWellKnownType(label))?;
        let size = self
            .context
            .types()
            .get(tid)
            .map(|d| d.size as usize)
            .unwrap_or(CELL_HEADER_SIZE);
        let cell = self
            .heap
            .allocate_class(size, tid)
            .ok_or_else(|| VmError::Unreachable("allocator failed while raising".into()))?;
        self.exception_messages
            .insert(cell as usize, message.to_string());
        log::trace!("raise {label}: {message}");
        self.raise(cell)
    }

    // =========================================================================
    // Operand fetch
    // =========================================================================

    fn fetch_op(&mut self, chunk: &Chunk) -> VmResult<OpCode> {
        let offset = self.ip;
        let byte = chunk
            .read_u8(offset)
            .ok_or(VmError::TruncatedBytecode(offset))?;
        let op = OpCode::try_from(byte).map_err(|_| VmError::InvalidOpcode {
            opcode: byte,
            offset,
        })?;
        self.ip += 1;
        Ok(op)
    }

    fn fetch_u8(&mut self, chunk: &Chunk) -> VmResult<u8> {
        let v = chunk
            .read_u8(self.ip)
            .ok_or(VmError::TruncatedBytecode(self.ip))?;
        self.ip += 1;
        Ok(v)
    }

    fn fetch_u32(&mut self, chunk: &Chunk) -> VmResult<u32> {
        let v = chunk
            .read_u32(self.ip)
            .ok_or(VmError::TruncatedBytecode(self.ip))?;
        self.ip += 4;
        Ok(v)
    }

    fn fetch_u64(&mut self, chunk: &Chunk) -> VmResult<u64> {
        let v = chunk
            .read_u64(self.ip)
            .ok_or(VmError::TruncatedBytecode(self.ip))?;
        self.ip += 8;
        Ok(v)
    }

    fn fetch_i64(&mut self, chunk: &Chunk) -> VmResult<i64> {
        self.fetch_u64(chunk).map(|v| v as i64)
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    #[allow(clippy::too_many_lines)]
    fn step(&mut self) -> VmResult<()> {
        macro_rules! checked_arith {
            ($pop:ident, $push:ident, $method:ident) => {{
                let b = self.stack.$pop();
                let a = self.stack.$pop();
                match a.$method(b) {
                    Some(v) => self.stack.$push(v)?,
                    None => self.raise_builtin(BuiltinError::Overflow, "arithmetic overflow")?,
                }
            }};
        }
        macro_rules! wrap_arith {
            ($pop:ident, $push:ident, $method:ident) => {{
                let b = self.stack.$pop();
                let a = self.stack.$pop();
                self.stack.$push(a.$method(b))?;
            }};
        }
        macro_rules! float_arith {
            ($pop:ident, $push:ident, $op:tt) => {{
                let b = self.stack.$pop();
                let a = self.stack.$pop();
                self.stack.$push(a $op b)?;
            }};
        }
        macro_rules! unsafe_div {
            ($pop:ident, $push:ident, $method:ident) => {{
                let b = self.stack.$pop();
                let a = self.stack.$pop();
                if b == 0 {
                    return Err(VmError::InvalidBytecode(
                        "unchecked division by zero".into(),
                    ));
                }
                self.stack.$push(a.$method(b))?;
            }};
        }
        macro_rules! cmp_values {
            ($pop:ident) => {{
                let b = self.stack.$pop();
                let a = self.stack.$pop();
                // NaN falls through to +1, matching the native lowering.
                let tri = if a < b {
                    -1
                } else if a == b {
                    0
                } else {
                    1
                };
                self.stack.push_i32(tri)?;
            }};
        }
        macro_rules! cmp_fold {
            ($op:tt) => {{
                let tri = self.stack.pop_i32();
                self.stack.push_bool(tri $op 0)?;
            }};
        }
        macro_rules! math_unary {
            ($pop:ident, $push:ident, $method:ident) => {{
                let v = self.stack.$pop();
                self.stack.$push(v.$method())?;
            }};
        }
        macro_rules! math_binary {
            ($pop:ident, $push:ident, $method:ident) => {{
                let b = self.stack.$pop();
                let a = self.stack.$pop();
                self.stack.$push(a.$method(b))?;
            }};
        }
        macro_rules! atomic_rmw_width {
            ($rmw:ident, $uty:ty, $ity:ty, $atom_u:ident, $atom_i:ident,
             $pop:ident, $push:ident) => {{
                let operand = self.stack.$pop();
                let ptr = self.stack.pop_ptr();
                let prev = unsafe {
                    match $rmw {
                        AtomicRmwOp::Add => $atom_u::from_ptr(ptr as *mut $uty).fetch_add(operand, SeqCst),
                        AtomicRmwOp::Sub => $atom_u::from_ptr(ptr as *mut $uty).fetch_sub(operand, SeqCst),
                        AtomicRmwOp::And => $atom_u::from_ptr(ptr as *mut $uty).fetch_and(operand, SeqCst),
                        AtomicRmwOp::Nand => $atom_u::from_ptr(ptr as *mut $uty).fetch_nand(operand, SeqCst),
                        AtomicRmwOp::Or => $atom_u::from_ptr(ptr as *mut $uty).fetch_or(operand, SeqCst),
                        AtomicRmwOp::Xor => $atom_u::from_ptr(ptr as *mut $uty).fetch_xor(operand, SeqCst),
                        AtomicRmwOp::Xchg => $atom_u::from_ptr(ptr as *mut $uty).swap(operand, SeqCst),
                        AtomicRmwOp::Max => $atom_i::from_ptr(ptr as *mut $ity)
                            .fetch_max(operand as $ity, SeqCst) as $uty,
                        AtomicRmwOp::Min => $atom_i::from_ptr(ptr as *mut $ity)
                            .fetch_min(operand as $ity, SeqCst) as $uty,
                        AtomicRmwOp::UMax => $atom_u::from_ptr(ptr as *mut $uty).fetch_max(operand, SeqCst),
                        AtomicRmwOp::UMin => $atom_u::from_ptr(ptr as *mut $uty).fetch_min(operand, SeqCst),
                    }
                };
                self.stack.$push(prev)?;
            }};
        }
        macro_rules! cmpxchg_width {
            ($uty:ty, $atom_u:ident, $pop:ident, $push:ident) => {{
                let desired = self.stack.$pop();
                let expected = self.stack.$pop();
                let ptr = self.stack.pop_ptr();
                let outcome = unsafe {
                    $atom_u::from_ptr(ptr as *mut $uty)
                        .compare_exchange(expected, desired, SeqCst, SeqCst)
                };
                let (prev, ok) = match outcome {
                    Ok(v) => (v, true),
                    Err(v) => (v, false),
                };
                self.stack.$push(prev)?;
                self.stack.push_bool(ok)?;
            }};
        }

        let chunk_ptr = self.cur_frame().chunk;
        // Sound: chunks live in boxed, append-only registries.
        let chunk = unsafe { &*chunk_ptr };
        let op = self.fetch_op(chunk)?;

        match op {
            // =================================================================
            // Literals
            // =================================================================
            OpCode::PutNil => {}
            OpCode::PutI64 => {
                let v = self.fetch_i64(chunk)?;
                self.stack.push_i64(v)?;
            }

            // =================================================================
            // Numeric conversions
            // =================================================================
            OpCode::I8ToF32 => {
                let v = self.stack.pop_u8() as i8;
                self.stack.push_f32(v as f32)?;
            }
            OpCode::I8ToF64 => {
                let v = self.stack.pop_u8() as i8;
                self.stack.push_f64(v as f64)?;
            }
            OpCode::I16ToF32 => {
                let v = self.stack.pop_u16() as i16;
                self.stack.push_f32(v as f32)?;
            }
            OpCode::I16ToF64 => {
                let v = self.stack.pop_u16() as i16;
                self.stack.push_f64(v as f64)?;
            }
            OpCode::I32ToF32 => {
                let v = self.stack.pop_i32();
                self.stack.push_f32(v as f32)?;
            }
            OpCode::I32ToF64 => {
                let v = self.stack.pop_i32();
                self.stack.push_f64(v as f64)?;
            }
            OpCode::I64ToF32 => {
                let v = self.stack.pop_i64();
                self.stack.push_f32(v as f32)?;
            }
            OpCode::I64ToF64 => {
                let v = self.stack.pop_i64();
                self.stack.push_f64(v as f64)?;
            }
            OpCode::U8ToF32 => {
                let v = self.stack.pop_u8();
                self.stack.push_f32(v as f32)?;
            }
            OpCode::U8ToF64 => {
                let v = self.stack.pop_u8();
                self.stack.push_f64(v as f64)?;
            }
            OpCode::U16ToF32 => {
                let v = self.stack.pop_u16();
                self.stack.push_f32(v as f32)?;
            }
            OpCode::U16ToF64 => {
                let v = self.stack.pop_u16();
                self.stack.push_f64(v as f64)?;
            }
            OpCode::U32ToF32 => {
                let v = self.stack.pop_u32();
                self.stack.push_f32(v as f32)?;
            }
            OpCode::U32ToF64 => {
                let v = self.stack.pop_u32();
                self.stack.push_f64(v as f64)?;
            }
            OpCode::U64ToF32 => {
                let v = self.stack.pop_u64();
                self.stack.push_f32(v as f32)?;
            }
            OpCode::U64ToF64 => {
                let v = self.stack.pop_u64();
                self.stack.push_f64(v as f64)?;
            }
            OpCode::F32ToF64 => {
                let v = self.stack.pop_f32();
                self.stack.push_f64(v as f64)?;
            }
            OpCode::F64ToF32 => {
                let v = self.stack.pop_f64();
                self.stack.push_f32(v as f32)?;
            }
            OpCode::F64ToI64Trunc => {
                let v = self.stack.pop_f64();
                let truncated = if v.is_nan() { 0 } else { v as i128 as i64 };
                self.stack.push_i64(truncated)?;
            }
            OpCode::SignExtend => {
                let fill = self.fetch_u32(chunk)? as usize;
                let shift = (fill * 8).min(63) as u32;
                let raw = self.stack.pop_u64();
                let v = (((raw << shift) as i64) >> shift) as u64;
                self.stack.push_u64(v)?;
            }
            OpCode::ZeroExtend => {
                let fill = self.fetch_u32(chunk)? as usize;
                let shift = (fill * 8).min(63) as u32;
                let raw = self.stack.pop_u64();
                self.stack.push_u64((raw << shift) >> shift)?;
            }

            // =================================================================
            // Integer arithmetic
            // =================================================================
            OpCode::AddI32 => checked_arith!(pop_i32, push_i32, checked_add),
            OpCode::SubI32 => checked_arith!(pop_i32, push_i32, checked_sub),
            OpCode::MulI32 => checked_arith!(pop_i32, push_i32, checked_mul),
            OpCode::AddU32 => checked_arith!(pop_u32, push_u32, checked_add),
            OpCode::SubU32 => checked_arith!(pop_u32, push_u32, checked_sub),
            OpCode::MulU32 => checked_arith!(pop_u32, push_u32, checked_mul),
            OpCode::AddI64 => checked_arith!(pop_i64, push_i64, checked_add),
            OpCode::SubI64 => checked_arith!(pop_i64, push_i64, checked_sub),
            OpCode::MulI64 => checked_arith!(pop_i64, push_i64, checked_mul),
            OpCode::AddU64 => checked_arith!(pop_u64, push_u64, checked_add),
            OpCode::SubU64 => checked_arith!(pop_u64, push_u64, checked_sub),
            OpCode::MulU64 => checked_arith!(pop_u64, push_u64, checked_mul),
            OpCode::AddU64I64 => {
                let b = self.stack.pop_i64();
                let a = self.stack.pop_u64();
                let r = if b >= 0 {
                    a.checked_add(b as u64)
                } else {
                    a.checked_sub(b.unsigned_abs())
                };
                match r {
                    Some(v) => self.stack.push_u64(v)?,
                    None => self.raise_builtin(BuiltinError::Overflow, "arithmetic overflow")?,
                }
            }
            OpCode::SubU64I64 => {
                let b = self.stack.pop_i64();
                let a = self.stack.pop_u64();
                let r = if b >= 0 {
                    a.checked_sub(b as u64)
                } else {
                    a.checked_add(b.unsigned_abs())
                };
                match r {
                    Some(v) => self.stack.push_u64(v)?,
                    None => self.raise_builtin(BuiltinError::Overflow, "arithmetic overflow")?,
                }
            }
            OpCode::MulU64I64 => {
                let b = self.stack.pop_i64();
                let a = self.stack.pop_u64();
                let r = if b >= 0 {
                    a.checked_mul(b as u64)
                } else if a == 0 {
                    Some(0)
                } else {
                    None
                };
                match r {
                    Some(v) => self.stack.push_u64(v)?,
                    None => self.raise_builtin(BuiltinError::Overflow, "arithmetic overflow")?,
                }
            }
            OpCode::AddWrapI32 => wrap_arith!(pop_u32, push_u32, wrapping_add),
            OpCode::SubWrapI32 => wrap_arith!(pop_u32, push_u32, wrapping_sub),
            OpCode::MulWrapI32 => wrap_arith!(pop_u32, push_u32, wrapping_mul),
            OpCode::AddWrapI64 => wrap_arith!(pop_u64, push_u64, wrapping_add),
            OpCode::SubWrapI64 => wrap_arith!(pop_u64, push_u64, wrapping_sub),
            OpCode::MulWrapI64 => wrap_arith!(pop_u64, push_u64, wrapping_mul),

            // =================================================================
            // Float arithmetic
            // =================================================================
            OpCode::AddF32 => float_arith!(pop_f32, push_f32, +),
            OpCode::SubF32 => float_arith!(pop_f32, push_f32, -),
            OpCode::MulF32 => float_arith!(pop_f32, push_f32, *),
            OpCode::DivF32 => float_arith!(pop_f32, push_f32, /),
            OpCode::AddF64 => float_arith!(pop_f64, push_f64, +),
            OpCode::SubF64 => float_arith!(pop_f64, push_f64, -),
            OpCode::MulF64 => float_arith!(pop_f64, push_f64, *),
            OpCode::DivF64 => float_arith!(pop_f64, push_f64, /),

            // =================================================================
            // Unchecked division
            // =================================================================
            OpCode::UnsafeDivI32 => unsafe_div!(pop_i32, push_i32, wrapping_div),
            OpCode::UnsafeDivU32 => unsafe_div!(pop_u32, push_u32, wrapping_div),
            OpCode::UnsafeDivI64 => unsafe_div!(pop_i64, push_i64, wrapping_div),
            OpCode::UnsafeDivU64 => unsafe_div!(pop_u64, push_u64, wrapping_div),
            OpCode::UnsafeModI32 => unsafe_div!(pop_i32, push_i32, wrapping_rem),
            OpCode::UnsafeModU32 => unsafe_div!(pop_u32, push_u32, wrapping_rem),
            OpCode::UnsafeModI64 => unsafe_div!(pop_i64, push_i64, wrapping_rem),
            OpCode::UnsafeModU64 => unsafe_div!(pop_u64, push_u64, wrapping_rem),

            // =================================================================
            // Comparisons
            // =================================================================
            OpCode::CmpI32 => cmp_values!(pop_i32),
            OpCode::CmpU32 => cmp_values!(pop_u32),
            OpCode::CmpI64 => cmp_values!(pop_i64),
            OpCode::CmpU64 => cmp_values!(pop_u64),
            OpCode::CmpU64I64 => {
                let b = self.stack.pop_i64();
                let a = self.stack.pop_u64();
                let tri = if b < 0 {
                    1
                } else {
                    let b = b as u64;
                    if a < b {
                        -1
                    } else if a == b {
                        0
                    } else {
                        1
                    }
                };
                self.stack.push_i32(tri)?;
            }
            OpCode::CmpI64U64 => {
                let b = self.stack.pop_u64();
                let a = self.stack.pop_i64();
                let tri = if a < 0 {
                    -1
                } else {
                    let a = a as u64;
                    if a < b {
                        -1
                    } else if a == b {
                        0
                    } else {
                        1
                    }
                };
                self.stack.push_i32(tri)?;
            }
            OpCode::CmpF32 => cmp_values!(pop_f32),
            OpCode::CmpF64 => cmp_values!(pop_f64),
            OpCode::CmpEq => cmp_fold!(==),
            OpCode::CmpNeq => cmp_fold!(!=),
            OpCode::CmpLt => cmp_fold!(<),
            OpCode::CmpLe => cmp_fold!(<=),
            OpCode::CmpGt => cmp_fold!(>),
            OpCode::CmpGe => cmp_fold!(>=),

            // =================================================================
            // Pointers
            // =================================================================
            OpCode::PointerMalloc => {
                let elem_size = self.fetch_u32(chunk)? as u64;
                let count = self.stack.pop_i64();
                let bytes = (count.max(0) as u64).checked_mul(elem_size);
                match bytes.and_then(|b| self.heap.malloc(b as usize)) {
                    Some(ptr) => self.stack.push_ptr(ptr)?,
                    None => self.raise_builtin(BuiltinError::OutOfMemory, "pointer_malloc failed")?,
                }
            }
            OpCode::PointerRealloc => {
                let elem_size = self.fetch_u32(chunk)? as u64;
                let count = self.stack.pop_i64();
                let ptr = self.stack.pop_ptr();
                let bytes = (count.max(0) as u64).checked_mul(elem_size);
                let grown = bytes.and_then(|b| unsafe { self.heap.realloc(ptr, b as usize) });
                match grown {
                    Some(p) => self.stack.push_ptr(p)?,
                    None => {
                        self.raise_builtin(BuiltinError::OutOfMemory, "pointer_realloc failed")?
                    }
                }
            }
            OpCode::PointerSet => {
                let elem_size = self.fetch_u32(chunk)? as usize;
                let mut scratch = std::mem::take(&mut self.scratch);
                scratch.resize(elem_size, 0);
                self.stack.pop_bytes(elem_size, &mut scratch);
                let ptr = self.stack.pop_ptr();
                if ptr.is_null() {
                    return Err(VmError::InvalidBytecode("pointer_set through null".into()));
                }
                unsafe { std::ptr::copy_nonoverlapping(scratch.as_ptr(), ptr, elem_size) };
                self.scratch = scratch;
            }
            OpCode::PointerGet => {
                let elem_size = self.fetch_u32(chunk)? as usize;
                let ptr = self.stack.pop_ptr();
                if ptr.is_null() {
                    return Err(VmError::InvalidBytecode("pointer_get through null".into()));
                }
                let bytes = unsafe { std::slice::from_raw_parts(ptr, elem_size) };
                self.stack.push_bytes(bytes)?;
            }
            OpCode::PointerNew | OpCode::PointerAddress => {
                // Identity on bits; exists for the type system's benefit.
            }
            OpCode::PointerAdd => {
                let elem_size = self.fetch_u32(chunk)? as i64;
                let offset = self.stack.pop_i64();
                let ptr = self.stack.pop_u64();
                let moved = (ptr as i64).wrapping_add(offset.wrapping_mul(elem_size)) as u64;
                self.stack.push_u64(moved)?;
            }
            OpCode::PointerDiff => {
                let elem_size = self.fetch_u32(chunk)? as i64;
                let b = self.stack.pop_u64();
                let a = self.stack.pop_u64();
                if elem_size == 0 {
                    return Err(VmError::InvalidBytecode("pointer_diff elem size 0".into()));
                }
                let diff = (a as i64).wrapping_sub(b as i64).div_euclid(elem_size);
                self.stack.push_i64(diff)?;
            }
            OpCode::PointerIsNull => {
                let ptr = self.stack.pop_u64();
                self.stack.push_bool(ptr == 0)?;
            }
            OpCode::PointerIsNotNull => {
                let ptr = self.stack.pop_u64();
                self.stack.push_bool(ptr != 0)?;
            }

            // =================================================================
            // Locals
            // =================================================================
            OpCode::SetLocal => {
                let offset = self.fetch_u32(chunk)? as usize;
                let size = self.fetch_u32(chunk)? as usize;
                let base = self.cur_frame().frame_base;
                self.stack.pop_to_within(base + offset, size);
            }
            OpCode::GetLocal => {
                let offset = self.fetch_u32(chunk)? as usize;
                let size = self.fetch_u32(chunk)? as usize;
                let base = self.cur_frame().frame_base;
                self.stack.push_from_within(base + offset, size)?;
            }

            // =================================================================
            // Instance variables
            // =================================================================
            OpCode::GetSelfIvar => {
                let offset = self.fetch_u32(chunk)? as usize;
                let size = self.fetch_u32(chunk)? as usize;
                let receiver = self.cur_frame().self_ptr;
                if receiver.is_null() {
                    return Err(VmError::InvalidBytecode("get_self_ivar without self".into()));
                }
                let bytes = unsafe { std::slice::from_raw_parts(receiver.add(offset), size) };
                self.stack.push_bytes(bytes)?;
            }
            OpCode::SetSelfIvar => {
                let offset = self.fetch_u32(chunk)? as usize;
                let size = self.fetch_u32(chunk)? as usize;
                let receiver = self.cur_frame().self_ptr;
                if receiver.is_null() {
                    return Err(VmError::InvalidBytecode("set_self_ivar without self".into()));
                }
                let mut scratch = std::mem::take(&mut self.scratch);
                scratch.resize(size, 0);
                self.stack.pop_bytes(size, &mut scratch);
                unsafe {
                    std::ptr::copy_nonoverlapping(scratch.as_ptr(), receiver.add(offset), size)
                };
                self.scratch = scratch;
            }
            OpCode::GetClassIvar => {
                let offset = self.fetch_u32(chunk)? as usize;
                let size = self.fetch_u32(chunk)? as usize;
                let receiver = self.stack.pop_ptr();
                if receiver.is_null() {
                    return Err(VmError::InvalidBytecode(
                        "get_class_ivar through null".into(),
                    ));
                }
                let bytes = unsafe { std::slice::from_raw_parts(receiver.add(offset), size) };
                self.stack.push_bytes(bytes)?;
            }
            OpCode::GetStructIvar => {
                let offset = self.fetch_u32(chunk)? as usize;
                let size = self.fetch_u32(chunk)? as usize;
                let total = self.fetch_u32(chunk)? as usize;
                self.stack.extract_field(total, offset, size);
            }

            // =================================================================
            // Constants and class variables
            // =================================================================
            OpCode::ConstInitialized => {
                let index = self.fetch_u32(chunk)?;
                let was = self.context.const_initialized(index)?;
                self.stack.push_bool(was)?;
            }
            OpCode::GetConst => {
                let index = self.fetch_u32(chunk)?;
                let size = self.fetch_u32(chunk)? as usize;
                let bytes = self.context.const_read(index, size)?;
                self.stack.push_bytes(bytes)?;
            }
            OpCode::SetConst => {
                let index = self.fetch_u32(chunk)?;
                let size = self.fetch_u32(chunk)? as usize;
                let mut scratch = std::mem::take(&mut self.scratch);
                scratch.resize(size, 0);
                self.stack.pop_bytes(size, &mut scratch);
                let outcome = self.context.const_write(index, &scratch);
                self.scratch = scratch;
                outcome?;
            }
            OpCode::ClassVarInitialized => {
                let index = self.fetch_u32(chunk)?;
                let was = self.context.class_var_initialized(index)?;
                self.stack.push_bool(was)?;
            }
            OpCode::GetClassVar => {
                let index = self.fetch_u32(chunk)?;
                let size = self.fetch_u32(chunk)? as usize;
                let bytes = self.context.class_var_read(index, size)?;
                self.stack.push_bytes(bytes)?;
            }
            OpCode::SetClassVar => {
                let index = self.fetch_u32(chunk)?;
                let size = self.fetch_u32(chunk)? as usize;
                let mut scratch = std::mem::take(&mut self.scratch);
                scratch.resize(size, 0);
                self.stack.pop_bytes(size, &mut scratch);
                let outcome = self.context.class_var_write(index, &scratch);
                self.scratch = scratch;
                outcome?;
            }

            // =================================================================
            // Stack manipulation
            // =================================================================
            OpCode::Pop => {
                let size = self.fetch_u32(chunk)? as usize;
                self.stack.pop_discard(size);
            }
            OpCode::PopFromOffset => {
                let size = self.fetch_u32(chunk)? as usize;
                let offset = self.fetch_u32(chunk)? as usize;
                self.stack.pop_from_offset(size, offset);
            }
            OpCode::Dup => {
                let size = self.fetch_u32(chunk)? as usize;
                self.stack.dup(size)?;
            }
            OpCode::PushZeros => {
                let amount = self.fetch_u32(chunk)? as usize;
                self.stack.push_zeros(amount)?;
            }
            OpCode::PutStackTopPointer => {
                let size = self.fetch_u32(chunk)? as usize;
                let ptr = self.stack.top_ptr(size);
                self.stack.push_ptr(ptr)?;
            }

            // =================================================================
            // Control flow
            // =================================================================
            OpCode::BranchIf => {
                let target = self.fetch_u32(chunk)? as usize;
                if self.stack.pop_bool() {
                    self.ip = target;
                }
            }
            OpCode::BranchUnless => {
                let target = self.fetch_u32(chunk)? as usize;
                if !self.stack.pop_bool() {
                    self.ip = target;
                }
            }
            OpCode::Jump => {
                self.ip = self.fetch_u32(chunk)? as usize;
            }

            // =================================================================
            // Calls and returns
            // =================================================================
            OpCode::Call => {
                let index = self.fetch_u64(chunk)?;
                self.call_def_index(index, None)?;
            }
            OpCode::CallWithBlock => {
                let def_index = self.fetch_u64(chunk)?;
                let block_index = self.fetch_u64(chunk)?;
                self.context.blocks().lookup(block_index)?;
                let (definer_base, definer_self) = {
                    let f = self.cur_frame();
                    (f.frame_base, f.self_ptr)
                };
                self.call_def_index(
                    def_index,
                    Some(BlockContext {
                        block: BlockId::new(block_index as u32),
                        definer_base,
                        definer_self,
                    }),
                )?;
            }
            OpCode::CallBlock => {
                let index = self.fetch_u64(chunk)?;
                self.call_block_index(index)?;
            }
            OpCode::LibCall => {
                let index = self.fetch_u64(chunk)?;
                let (code, interface, unresolved, name) = {
                    let f = self.context.lib_function(index)?;
                    (f.code(), f.interface, f.is_null(), f.name.clone())
                };
                if unresolved {
                    self.raise_builtin(
                        BuiltinError::Library,
                        &format!("unresolved symbol {name}"),
                    )?;
                } else {
                    let iface = self.context.interface(interface.index() as u64)?;
                    ffi::marshal_call(&mut self.stack, iface, code)?;
                }
            }
            OpCode::Leave => {
                let size = self.fetch_u32(chunk)? as usize;
                self.leave_frame(size);
            }
            OpCode::LeaveDef => {
                let size = self.fetch_u32(chunk)? as usize;
                self.leave_def(size)?;
            }
            OpCode::BreakBlock => {
                let size = self.fetch_u32(chunk)? as usize;
                self.break_block(size)?;
            }

            // =================================================================
            // Allocation
            // =================================================================
            OpCode::AllocateClass => {
                let size = self.fetch_u32(chunk)? as usize;
                let type_id = TypeId::new(self.fetch_u32(chunk)?);
                match self.heap.allocate_class(size, type_id) {
                    Some(cell) => self.stack.push_ptr(cell)?,
                    None => {
                        self.raise_builtin(BuiltinError::OutOfMemory, "allocate_class failed")?
                    }
                }
            }

            // =================================================================
            // Unions
            // =================================================================
            OpCode::PutInUnion => {
                let type_id = self.fetch_u32(chunk)?;
                let from = self.fetch_u32(chunk)? as usize;
                let union_size = self.fetch_u32(chunk)? as usize;
                self.stack.put_in_union(type_id as u64, from, union_size)?;
            }
            OpCode::PutReferenceTypeInUnion => {
                let union_size = self.fetch_u32(chunk)? as usize;
                let ptr = self.stack.read_u64_at(self.stack.sp() - WORD_SIZE);
                let tid = Heap::cell_type_id(ptr as *const u8);
                self.stack
                    .put_in_union(tid.index() as u64, WORD_SIZE, union_size)?;
            }
            OpCode::PutNilableTypeInUnion => {
                let union_size = self.fetch_u32(chunk)? as usize;
                let ptr = self.stack.read_u64_at(self.stack.sp() - WORD_SIZE);
                if ptr == 0 {
                    self.stack.pop_discard(WORD_SIZE);
                    self.stack.push_zeros(union_size)?;
                } else {
                    let tid = Heap::cell_type_id(ptr as *const u8);
                    self.stack
                        .put_in_union(tid.index() as u64, WORD_SIZE, union_size)?;
                }
            }
            OpCode::RemoveFromUnion => {
                let union_size = self.fetch_u32(chunk)? as usize;
                let from = self.fetch_u32(chunk)? as usize;
                self.stack.remove_from_union(union_size, from);
            }
            OpCode::UnionToBool => {
                let union_size = self.fetch_u32(chunk)? as usize;
                let tid = TypeId::new(self.stack.union_header(union_size) as u32);
                let truthy = if tid.is_null() {
                    false
                } else {
                    match self.context.types().get(tid) {
                        Some(desc) if desc.flags.contains(TypeFlags::NIL) => false,
                        Some(desc) => match &desc.kind {
                            TypeKind::Primitive(PrimitiveKind::Bool) => {
                                self.stack.union_payload_word(union_size) & 0xFF != 0
                            }
                            TypeKind::Pointer { .. } => {
                                self.stack.union_payload_word(union_size) != 0
                            }
                            _ => true,
                        },
                        None => true,
                    }
                };
                self.stack.pop_discard(union_size);
                self.stack.push_bool(truthy)?;
            }

            // =================================================================
            // Type filters
            // =================================================================
            OpCode::ReferenceIsA => {
                let filter = TypeId::new(self.fetch_u32(chunk)?);
                let ptr = self.stack.pop_ptr();
                let tid = Heap::cell_type_id(ptr);
                self.stack
                    .push_bool(self.context.types().is_subtype(tid, filter))?;
            }
            OpCode::UnionIsA => {
                let union_size = self.fetch_u32(chunk)? as usize;
                let filter = TypeId::new(self.fetch_u32(chunk)?);
                let tid = TypeId::new(self.stack.union_header(union_size) as u32);
                self.stack.pop_discard(union_size);
                self.stack
                    .push_bool(self.context.types().is_subtype(tid, filter))?;
            }

            // =================================================================
            // Tuples
            // =================================================================
            OpCode::TupleIndexerKnownIndex => {
                let total = self.fetch_u32(chunk)? as usize;
                let offset = self.fetch_u32(chunk)? as usize;
                let size = self.fetch_u32(chunk)? as usize;
                self.stack.extract_field(total, offset, size);
            }

            // =================================================================
            // Symbols
            // =================================================================
            OpCode::SymbolToS => {
                let index = self.fetch_u64(chunk)?;
                let ptr = u32::try_from(index)
                    .ok()
                    .and_then(|i| self.context.symbol_buffer_ptr(i.into()))
                    .ok_or(VmError::BadSideTableIndex {
                        table: "symbol",
                        index,
                    })?;
                self.stack.push_ptr(ptr)?;
            }

            // =================================================================
            // Procs
            // =================================================================
            OpCode::ProcCall => {
                let closure_data = self.stack.pop_u64();
                let def_index = self.stack.pop_u64();
                if closure_data != 0 {
                    self.stack.push_u64(closure_data)?;
                }
                self.call_def_index(def_index, None)?;
            }
            OpCode::ProcToCFun => {
                let cif_index = self.fetch_u64(chunk)?;
                let closure_data = self.stack.pop_u64();
                let def_index = self.stack.pop_u64();
                self.context.defs().lookup(def_index)?;
                let iface = self.context.interface(cif_index)?.clone();
                let vm: *mut Interpreter = self;
                let user = Box::new(ClosureUser {
                    vm,
                    def_index,
                    closure_data,
                    iface,
                });
                match self.closures.register(user) {
                    Ok(address) => self.stack.push_u64(address as u64)?,
                    Err(VmError::Ffi(message)) => {
                        self.raise_builtin(BuiltinError::Library, &message)?
                    }
                    Err(other) => return Err(other),
                }
            }
            OpCode::CFunToProc => {
                let address = self.stack.pop_u64() as usize;
                let (def_index, closure_data) = self
                    .closures
                    .lookup(address)
                    .ok_or(VmError::UnknownCFun(address))?;
                self.stack.push_u64(def_index)?;
                self.stack.push_u64(closure_data)?;
            }

            // =================================================================
            // Atomics (always sequentially consistent)
            // =================================================================
            OpCode::LoadAtomic => {
                let size = self.fetch_u32(chunk)?;
                let _ordering = self.fetch_u8(chunk)?;
                let ptr = self.stack.pop_ptr();
                match size {
                    1 => {
                        let v = unsafe { AtomicU8::from_ptr(ptr) }.load(SeqCst);
                        self.stack.push_u8(v)?;
                    }
                    2 => {
                        let v = unsafe { AtomicU16::from_ptr(ptr as *mut u16) }.load(SeqCst);
                        self.stack.push_u16(v)?;
                    }
                    4 => {
                        let v = unsafe { AtomicU32::from_ptr(ptr as *mut u32) }.load(SeqCst);
                        self.stack.push_u32(v)?;
                    }
                    8 => {
                        let v = unsafe { AtomicU64::from_ptr(ptr as *mut u64) }.load(SeqCst);
                        self.stack.push_u64(v)?;
                    }
                    _ => {
                        return Err(VmError::InvalidBytecode(format!(
                            "atomic width {size}"
                        )));
                    }
                }
            }
            OpCode::StoreAtomic => {
                let size = self.fetch_u32(chunk)?;
                let _ordering = self.fetch_u8(chunk)?;
                match size {
                    1 => {
                        let v = self.stack.pop_u8();
                        let ptr = self.stack.pop_ptr();
                        unsafe { AtomicU8::from_ptr(ptr) }.store(v, SeqCst);
                    }
                    2 => {
                        let v = self.stack.pop_u16();
                        let ptr = self.stack.pop_ptr();
                        unsafe { AtomicU16::from_ptr(ptr as *mut u16) }.store(v, SeqCst);
                    }
                    4 => {
                        let v = self.stack.pop_u32();
                        let ptr = self.stack.pop_ptr();
                        unsafe { AtomicU32::from_ptr(ptr as *mut u32) }.store(v, SeqCst);
                    }
                    8 => {
                        let v = self.stack.pop_u64();
                        let ptr = self.stack.pop_ptr();
                        unsafe { AtomicU64::from_ptr(ptr as *mut u64) }.store(v, SeqCst);
                    }
                    _ => {
                        return Err(VmError::InvalidBytecode(format!(
                            "atomic width {size}"
                        )));
                    }
                }
            }
            OpCode::AtomicRmw => {
                let rmw_byte = self.fetch_u8(chunk)?;
                let size = self.fetch_u32(chunk)?;
                let _ordering = self.fetch_u8(chunk)?;
                let rmw = AtomicRmwOp::try_from(rmw_byte).map_err(|_| {
                    VmError::InvalidBytecode(format!("atomicrmw operation {rmw_byte}"))
                })?;
                match size {
                    1 => atomic_rmw_width!(rmw, u8, i8, AtomicU8, AtomicI8, pop_u8, push_u8),
                    2 => atomic_rmw_width!(rmw, u16, i16, AtomicU16, AtomicI16, pop_u16, push_u16),
                    4 => atomic_rmw_width!(rmw, u32, i32, AtomicU32, AtomicI32, pop_u32, push_u32),
                    8 => atomic_rmw_width!(rmw, u64, i64, AtomicU64, AtomicI64, pop_u64, push_u64),
                    _ => {
                        return Err(VmError::InvalidBytecode(format!(
                            "atomic width {size}"
                        )));
                    }
                }
            }
            OpCode::CmpXchg => {
                let size = self.fetch_u32(chunk)?;
                let _success = self.fetch_u8(chunk)?;
                let _failure = self.fetch_u8(chunk)?;
                match size {
                    1 => cmpxchg_width!(u8, AtomicU8, pop_u8, push_u8),
                    2 => cmpxchg_width!(u16, AtomicU16, pop_u16, push_u16),
                    4 => cmpxchg_width!(u32, AtomicU32, pop_u32, push_u32),
                    8 => cmpxchg_width!(u64, AtomicU64, pop_u64, push_u64),
                    _ => {
                        return Err(VmError::InvalidBytecode(format!(
                            "atomic width {size}"
                        )));
                    }
                }
            }

            // =================================================================
            // Fibers
            // =================================================================
            OpCode::CurrentFiber => {
                self.stack.push_u64(self.current_fiber)?;
            }
            OpCode::SpawnFiber => {
                let closure_data = self.stack.pop_u64();
                let def_index = self.stack.pop_u64();
                let fiber = self.stack.pop_u64();
                let mut state = FiberState {
                    stack: OperandStack::new(self.config.stack_capacity),
                    frames: Vec::new(),
                    ip: 0,
                };
                self.swap_fiber_state(&mut state);
                let setup = (|| -> VmResult<()> {
                    if closure_data != 0 {
                        self.stack.push_u64(closure_data)?;
                    }
                    self.call_def_index(def_index, None)
                })();
                self.swap_fiber_state(&mut state);
                setup?;
                self.fiber_states.insert(fiber, state);
                self.host.spawn(fiber)?;
                log::trace!("spawned fiber {fiber:#x} running def {def_index}");
            }
            OpCode::FiberSwapcontext => {
                let to = self.stack.pop_u64();
                let from = self.stack.pop_u64();
                if self.run_barrier != 0 {
                    return Err(VmError::FiberHost(
                        "fiber switch inside a nested native invocation".into(),
                    ));
                }
                let mut state = self
                    .fiber_states
                    .remove(&to)
                    .ok_or_else(|| VmError::FiberHost(format!("unknown fiber {to:#x}")))?;
                self.swap_fiber_state(&mut state);
                self.fiber_states.insert(from, state);
                self.current_fiber = to;
                self.host.swap(from, to)?;
                log::trace!("swapcontext {from:#x} -> {to:#x}");
            }

            // =================================================================
            // Exceptions
            // =================================================================
            OpCode::RaiseWithoutBacktrace => {
                let exception = self.stack.pop_ptr();
                self.raise(exception)?;
            }
            OpCode::Reraise => {
                if self.last_exception == 0 {
                    return Err(VmError::InvalidBytecode("reraise without exception".into()));
                }
                let exception = self.last_exception as *mut u8;
                self.raise(exception)?;
            }
            OpCode::CallStackUnwind => {
                let count = self.frames.len();
                let bytes = WORD_SIZE + WORD_SIZE * count;
                let Some(record) = self.heap.malloc(bytes) else {
                    self.raise_builtin(BuiltinError::OutOfMemory, "backtrace capture failed")?;
                    return Ok(());
                };
                unsafe {
                    (record as *mut u64).write(count as u64);
                    for (i, frame) in self.frames.iter().enumerate() {
                        // Bit 63 marks block frames.
                        let word = match frame.code {
                            FrameCode::Def(id) => id.index() as u64,
                            FrameCode::Block(id) => (1u64 << 63) | id.index() as u64,
                        };
                        (record as *mut u64).add(1 + i).write(word);
                    }
                }
                self.stack.push_ptr(record)?;
            }

            // =================================================================
            // Bit intrinsics
            // =================================================================
            OpCode::ByteSwap => {
                let width = self.fetch_u32(chunk)?;
                match width {
                    2 => {
                        let v = self.stack.pop_u16();
                        self.stack.push_u16(v.swap_bytes())?;
                    }
                    4 => {
                        let v = self.stack.pop_u32();
                        self.stack.push_u32(v.swap_bytes())?;
                    }
                    8 => {
                        let v = self.stack.pop_u64();
                        self.stack.push_u64(v.swap_bytes())?;
                    }
                    _ => {
                        return Err(VmError::InvalidBytecode(format!("byte_swap width {width}")));
                    }
                }
            }
            OpCode::PopCount => {
                let width = self.fetch_u32(chunk)?;
                let ones = match width {
                    1 => self.stack.pop_u8().count_ones(),
                    2 => self.stack.pop_u16().count_ones(),
                    4 => self.stack.pop_u32().count_ones(),
                    8 => self.stack.pop_u64().count_ones(),
                    _ => {
                        return Err(VmError::InvalidBytecode(format!("popcount width {width}")));
                    }
                };
                self.stack.push_i32(ones as i32)?;
            }
            OpCode::LeadingZeros => {
                let width = self.fetch_u32(chunk)?;
                let zeros = match width {
                    1 => self.stack.pop_u8().leading_zeros(),
                    2 => self.stack.pop_u16().leading_zeros(),
                    4 => self.stack.pop_u32().leading_zeros(),
                    8 => self.stack.pop_u64().leading_zeros(),
                    _ => {
                        return Err(VmError::InvalidBytecode(format!(
                            "leading_zeros width {width}"
                        )));
                    }
                };
                self.stack.push_i32(zeros as i32)?;
            }
            OpCode::TrailingZeros => {
                let width = self.fetch_u32(chunk)?;
                let zeros = match width {
                    1 => self.stack.pop_u8().trailing_zeros(),
                    2 => self.stack.pop_u16().trailing_zeros(),
                    4 => self.stack.pop_u32().trailing_zeros(),
                    8 => self.stack.pop_u64().trailing_zeros(),
                    _ => {
                        return Err(VmError::InvalidBytecode(format!(
                            "trailing_zeros width {width}"
                        )));
                    }
                };
                self.stack.push_i32(zeros as i32)?;
            }

            // =================================================================
            // Machine intrinsics
            // =================================================================
            OpCode::ReadCycleCounter => {
                #[cfg(target_arch = "x86_64")]
                let ticks = unsafe { std::arch::x86_64::_rdtsc() };
                #[cfg(not(target_arch = "x86_64"))]
                let ticks = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0);
                self.stack.push_u64(ticks)?;
            }
            OpCode::CpuPause => {
                std::hint::spin_loop();
            }
            OpCode::DebugTrap => {
                self.debug_trap();
            }
            OpCode::MemCopy => {
                let _volatile = self.stack.pop_bool();
                let count = self.stack.pop_i64().max(0) as usize;
                let src = self.stack.pop_ptr();
                let dst = self.stack.pop_ptr();
                if count > 0 {
                    unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst, count) };
                }
            }
            OpCode::MemMove => {
                let _volatile = self.stack.pop_bool();
                let count = self.stack.pop_i64().max(0) as usize;
                let src = self.stack.pop_ptr();
                let dst = self.stack.pop_ptr();
                if count > 0 {
                    unsafe { std::ptr::copy(src as *const u8, dst, count) };
                }
            }
            OpCode::MemSet => {
                let _volatile = self.stack.pop_bool();
                let count = self.stack.pop_i64().max(0) as usize;
                let value = self.stack.pop_u8();
                let dst = self.stack.pop_ptr();
                if count > 0 {
                    unsafe { std::ptr::write_bytes(dst, value, count) };
                }
            }

            // =================================================================
            // Math library
            // =================================================================
            OpCode::CeilF32 => math_unary!(pop_f32, push_f32, ceil),
            OpCode::CeilF64 => math_unary!(pop_f64, push_f64, ceil),
            OpCode::CosF32 => math_unary!(pop_f32, push_f32, cos),
            OpCode::CosF64 => math_unary!(pop_f64, push_f64, cos),
            OpCode::ExpF32 => math_unary!(pop_f32, push_f32, exp),
            OpCode::ExpF64 => math_unary!(pop_f64, push_f64, exp),
            OpCode::FloorF32 => math_unary!(pop_f32, push_f32, floor),
            OpCode::FloorF64 => math_unary!(pop_f64, push_f64, floor),
            OpCode::LogF32 => math_unary!(pop_f32, push_f32, ln),
            OpCode::LogF64 => math_unary!(pop_f64, push_f64, ln),
            OpCode::RoundF32 => math_unary!(pop_f32, push_f32, round),
            OpCode::RoundF64 => math_unary!(pop_f64, push_f64, round),
            OpCode::RintF32 => math_unary!(pop_f32, push_f32, round_ties_even),
            OpCode::RintF64 => math_unary!(pop_f64, push_f64, round_ties_even),
            OpCode::SinF32 => math_unary!(pop_f32, push_f32, sin),
            OpCode::SinF64 => math_unary!(pop_f64, push_f64, sin),
            OpCode::SqrtF32 => math_unary!(pop_f32, push_f32, sqrt),
            OpCode::SqrtF64 => math_unary!(pop_f64, push_f64, sqrt),
            OpCode::TruncF32 => math_unary!(pop_f32, push_f32, trunc),
            OpCode::TruncF64 => math_unary!(pop_f64, push_f64, trunc),
            OpCode::PowF32 => math_binary!(pop_f32, push_f32, powf),
            OpCode::PowF64 => math_binary!(pop_f64, push_f64, powf),
            OpCode::PowiF32 => {
                let exp = self.stack.pop_i32();
                let base = self.stack.pop_f32();
                self.stack.push_f32(base.powi(exp))?;
            }
            OpCode::PowiF64 => {
                let exp = self.stack.pop_i32();
                let base = self.stack.pop_f64();
                self.stack.push_f64(base.powi(exp))?;
            }
            OpCode::MinF32 => math_binary!(pop_f32, push_f32, min),
            OpCode::MinF64 => math_binary!(pop_f64, push_f64, min),
            OpCode::MaxF32 => math_binary!(pop_f32, push_f32, max),
            OpCode::MaxF64 => math_binary!(pop_f64, push_f64, max),
            OpCode::CopysignF32 => math_binary!(pop_f32, push_f32, copysign),
            OpCode::CopysignF64 => math_binary!(pop_f64, push_f64, copysign),

            // =================================================================
            // Process arguments
            // =================================================================
            OpCode::PutArgc => {
                self.stack.push_i32(self.context.argc())?;
            }
            OpCode::PutArgv => {
                self.stack.push_ptr(self.context.argv() as *const u8)?;
            }

            // =================================================================
            // Diagnostics
            // =================================================================
            OpCode::Unreachable => {
                let index = self.fetch_u64(chunk)?;
                let message = self
                    .context
                    .symbol_name((index as u32).into())
                    .unwrap_or("compiler-proven unreachable point")
                    .to_string();
                return Err(VmError::Unreachable(message));
            }
        }
        Ok(())
    }

    fn swap_fiber_state(&mut self, state: &mut FiberState) {
        std::mem::swap(&mut self.stack, &mut state.stack);
        std::mem::swap(&mut self.frames, &mut state.frames);
        std::mem::swap(&mut self.ip, &mut state.ip);
    }

    fn debug_trap(&mut self) {
        let Some(mut inspector) = self.inspector.take() else {
            return;
        };
        let frames: Vec<FrameView> = self
            .frames
            .iter()
            .map(|f| FrameView {
                name: self.frame_name(f),
                frame_base: f.frame_base,
                return_ip: f.return_ip,
            })
            .collect();
        let location = match self.frames.last() {
            Some(f) => self.frame_name(f),
            None => "<top level>".to_string(),
        };
        let view = VmView {
            ip: self.ip,
            location: &location,
            stack: self.stack.as_slice(),
            frames,
        };
        inspector.trap(&view);
        self.inspector = Some(inspector);
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("frames", &self.frames.len())
            .field("ip", &self.ip)
            .field("sp", &self.stack.sp())
            .field("fiber", &self.current_fiber)
            .finish()
    }
}
