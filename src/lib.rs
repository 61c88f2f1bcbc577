//! Vesper's embedded bytecode interpreter.
//!
//! A stack-based virtual machine executing the typed-but-untagged
//! bytecode the Vesper compiler emits, bit-compatible with the native
//! backend's value layout: word-aligned operand stack slots, type-id
//! tagged unions, type-id headed heap cells, and libffi-marshaled C
//! interop.
//!
//! The front end, semantic analyzer, and native code generator are
//! external collaborators: the analyzer hands this crate a read-only
//! type table and type-specialized [`CompiledDef`]s, and the engine
//! executes them.
//!
//! ```no_run
//! use vesper::{Chunk, CompiledDef, Context, Interpreter, OpCode, TypeId, TypeTable};
//!
//! let mut chunk = Chunk::new();
//! chunk.write_op(OpCode::PutI64);
//! chunk.write_i64(42);
//! chunk.write_op(OpCode::Leave);
//! chunk.write_u32(8);
//!
//! let mut context = Context::new(TypeTable::new());
//! let def = context.register_def(CompiledDef {
//!     owner: TypeId::NULL,
//!     name: "main".into(),
//!     args_size: 0,
//!     frame_size: 0,
//!     return_size: 8,
//!     takes_self: false,
//!     chunk,
//!     block: None,
//! });
//!
//! let mut vm = Interpreter::new(context);
//! let bytes = vm.execute(def).unwrap();
//! assert_eq!(i64::from_ne_bytes(bytes.try_into().unwrap()), 42);
//! ```

pub mod vm;

pub use vesper_bytecode::{
    AtomicRmwOp, BlockRegistry, Chunk, CompiledBlock, CompiledDef, DefRegistry, ExceptionHandler,
    OpCode,
};
pub use vesper_core::{
    BlockId, CifId, DefId, FiberId, FieldDescriptor, LibFnId, PrimitiveKind, SymbolId,
    TypeDescriptor, TypeFlags, TypeId, TypeKind, TypeTable, UNION_HEADER_SIZE, VmError, VmResult,
    WORD_SIZE, align,
};
pub use vm::{
    CallInterface, Context, FfiType, FiberHost, FrameView, Heap, InlineFiberHost, Inspector,
    Interpreter, LibFunction, NoFiberHost, OperandStack, VmConfig, VmView, WellKnownTypes,
    resolve_in_library,
};
#[cfg(unix)]
pub use vm::resolve_in_process;
