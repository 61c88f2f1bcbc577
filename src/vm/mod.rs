//! The Vesper virtual machine.
//!
//! Execution engine for the bytecode defined in `vesper-bytecode`: the
//! byte-addressed operand stack, the VM-lifetime heap, context services,
//! the dispatch loop, the libffi bridge, and the fiber and inspector
//! seams.

pub mod context;
pub mod ffi;
pub mod fiber;
pub mod heap;
pub mod interpreter;
pub mod stack;
pub mod trap;

pub use context::{Context, WellKnownTypes};
pub use ffi::{CallInterface, FfiType, LibFunction, resolve_in_library};
#[cfg(unix)]
pub use ffi::resolve_in_process;
pub use fiber::{FiberHost, InlineFiberHost, MAIN_FIBER, NoFiberHost};
pub use heap::Heap;
pub use interpreter::{Interpreter, VmConfig};
pub use stack::{DEFAULT_STACK_CAPACITY, OperandStack};
pub use trap::{FrameView, Inspector, VmView};
