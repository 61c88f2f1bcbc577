//! The Vesper instruction set and bytecode containers.
//!
//! Three consumers index off the opcode table defined here: the
//! compiler's emitter ([`Chunk`]'s write helpers), the interpreter's
//! dispatch loop, and the disassembler. The table itself — operand
//! layout and name per opcode — is literal data on [`OpCode`].

pub mod chunk;
pub mod def;
pub mod opcode;

pub use chunk::{Chunk, ExceptionHandler};
pub use def::{BlockRegistry, CompiledBlock, CompiledDef, DefRegistry};
pub use opcode::{AtomicRmwOp, OpCode};
