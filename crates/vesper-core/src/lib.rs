//! Shared runtime vocabulary for the Vesper interpreter.
//!
//! This crate defines the types every other interpreter crate speaks:
//! identifier newtypes, the type descriptor table built by the semantic
//! analyzer, the value layout rules of the operand stack, and the VM
//! error type.

pub mod error;
pub mod ids;
pub mod layout;
pub mod type_table;

pub use error::{VmError, VmResult};
pub use ids::{BlockId, CifId, DefId, FiberId, LibFnId, SymbolId, TypeId};
pub use layout::{CELL_HEADER_SIZE, UNION_HEADER_SIZE, WORD_SIZE, align};
pub use type_table::{
    FieldDescriptor, PrimitiveKind, TypeDescriptor, TypeFlags, TypeKind, TypeTable,
};
