//! VM-level error type.
//!
//! Source-language exceptions are not Rust errors: they are heap values
//! unwound through per-chunk handler tables inside the executor. `VmError`
//! covers what escapes that mechanism — an exception no handler caught,
//! and fatal invariant violations that abort execution outright.

use crate::ids::TypeId;
use thiserror::Error;

/// Result alias used throughout the interpreter.
pub type VmResult<T> = Result<T, VmError>;

/// Errors surfaced by the virtual machine.
#[derive(Error, Debug)]
pub enum VmError {
    /// A source-language exception reached the outermost frame without a
    /// matching handler.
    #[error("uncaught exception of type {type_name} (raised in {frame})")]
    UncaughtException {
        type_id: TypeId,
        type_name: String,
        frame: String,
    },

    /// An `unreachable` opcode executed: the compiler proved this point
    /// impossible, so interpreter state is no longer trustworthy.
    #[error("unreachable code executed: {0}")]
    Unreachable(String),

    /// A byte that is not a valid opcode was fetched.
    #[error("invalid opcode {opcode:#04x} at offset {offset}")]
    InvalidOpcode { opcode: u8, offset: usize },

    /// The instruction pointer ran past the end of the bytecode buffer, or
    /// an inline operand was truncated.
    #[error("truncated bytecode at offset {0}")]
    TruncatedBytecode(usize),

    /// The operand stack exceeded its configured capacity.
    #[error("operand stack overflow (capacity {capacity} bytes)")]
    StackOverflow { capacity: usize },

    /// The frame stack exceeded the configured call depth.
    #[error("call depth exceeded (max {max})")]
    CallDepthExceeded { max: usize },

    /// An inline operand referenced a side table slot that does not exist.
    #[error("unknown {table} index {index}")]
    BadSideTableIndex { table: &'static str, index: u64 },

    /// The bytecode violated a contract the compiler is supposed to
    /// uphold (bad operand combination, guard elided, missing block).
    #[error("malformed bytecode: {0}")]
    InvalidBytecode(String),

    /// A built-in exception was raised before its type was registered
    /// with the context.
    #[error("well-known type {0} is not registered")]
    MissingWellKnownType(&'static str),

    /// `c_fun_to_proc` was given a code pointer that was never produced by
    /// `proc_to_c_fun`.
    #[error("no interpreter closure registered for code pointer {0:#x}")]
    UnknownCFun(usize),

    /// Preparing a libffi call interface or closure failed.
    #[error("ffi error: {0}")]
    Ffi(String),

    /// A native symbol could not be resolved.
    #[error("symbol resolution failed: {0}")]
    SymbolResolution(String),

    /// The fiber host rejected a spawn or context switch.
    #[error("fiber host error: {0}")]
    FiberHost(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = VmError::InvalidOpcode {
            opcode: 0xff,
            offset: 12,
        };
        assert_eq!(err.to_string(), "invalid opcode 0xff at offset 12");

        let err = VmError::BadSideTableIndex {
            table: "def",
            index: 9,
        };
        assert_eq!(err.to_string(), "unknown def index 9");
    }

    #[test]
    fn uncaught_exception_names_type() {
        let err = VmError::UncaughtException {
            type_id: TypeId::new(7),
            type_name: "OverflowError".into(),
            frame: "Int32#+".into(),
        };
        assert!(err.to_string().contains("OverflowError"));
        assert!(err.to_string().contains("Int32#+"));
    }
}
