//! Bytecode chunk for compiled method and block bodies.
//!
//! A `Chunk` holds the instruction bytes for one compiled body plus its
//! exception-handler interval table. This is also the emitter's contract:
//! the compiler lowers each AST form through the `write_*`/`emit_jump`
//! helpers, and the executor reads the same bytes back through the
//! `read_*` accessors.
//!
//! All inline operands are little-endian. Branch targets are absolute
//! offsets into the chunk.

use crate::opcode::OpCode;
use std::fmt::Write as _;
use vesper_core::TypeId;

/// One entry of a chunk's exception-handler table.
///
/// The interval covers instruction offsets `[start, end)`. When an
/// exception raised while the instruction pointer is inside the interval
/// matches one of `catch_types` (empty = catch all), the operand stack is
/// cut to `stack_depth` bytes above the frame base, the exception
/// reference is pushed, and control transfers to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start: u32,
    pub end: u32,
    pub target: u32,
    pub stack_depth: u32,
    pub catch_types: Vec<TypeId>,
}

impl ExceptionHandler {
    /// Whether the interval covers the given instruction offset.
    #[inline]
    pub fn covers(&self, ip: usize) -> bool {
        (self.start as usize) <= ip && ip < (self.end as usize)
    }
}

/// A chunk of bytecode for a single compiled body.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    code: Vec<u8>,
    handlers: Vec<ExceptionHandler>,
}

impl Chunk {
    /// Create a new empty chunk.
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Write an opcode byte.
    pub fn write_op(&mut self, op: OpCode) {
        self.code.push(op.into());
    }

    /// Write a byte operand.
    pub fn write_u8(&mut self, value: u8) {
        self.code.push(value);
    }

    /// Write a 32-bit operand (little-endian).
    pub fn write_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a 64-bit operand (little-endian).
    pub fn write_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a signed 64-bit operand (little-endian).
    pub fn write_i64(&mut self, value: i64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Current code offset: the target of a jump to "here", and the site
    /// returned by [`Chunk::emit_jump`] for later patching.
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a branch with a placeholder target; returns the patch site.
    pub fn emit_jump(&mut self, op: OpCode) -> usize {
        self.write_op(op);
        let site = self.code.len();
        self.write_u32(u32::MAX); // placeholder
        site
    }

    /// Patch a branch emitted by [`Chunk::emit_jump`] to target the
    /// current offset.
    pub fn patch_jump(&mut self, site: usize) {
        let target = self.code.len() as u32;
        self.code[site..site + 4].copy_from_slice(&target.to_le_bytes());
    }

    /// Register an exception handler interval.
    pub fn add_handler(&mut self, handler: ExceptionHandler) {
        self.handlers.push(handler);
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Get the raw bytecode.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Get the length of the bytecode.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Check if the chunk is empty.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Read a byte at the given offset.
    pub fn read_u8(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    /// Read a u32 at the given offset (little-endian).
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.code.get(offset..offset + 4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Read a u64 at the given offset (little-endian).
    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        let bytes = self.code.get(offset..offset + 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Read an i64 at the given offset (little-endian).
    pub fn read_i64(&self, offset: usize) -> Option<i64> {
        self.read_u64(offset).map(|v| v as i64)
    }

    /// Read an opcode at the given offset.
    pub fn read_op(&self, offset: usize) -> Option<OpCode> {
        self.code.get(offset).and_then(|&b| OpCode::try_from(b).ok())
    }

    /// Handlers whose interval covers the given instruction offset, in
    /// registration order.
    pub fn handlers_covering(&self, ip: usize) -> impl Iterator<Item = &ExceptionHandler> {
        self.handlers.iter().filter(move |h| h.covers(ip))
    }

    /// The full handler table.
    pub fn handlers(&self) -> &[ExceptionHandler] {
        &self.handlers
    }

    // =========================================================================
    // Disassembly
    // =========================================================================

    /// Extract all opcodes from the chunk, skipping operands.
    ///
    /// Useful for asserting on emitted sequences without pinning operand
    /// values or offsets.
    pub fn opcodes(&self) -> Vec<OpCode> {
        let mut ops = Vec::new();
        let mut offset = 0;
        while offset < self.code.len() {
            match self.read_op(offset) {
                Some(op) => {
                    ops.push(op);
                    offset += 1 + op.operand_size();
                }
                // Invalid opcode, skip one byte
                None => offset += 1,
            }
        }
        ops
    }

    /// Disassemble one instruction; returns the rendered line and the
    /// offset of the next instruction.
    pub fn disassemble_at(&self, offset: usize) -> (String, usize) {
        let Some(op) = self.read_op(offset) else {
            let byte = self.read_u8(offset).unwrap_or(0);
            return (format!("{offset:06} .byte {byte:#04x}"), offset + 1);
        };
        let mut line = format!("{offset:06} {}", op.name());
        let mut cursor = offset + 1;
        for &width in op.operand_widths() {
            let value = match width {
                1 => self.read_u8(cursor).map(u64::from),
                4 => self.read_u32(cursor).map(u64::from),
                8 => self.read_u64(cursor),
                _ => None,
            };
            match value {
                Some(v) if op == OpCode::PutI64 => {
                    let _ = write!(line, " {}", v as i64);
                }
                Some(v) => {
                    let _ = write!(line, " {v}");
                }
                None => {
                    let _ = write!(line, " <truncated>");
                    return (line, self.code.len());
                }
            }
            cursor += width as usize;
        }
        (line, cursor)
    }

    /// Disassemble the whole chunk, one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut offset = 0;
        while offset < self.code.len() {
            let (line, next) = self.disassemble_at(offset);
            out.push_str(&line);
            out.push('\n');
            offset = next;
        }
        out
    }
}
