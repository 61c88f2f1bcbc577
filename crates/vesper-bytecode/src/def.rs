//! Compiled method and block bodies, and their registries.
//!
//! The semantic analyzer resolves every call site to a type-specialized
//! [`CompiledDef`] and registers it here. Identity is the arena index
//! ([`DefId`]/[`BlockId`]); the interpreter never compares bodies by
//! content. Registries are append-only and box their entries, so borrowed
//! bodies stay at stable addresses while new ones are registered.

use crate::chunk::Chunk;
use vesper_core::{BlockId, DefId, TypeId, VmError, VmResult};

/// A type-specialized, bytecode-encoded method body.
#[derive(Debug)]
pub struct CompiledDef {
    /// The type the method was resolved on. Diagnostics only.
    pub owner: TypeId,
    /// Qualified method name. Diagnostics only.
    pub name: String,
    /// Bytes of arguments the caller pushes, stack-aligned, in
    /// declaration order. Includes `self` when `takes_self` is set and a
    /// trailing closure-data slot for closure procs.
    pub args_size: u32,
    /// Full size of the local frame in bytes; at least `args_size`.
    pub frame_size: u32,
    /// Semantic size of the return value in bytes.
    pub return_size: u32,
    /// Whether the first argument slot is the receiver.
    pub takes_self: bool,
    pub chunk: Chunk,
    /// Block attached by specialization, entered via `call_block`.
    pub block: Option<BlockId>,
}

/// Bytecode for a block body, inlined at its yield site.
///
/// A block borrows the frame of the def that lexically contains it: its
/// parameters land at `args_offset` within that frame, and its body
/// addresses the enclosing locals directly. `captures` describes which
/// enclosing locals the body reads, for diagnostics and future
/// closure conversion.
#[derive(Debug)]
pub struct CompiledBlock {
    pub name: String,
    /// Bytes of block parameters, stack-aligned.
    pub args_size: u32,
    /// Offset within the enclosing frame where the parameters land.
    pub args_offset: u32,
    /// Semantic size of the block's result in bytes.
    pub return_size: u32,
    pub chunk: Chunk,
    /// Captured-variable descriptor: (frame offset, size) pairs.
    pub captures: Vec<(u32, u32)>,
}

/// Append-only arena of compiled defs.
#[derive(Debug, Default)]
pub struct DefRegistry {
    defs: Vec<Box<CompiledDef>>,
}

impl DefRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a def and return its id.
    pub fn register(&mut self, def: CompiledDef) -> DefId {
        let id = DefId::new(self.defs.len() as u32);
        self.defs.push(Box::new(def));
        id
    }

    pub fn get(&self, id: DefId) -> Option<&CompiledDef> {
        self.defs.get(id.index() as usize).map(|b| &**b)
    }

    /// Like [`DefRegistry::get`] but mapping a raw operand index to a VM
    /// error on a bad table reference.
    pub fn lookup(&self, index: u64) -> VmResult<&CompiledDef> {
        u32::try_from(index)
            .ok()
            .and_then(|i| self.get(DefId::new(i)))
            .ok_or(VmError::BadSideTableIndex { table: "def", index })
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

/// Append-only arena of compiled blocks.
#[derive(Debug, Default)]
pub struct BlockRegistry {
    blocks: Vec<Box<CompiledBlock>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, block: CompiledBlock) -> BlockId {
        let id = BlockId::new(self.blocks.len() as u32);
        self.blocks.push(Box::new(block));
        id
    }

    pub fn get(&self, id: BlockId) -> Option<&CompiledBlock> {
        self.blocks.get(id.index() as usize).map(|b| &**b)
    }

    pub fn lookup(&self, index: u64) -> VmResult<&CompiledBlock> {
        u32::try_from(index)
            .ok()
            .and_then(|i| self.get(BlockId::new(i)))
            .ok_or(VmError::BadSideTableIndex {
                table: "block",
                index,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_def(name: &str) -> CompiledDef {
        CompiledDef {
            owner: TypeId::new(1),
            name: name.into(),
            args_size: 0,
            frame_size: 0,
            return_size: 0,
            takes_self: false,
            chunk: Chunk::new(),
            block: None,
        }
    }

    #[test]
    fn registry_hands_out_dense_ids() {
        let mut registry = DefRegistry::new();
        let a = registry.register(dummy_def("a"));
        let b = registry.register(dummy_def("b"));
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(registry.get(a).unwrap().name, "a");
        assert_eq!(registry.get(b).unwrap().name, "b");
    }

    #[test]
    fn lookup_rejects_bad_indices() {
        let registry = DefRegistry::new();
        let err = registry.lookup(3).unwrap_err();
        assert!(matches!(
            err,
            VmError::BadSideTableIndex { table: "def", index: 3 }
        ));
        // Indices beyond u32 can never be valid.
        assert!(registry.lookup(u64::MAX).is_err());
    }

    #[test]
    fn boxed_entries_stay_stable() {
        let mut registry = DefRegistry::new();
        let a = registry.register(dummy_def("a"));
        let first = registry.get(a).unwrap() as *const CompiledDef;
        for i in 0..64 {
            registry.register(dummy_def(&format!("d{i}")));
        }
        assert_eq!(first, registry.get(a).unwrap() as *const CompiledDef);
    }
}
