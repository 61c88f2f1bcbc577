//! Type descriptors and the id-indexed type table.
//!
//! The semantic analyzer assigns every monomorphized type a dense
//! [`TypeId`] and hands the interpreter a read-only [`TypeTable`] mapping
//! ids to descriptors. The executor consults it for union truthiness,
//! `is_a?` filters, and cell layout; it never mutates it.

use crate::ids::{SymbolId, TypeId};
use bitflags::bitflags;

/// Primitive value kinds with a fixed on-stack footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl PrimitiveKind {
    /// Semantic size in bytes (before stack alignment).
    pub const fn size(self) -> u32 {
        match self {
            PrimitiveKind::Bool | PrimitiveKind::I8 | PrimitiveKind::U8 => 1,
            PrimitiveKind::I16 | PrimitiveKind::U16 => 2,
            PrimitiveKind::I32 | PrimitiveKind::U32 | PrimitiveKind::F32 => 4,
            PrimitiveKind::I64 | PrimitiveKind::U64 | PrimitiveKind::F64 => 8,
        }
    }
}

bitflags! {
    /// Descriptor flags orthogonal to [`TypeKind`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeFlags: u32 {
        /// The `Nil` type. A union holding it stores header 0.
        const NIL = 1 << 0;
        /// Cannot be instantiated; only appears as an `is_a?` filter.
        const ABSTRACT = 1 << 1;
        /// Declared in a `lib` binding; laid out with C rules.
        const EXTERN = 1 << 2;
    }
}

/// The shape of a type, as a tagged sum matched exhaustively at dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Primitive(PrimitiveKind),
    /// Reference class. Values are a single pointer to a heap cell whose
    /// first four bytes are the dynamic `TypeId`.
    Class { parent: Option<TypeId> },
    /// Value struct, laid out inline in declaration order.
    Struct { parent: Option<TypeId> },
    Tuple { elements: Vec<TypeId> },
    NamedTuple { entries: Vec<(SymbolId, TypeId)> },
    /// Union: an 8-byte `TypeId` header followed by the largest member.
    Union { members: Vec<TypeId> },
    Pointer { element: TypeId },
    Proc,
}

/// An instance variable at an analyzer-assigned offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub offset: u32,
    pub type_id: TypeId,
}

/// Everything the executor needs to know about one monomorphized type.
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub name: String,
    pub kind: TypeKind,
    /// Semantic size in bytes. For unions this includes the header.
    pub size: u32,
    pub alignment: u32,
    pub flags: TypeFlags,
    pub fields: Vec<FieldDescriptor>,
}

impl TypeDescriptor {
    /// Shorthand for a descriptor without fields or flags.
    pub fn new(name: impl Into<String>, kind: TypeKind, size: u32, alignment: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            size,
            alignment,
            flags: TypeFlags::empty(),
            fields: Vec::new(),
        }
    }

    /// Whether values of this type are a heap reference (single pointer).
    pub fn is_reference(&self) -> bool {
        matches!(self.kind, TypeKind::Class { .. })
    }
}

/// Dense `TypeId` → descriptor mapping, read-only during execution.
///
/// Index 0 is reserved for the null reference; `register` hands out ids
/// starting at 1.
#[derive(Debug, Default)]
pub struct TypeTable {
    // Slot 0 is a placeholder so TypeId indices map directly.
    types: Vec<Option<TypeDescriptor>>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self {
            types: vec![None],
        }
    }

    /// Register a descriptor and return its id.
    pub fn register(&mut self, descriptor: TypeDescriptor) -> TypeId {
        let id = TypeId::new(self.types.len() as u32);
        self.types.push(Some(descriptor));
        id
    }

    /// Look up a descriptor. Id 0 and out-of-range ids return `None`.
    pub fn get(&self, id: TypeId) -> Option<&TypeDescriptor> {
        self.types.get(id.index() as usize)?.as_ref()
    }

    /// Number of registered types (excluding the reserved null slot).
    pub fn len(&self) -> usize {
        self.types.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subtype query backing both `is_a?` filters.
    ///
    /// The null id is a subtype of nothing, including itself. A union
    /// filter matches when any member matches; otherwise the candidate's
    /// parent chain is walked.
    pub fn is_subtype(&self, candidate: TypeId, filter: TypeId) -> bool {
        if candidate.is_null() || filter.is_null() {
            return false;
        }
        if candidate == filter {
            return true;
        }
        if let Some(filter_desc) = self.get(filter)
            && let TypeKind::Union { members } = &filter_desc.kind
        {
            return members.iter().any(|&m| self.is_subtype(candidate, m));
        }
        let mut current = candidate;
        while let Some(desc) = self.get(current) {
            let parent = match &desc.kind {
                TypeKind::Class { parent } | TypeKind::Struct { parent } => *parent,
                _ => None,
            };
            match parent {
                Some(p) if p == filter => return true,
                Some(p) => current = p,
                None => return false,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_hierarchy() -> (TypeTable, TypeId, TypeId, TypeId) {
        let mut table = TypeTable::new();
        let base = table.register(TypeDescriptor::new(
            "Base",
            TypeKind::Class { parent: None },
            8,
            8,
        ));
        let derived = table.register(TypeDescriptor::new(
            "Derived",
            TypeKind::Class { parent: Some(base) },
            8,
            8,
        ));
        let other = table.register(TypeDescriptor::new(
            "Other",
            TypeKind::Class { parent: None },
            8,
            8,
        ));
        (table, base, derived, other)
    }

    #[test]
    fn ids_start_at_one() {
        let mut table = TypeTable::new();
        let first = table.register(TypeDescriptor::new(
            "Int32",
            TypeKind::Primitive(PrimitiveKind::I32),
            4,
            4,
        ));
        assert_eq!(first.index(), 1);
        assert!(table.get(TypeId::NULL).is_none());
        assert_eq!(table.get(first).unwrap().name, "Int32");
    }

    #[test]
    fn subtype_via_parent_chain() {
        let (table, base, derived, other) = table_with_hierarchy();
        assert!(table.is_subtype(derived, base));
        assert!(table.is_subtype(derived, derived));
        assert!(!table.is_subtype(base, derived));
        assert!(!table.is_subtype(other, base));
    }

    #[test]
    fn subtype_via_union_filter() {
        let (mut table, base, derived, other) = table_with_hierarchy();
        let union = table.register(TypeDescriptor::new(
            "(Base | Other)",
            TypeKind::Union {
                members: vec![base, other],
            },
            16,
            8,
        ));
        assert!(table.is_subtype(base, union));
        assert!(table.is_subtype(derived, union));
        assert!(table.is_subtype(other, union));
        assert!(!table.is_subtype(union, base));
    }

    #[test]
    fn null_is_subtype_of_nothing() {
        let (table, base, _, _) = table_with_hierarchy();
        assert!(!table.is_subtype(TypeId::NULL, base));
        assert!(!table.is_subtype(TypeId::NULL, TypeId::NULL));
        assert!(!table.is_subtype(base, TypeId::NULL));
    }

    #[test]
    fn primitive_sizes() {
        assert_eq!(PrimitiveKind::Bool.size(), 1);
        assert_eq!(PrimitiveKind::U16.size(), 2);
        assert_eq!(PrimitiveKind::F32.size(), 4);
        assert_eq!(PrimitiveKind::U64.size(), 8);
    }
}
