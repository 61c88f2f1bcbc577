//! Identifier types for interpreter side tables.
//!
//! All registries the executor consults (type descriptors, compiled defs,
//! blocks, lib functions, call interfaces, symbols) are dense append-only
//! tables; these newtypes keep their indices from being mixed up.

use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            /// Create a new id with the given index.
            #[inline]
            pub const fn new(index: u32) -> Self {
                Self(index)
            }

            /// Get the underlying index.
            #[inline]
            pub const fn index(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<u32> for $name {
            fn from(index: u32) -> Self {
                Self::new(index)
            }
        }

        impl From<$name> for u32 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

id_type!(
    /// Identifies a monomorphized type in the [`TypeTable`].
    ///
    /// The semantic analyzer assigns ids densely starting at 1; id 0 is
    /// reserved for the null reference and never names a real type.
    ///
    /// [`TypeTable`]: crate::type_table::TypeTable
    TypeId,
    "type_"
);

id_type!(
    /// Identifies an interned symbol in the context's symbol table.
    SymbolId,
    "sym_"
);

id_type!(
    /// Identifies a compiled method body in the def registry.
    ///
    /// Object identity of a compiled def is its arena index; the interpreter
    /// never compares def contents.
    DefId,
    "def_"
);

id_type!(
    /// Identifies a compiled block body in the block registry.
    BlockId,
    "block_"
);

id_type!(
    /// Identifies a resolved C library function.
    LibFnId,
    "libfn_"
);

id_type!(
    /// Identifies a registered foreign call interface (arg/return types).
    CifId,
    "cif_"
);

id_type!(
    /// Identifies a fiber known to the fiber host.
    FiberId,
    "fiber_"
);

impl TypeId {
    /// The reserved id of the null reference.
    pub const NULL: TypeId = TypeId(0);

    /// Whether this id is the reserved null-reference id.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_creation() {
        let id = DefId::new(42);
        assert_eq!(id.index(), 42);
    }

    #[test]
    fn id_display() {
        assert_eq!(format!("{}", TypeId::new(5)), "type_5");
        assert_eq!(format!("{}", BlockId::new(3)), "block_3");
    }

    #[test]
    fn id_conversions() {
        let id: SymbolId = 10.into();
        assert_eq!(id.index(), 10);
        let raw: u32 = id.into();
        assert_eq!(raw, 10);
    }

    #[test]
    fn null_type_id() {
        assert!(TypeId::NULL.is_null());
        assert!(!TypeId::new(1).is_null());
        assert_eq!(TypeId::NULL.index(), 0);
    }
}
