//! Information units.
//!
//! An IU is the identity of a logical column as it flows through a
//! pipeline.  IUs live in an [`IuSpace`] arena shared by the whole query;
//! identity is the arena index, so two IUs with equal type and name are
//! still distinct.
//!
//! Pseudo-IUs carry ordering or scope constraints between suboperators
//! without materializing any data: the void-typed scope markers of filters
//! and key packers, and the loop-counter IUs produced by drivers.

use std::sync::Arc;

use inkfuse_ir::Type;
use parking_lot::Mutex;

/// Stable identity of an IU within one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IuId(pub usize);

/// Descriptor of one IU.
#[derive(Debug, Clone)]
pub struct Iu {
    pub ty: Type,
    pub name: String,
    /// Pseudo-IUs never appear in materialized columnar storage.
    pub pseudo: bool,
}

/// Shared arena of IU descriptors.  Cloning shares the arena.
#[derive(Debug, Clone, Default)]
pub struct IuSpace {
    inner: Arc<Mutex<Vec<Iu>>>,
}

impl IuSpace {
    pub fn new() -> IuSpace {
        IuSpace::default()
    }

    /// Create a materializable IU.
    pub fn create(&self, ty: Type, name: impl Into<String>) -> IuId {
        self.push(Iu {
            ty,
            name: name.into(),
            pseudo: false,
        })
    }

    /// Create an ordering/scope pseudo-IU.
    pub fn create_pseudo(&self, ty: Type, name: impl Into<String>) -> IuId {
        self.push(Iu {
            ty,
            name: name.into(),
            pseudo: true,
        })
    }

    fn push(&self, iu: Iu) -> IuId {
        let mut ius = self.inner.lock();
        ius.push(iu);
        IuId(ius.len() - 1)
    }

    pub fn ty(&self, id: IuId) -> Type {
        self.inner.lock()[id.0].ty.clone()
    }

    pub fn is_pseudo(&self, id: IuId) -> bool {
        self.inner.lock()[id.0].pseudo
    }

    /// Identifier usable as a generated variable name.
    pub fn var_name(&self, id: IuId) -> String {
        let ius = self.inner.lock();
        let iu = &ius[id.0];
        if iu.name.is_empty() {
            format!("iu_{}", id.0)
        } else {
            let sanitized: String = iu
                .name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            format!("iu_{}_{}", sanitized, id.0)
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_by_arena_index() {
        let ius = IuSpace::new();
        let a = ius.create(Type::UnsignedInt(8), "c");
        let b = ius.create(Type::UnsignedInt(8), "c");
        assert_ne!(a, b);
        assert_eq!(ius.ty(a), ius.ty(b));
    }

    #[test]
    fn clones_share_the_arena() {
        let ius = IuSpace::new();
        let other = ius.clone();
        let id = other.create(Type::Bool, "flag");
        assert_eq!(ius.ty(id), Type::Bool);
        assert_eq!(ius.len(), 1);
    }

    #[test]
    fn var_names_are_sanitized_and_unique() {
        let ius = IuSpace::new();
        let a = ius.create(Type::Bool, "l.ok");
        let b = ius.create(Type::Bool, "");
        assert_eq!(ius.var_name(a), "iu_l_ok_0");
        assert_eq!(ius.var_name(b), "iu_1");
    }
}
