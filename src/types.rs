//! The `Type` descriptor (spec.md §3): what a container's elements are,
//! and whether they carry a reduction.
//!
//! Grounded on `difference.rs`'s split between `Semigroup` types (carry a
//! `plus_equals`) and plain difference types that don't: `Kind::Reducible`
//! wraps `reduce::Primitive` (which knows how to combine), `Kind::Pod`
//! describes an opaque byte blob with no combining operation at all.

use crate::error::PartgridError;
use crate::reduce::Primitive;

/// What operations, if any, elements of a `Type` support under a `Reduce`
/// access intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Opaque bytes: copied and moved, but never combined. A `Partitioning`
    /// naming `AccessIntent::Reduce` over a `Pod` type is a config error.
    Pod,
    /// A primitive numeric type that can be combined with `ReduceOp`.
    Reducible(Primitive),
}

/// A runtime element-type descriptor. Unlike most of this crate's data
/// model, `Type` is chosen at run time rather than expressed as a Rust
/// generic parameter (containers of different element types are meant to
/// coexist in one process), so `Mapping`'s buffers are always raw bytes
/// sized by `elem_size`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Type {
    name: String,
    kind: Kind,
    elem_size: usize,
}

impl Type {
    /// A named opaque type of `elem_size` bytes, with no reduce support.
    pub fn pod(name: impl Into<String>, elem_size: usize) -> Result<Self, PartgridError> {
        if elem_size == 0 {
            return Err(PartgridError::config("pod type must have a non-zero element size"));
        }
        Ok(Type { name: name.into(), kind: Kind::Pod, elem_size })
    }

    /// A named reducible type backed by `primitive`.
    pub fn reducible(name: impl Into<String>, primitive: Primitive) -> Self {
        Type { name: name.into(), kind: Kind::Reducible(primitive), elem_size: primitive.size() }
    }

    /// The 8-byte IEEE-754 double type, named `"f64"`.
    pub fn f64() -> Self {
        Type::reducible("f64", Primitive::F64)
    }

    /// The 8-byte signed integer type, named `"i64"`.
    pub fn i64() -> Self {
        Type::reducible("i64", Primitive::I64)
    }

    /// The descriptor's name, as given at construction.
    pub fn name(&self) -> &str { &self.name }

    /// Size in bytes of one element.
    pub fn elem_size(&self) -> usize { self.elem_size }

    /// The type's `Kind`.
    pub fn kind(&self) -> Kind { self.kind }

    /// The backing `Primitive`, if this type is reducible.
    pub fn primitive(&self) -> Option<Primitive> {
        match self.kind {
            Kind::Reducible(p) => Some(p),
            Kind::Pod => None,
        }
    }

    /// True if a `Reduce` access intent is legal for this type.
    pub fn supports_reduce(&self) -> bool {
        matches!(self.kind, Kind::Reducible(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::ReduceOp;

    #[test]
    fn pod_rejects_zero_size() {
        assert!(Type::pod("opaque", 0).is_err());
        assert!(Type::pod("opaque", 16).is_ok());
    }

    #[test]
    fn reducible_round_trips_primitive() {
        let t = Type::f64();
        assert_eq!(t.elem_size(), 8);
        assert!(t.supports_reduce());
        assert_eq!(t.primitive(), Some(Primitive::F64));
    }

    #[test]
    fn pod_does_not_support_reduce() {
        let t = Type::pod("blob", 32).unwrap();
        assert!(!t.supports_reduce());
        assert_eq!(t.primitive(), None);
        // Identity is still reachable via the primitive when present; pod
        // types simply have none to ask.
        let _ = ReduceOp::Sum;
    }
}
