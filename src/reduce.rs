//! The reduction engine (spec.md §4.H): per-type, element-wise `reduce`
//! over one of `{Sum, Prod, Min, Max}`, plus each op's identity value.
//!
//! Grounded on `difference.rs`'s `Semigroup`/`IsZero` pattern in the
//! teacher: a small, closed trait over the handful of primitive kinds this
//! crate's `Type` can describe, rather than a generic numeric trait,
//! because `Type` is a runtime value (spec.md's container is built around a
//! `Type` descriptor chosen at run time, not a Rust generic parameter).

use std::fmt;

/// The reduction operator named on a `Reduce` access intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Elementwise sum; identity `0`.
    Sum,
    /// Elementwise product; identity `1`.
    Prod,
    /// Elementwise minimum; identity is the type's maximum value.
    Min,
    /// Elementwise maximum; identity is the type's minimum value.
    Max,
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Prod => "prod",
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
        };
        f.write_str(s)
    }
}

/// The primitive numeric representations `Type` can describe as reducible.
/// Plain-old-data types (opaque byte blobs with no reduce) are not
/// members of this enum; see `crate::types::Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    /// 8-byte IEEE-754 double.
    F64,
    /// 8-byte signed integer.
    I64,
}

impl Primitive {
    /// Size in bytes of one element.
    pub fn size(&self) -> usize {
        match self {
            Primitive::F64 => 8,
            Primitive::I64 => 8,
        }
    }

    /// The identity value for `op`, as raw little-endian bytes of one
    /// element.
    pub fn identity(&self, op: ReduceOp) -> Vec<u8> {
        match self {
            Primitive::F64 => {
                let v: f64 = match op {
                    ReduceOp::Sum => 0.0,
                    ReduceOp::Prod => 1.0,
                    ReduceOp::Min => f64::MAX,
                    ReduceOp::Max => f64::MIN,
                };
                v.to_le_bytes().to_vec()
            }
            Primitive::I64 => {
                let v: i64 = match op {
                    ReduceOp::Sum => 0,
                    ReduceOp::Prod => 1,
                    ReduceOp::Min => i64::MAX,
                    ReduceOp::Max => i64::MIN,
                };
                v.to_le_bytes().to_vec()
            }
        }
    }

    /// Applies `op` element-wise to `dst` and `src`, writing the result back
    /// into `dst`: `dst := dst op src`. This is the in-place convention
    /// spec.md §4.H describes ("when `dst == a`"); because Rust cannot
    /// alias a `&mut` and a `&` to the same bytes, in-place here means
    /// "one buffer plays both roles", which is the only way the convention
    /// can be expressed safely, and is exactly how `recv_slice` applies a
    /// reduction to bytes as they arrive without a staging buffer.
    pub fn reduce(&self, op: ReduceOp, dst: &mut [u8], src: &[u8], n: usize) {
        let size = self.size();
        assert_eq!(dst.len(), n * size, "dst buffer does not match element count");
        assert_eq!(src.len(), n * size, "src buffer does not match element count");
        match self {
            Primitive::F64 => reduce_typed::<f64>(op, dst, src, n, f64::from_le_bytes, f64::to_le_bytes),
            Primitive::I64 => reduce_typed::<i64>(op, dst, src, n, i64::from_le_bytes, i64::to_le_bytes),
        }
    }

    /// Applies `op` element-wise to `a` and `b`, writing the result into a
    /// separate `dst` buffer. Used by the manual subgroup-reduce algorithm
    /// (§4.F) where the accumulator and the newly-received contribution are
    /// genuinely distinct buffers.
    pub fn reduce_into(&self, op: ReduceOp, dst: &mut [u8], a: &[u8], b: &[u8], n: usize) {
        dst.copy_from_slice(a);
        self.reduce(op, dst, b, n);
    }
}

fn reduce_typed<T: Copy + PartialOrd + std::ops::Add<Output = T> + std::ops::Mul<Output = T>>(
    op: ReduceOp,
    dst: &mut [u8],
    src: &[u8],
    n: usize,
    from_bytes: fn([u8; 8]) -> T,
    to_bytes: fn(T) -> [u8; 8],
) {
    for i in 0..n {
        let range = i * 8..i * 8 + 8;
        let dv = from_bytes(dst[range.clone()].try_into().unwrap());
        let sv = from_bytes(src[range.clone()].try_into().unwrap());
        let rv = match op {
            ReduceOp::Sum => dv + sv,
            ReduceOp::Prod => dv * sv,
            ReduceOp::Min => if dv < sv { dv } else { sv },
            ReduceOp::Max => if dv > sv { dv } else { sv },
        };
        dst[range].copy_from_slice(&to_bytes(rv));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f64_sum_identity_is_zero() {
        assert_eq!(Primitive::F64.identity(ReduceOp::Sum), 0.0f64.to_le_bytes().to_vec());
    }

    #[test]
    fn f64_max_reduce_into() {
        let a = [3.0f64, 9.0].iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>();
        let b = [7.0f64, 5.0].iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>();
        let mut dst = vec![0u8; 16];
        Primitive::F64.reduce_into(ReduceOp::Max, &mut dst, &a, &b, 2);
        let out: Vec<f64> = dst.chunks(8).map(|c| f64::from_le_bytes(c.try_into().unwrap())).collect();
        assert_eq!(out, vec![7.0, 9.0]);
    }

    #[test]
    fn in_place_reduce() {
        // dst doubles as the accumulator: the reducer is also a participant.
        let mut acc = [1.0f64, 2.0, 3.0].iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>();
        let incoming = [10.0f64, 20.0, 30.0].iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>();
        Primitive::F64.reduce(ReduceOp::Sum, &mut acc, &incoming, 3);
        let out: Vec<f64> = acc.chunks(8).map(|c| f64::from_le_bytes(c.try_into().unwrap())).collect();
        assert_eq!(out, vec![11.0, 22.0, 33.0]);
    }
}
