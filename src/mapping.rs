//! Local memory and its `Layout` (spec.md §6, §9): how a container's
//! locally-owned slice is laid out in memory, and the pack/unpack
//! operations the transition planner and backends use to move data in and
//! out of it.
//!
//! Grounded on `trace/mod.rs`'s split between a small capability trait
//! (`TraceReader`) and a concrete implementation holding the actual
//! storage: `Layout` is the capability (an addressing scheme), `Mapping`
//! owns the buffer. The backing-buffer allocation itself follows
//! `containers.rs`'s raw `Vec<u8>`-backed storage.

use std::fmt;

use crate::error::PartgridError;
use crate::index::{Point, Slice};
use crate::reduce::Primitive;

/// An addressing scheme over a `Slice`'s indices: where, within a flat
/// buffer, does a given point's element live.
///
/// The default `pack`/`unpack` are enough for any layout that can answer
/// `offset`; a layout need only override them if it can move more than one
/// element at a time faster than the naive per-point loop.
pub trait Layout: fmt::Debug {
    /// The element offset (not byte offset) of `point` within `slice`,
    /// under this layout. `point` must lie within `slice`.
    fn offset(&self, slice: &Slice, point: Point) -> usize;

    /// Packs the elements of `region` (`region` must lie within `slice`)
    /// out of `buffer` (addressed via `slice`) into `out`, contiguously, in
    /// `region`'s lexicographic order.
    fn pack(&self, slice: &Slice, region: &Slice, buffer: &[u8], elem_size: usize, out: &mut [u8]) {
        for (i, point) in region.iter().enumerate() {
            let src = self.offset(slice, point) * elem_size;
            let dst = i * elem_size..(i + 1) * elem_size;
            out[dst].copy_from_slice(&buffer[src..src + elem_size]);
        }
    }

    /// The inverse of `pack`: scatters `src`'s contiguous, `region`-ordered
    /// elements back into `buffer` at the offsets `offset` names.
    fn unpack(&self, slice: &Slice, region: &Slice, buffer: &mut [u8], elem_size: usize, src: &[u8]) {
        for (i, point) in region.iter().enumerate() {
            let dst = self.offset(slice, point) * elem_size;
            let range = i * elem_size..(i + 1) * elem_size;
            buffer[dst..dst + elem_size].copy_from_slice(&src[range]);
        }
    }
}

/// Row-major addressing (last axis fastest), the default and most common
/// layout: element offset is the point's position in the same
/// lexicographic order `Slice::iter` walks.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseRowMajorLayout;

impl Layout for DenseRowMajorLayout {
    fn offset(&self, slice: &Slice, point: Point) -> usize {
        let shape = slice.shape();
        let from = slice.from();
        let dims = slice.dims();
        let mut offset = 0usize;
        for axis in 0..dims {
            offset = offset * shape[axis] as usize + (point[axis] - from[axis]) as usize;
        }
        offset
    }
}

/// The local memory backing a container's active partitioning: a flat
/// buffer addressed by `layout` over `required_slice`, the bounding box of
/// every slice this process owns under the current `Partitioning`.
///
/// `buffer` is `None` for a rank that owns nothing under the current
/// partitioning (an empty `required_slice`); there is nothing to allocate.
pub struct Mapping {
    required_slice: Slice,
    elem_size: usize,
    layout: Box<dyn Layout + Send + Sync>,
    buffer: Option<Vec<u8>>,
    primitive: Option<Primitive>,
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("required_slice", &self.required_slice)
            .field("elem_size", &self.elem_size)
            .field("layout", &self.layout)
            .field("allocated", &self.buffer.is_some())
            .finish()
    }
}

impl Mapping {
    /// Allocates a `Mapping` over `required_slice` using the default
    /// `DenseRowMajorLayout`. An empty `required_slice` allocates nothing.
    pub fn new(required_slice: Slice, elem_size: usize) -> Result<Self, PartgridError> {
        Mapping::with_layout(required_slice, elem_size, Box::new(DenseRowMajorLayout))
    }

    /// Allocates a `Mapping` over `required_slice` with an explicit
    /// `layout`.
    pub fn with_layout(
        required_slice: Slice,
        elem_size: usize,
        layout: Box<dyn Layout + Send + Sync>,
    ) -> Result<Self, PartgridError> {
        let buffer = if required_slice.is_empty() {
            None
        } else {
            let bytes = required_slice.len() * elem_size;
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(bytes)
                .map_err(|e| PartgridError::OutOfMemory(format!("mapping buffer ({bytes} bytes): {e}")))?;
            buffer.resize(bytes, 0);
            Some(buffer)
        };
        Ok(Mapping { required_slice, elem_size, layout, buffer, primitive: None })
    }

    /// Tags this mapping with the numeric `Primitive` its bytes represent,
    /// so a backend's reduce step (`recv_slice` accumulating contributions
    /// for a `Reduce` access intent) knows how to interpret them. Plain
    /// `Pod`-typed containers leave this unset.
    pub fn with_primitive(mut self, primitive: Primitive) -> Self {
        self.primitive = Some(primitive);
        self
    }

    /// The numeric primitive this mapping's bytes represent, if tagged via
    /// `with_primitive`.
    pub fn primitive(&self) -> Option<Primitive> { self.primitive }

    /// The bounding box of indices this mapping addresses.
    pub fn required_slice(&self) -> Slice { self.required_slice }

    /// Size in bytes of one element.
    pub fn elem_size(&self) -> usize { self.elem_size }

    /// True if this mapping owns an allocated buffer.
    pub fn is_allocated(&self) -> bool { self.buffer.is_some() }

    /// The raw backing buffer, if allocated.
    pub fn buffer(&self) -> Option<&[u8]> { self.buffer.as_deref() }

    /// The raw backing buffer, mutably, if allocated.
    pub fn buffer_mut(&mut self) -> Option<&mut [u8]> { self.buffer.as_deref_mut() }

    /// Packs `region` (which must lie within `required_slice`) into a
    /// freshly allocated contiguous buffer, in `region`'s lexicographic
    /// order — the form `send_slice` needs to hand a byte range to a
    /// backend.
    pub fn pack(&self, region: &Slice) -> Vec<u8> {
        let mut out = vec![0u8; region.len() * self.elem_size];
        if let Some(buffer) = &self.buffer {
            self.layout.pack(&self.required_slice, region, buffer, self.elem_size, &mut out);
        }
        out
    }

    /// Scatters `src` (contiguous, in `region`'s lexicographic order) into
    /// this mapping's buffer at `region` — the form `recv_slice` needs
    /// after reading a contiguous payload off the wire.
    pub fn unpack(&mut self, region: &Slice, src: &[u8]) {
        if let Some(buffer) = &mut self.buffer {
            self.layout.unpack(&self.required_slice, region, buffer, self.elem_size, src);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_slice_allocates_nothing() {
        let slice = Slice::new(&[(4, 4)]).unwrap();
        let m = Mapping::new(slice, 8).unwrap();
        assert!(!m.is_allocated());
    }

    #[test]
    fn pack_unpack_round_trip_2d() {
        let required = Slice::new(&[(0, 3), (0, 2)]).unwrap();
        let mut m = Mapping::new(required, 8).unwrap();

        let payload: Vec<u8> = (0..required.len() as i64)
            .flat_map(|v| v.to_le_bytes())
            .collect();
        m.unpack(&required, &payload);

        let region = Slice::new(&[(1, 3), (0, 2)]).unwrap();
        let packed = m.pack(&region);
        let values: Vec<i64> = packed.chunks(8).map(|c| i64::from_le_bytes(c.try_into().unwrap())).collect();
        // Row-major: rows 1 and 2 of a 3x2 grid are elements [2,3,4,5].
        assert_eq!(values, vec![2, 3, 4, 5]);
    }

    #[test]
    fn offset_is_row_major() {
        let slice = Slice::new(&[(0, 2), (0, 3)]).unwrap();
        let layout = DenseRowMajorLayout;
        assert_eq!(layout.offset(&slice, [0, 0, 0]), 0);
        assert_eq!(layout.offset(&slice, [0, 2, 0]), 2);
        assert_eq!(layout.offset(&slice, [1, 0, 0]), 3);
        assert_eq!(layout.offset(&slice, [1, 2, 0]), 5);
    }
}
