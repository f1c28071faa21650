//! Tensors as the operator layer sees them.
//!
//! A [`Tensor`] is a view description (shape, layout, element type, device,
//! sequence offsets) over a shared [`Buffer`]. Operators never own storage
//! semantics beyond that: cloning a tensor clones the handle, not the data,
//! so weights deduplicated by the graph loader stay shared between every
//! operator that references them.
//!
//! ## Layouts
//!
//! The layout tag fixes the rank and says which axis is batch, channel,
//! height and width. `num()`, `channel()`, `height()` and `width()` resolve
//! through it and report `1` for axes the layout does not have.
//!
//! ## Sequence offsets
//!
//! Variable-length batches carry one or more levels of offsets into the
//! batch axis. Every level starts at `0` and never decreases.
//!
//! ## Example
//!
//! ```rust
//! use saber_rt::tensors::{Layout, Tensor};
//! let t = Tensor::from_vec([2, 3, 1, 1], Layout::Nchw, vec![0.0; 6]);
//! assert_eq!((t.num(), t.channel(), t.height(), t.width()), (2, 3, 1, 1));
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Dimension sizes, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    /// Number of elements.
    pub fn count(&self) -> usize {
        self.0.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }
}

impl Deref for Shape {
    type Target = [usize];

    fn deref(&self) -> &[usize] {
        &self.0
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Self(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(v: &[usize]) -> Self {
        Self(v.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(v: [usize; N]) -> Self {
        Self(v.to_vec())
    }
}

/// Memory layout tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Layout {
    W,
    Hw,
    Nc,
    Nhw,
    #[default]
    Nchw,
    Nhwc,
    /// NCHW with channels packed by four in a trailing axis.
    NchwC4,
}

impl Layout {
    /// Number of dimensions a shape with this layout has.
    pub const fn rank(self) -> usize {
        match self {
            Self::W => 1,
            Self::Hw | Self::Nc => 2,
            Self::Nhw => 3,
            Self::Nchw | Self::Nhwc => 4,
            Self::NchwC4 => 5,
        }
    }

    /// Default layout for a given rank, if there is an unambiguous one.
    pub const fn for_rank(rank: usize) -> Option<Self> {
        match rank {
            1 => Some(Self::W),
            4 => Some(Self::Nchw),
            _ => None,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "W" => Some(Self::W),
            "HW" => Some(Self::Hw),
            "NC" => Some(Self::Nc),
            "NHW" => Some(Self::Nhw),
            "NCHW" => Some(Self::Nchw),
            "NHWC" => Some(Self::Nhwc),
            "NCHW_C4" | "NCHWC4" => Some(Self::NchwC4),
            _ => None,
        }
    }

    fn num_index(self) -> Option<usize> {
        match self {
            Self::Nc | Self::Nhw | Self::Nchw | Self::Nhwc | Self::NchwC4 => Some(0),
            Self::W | Self::Hw => None,
        }
    }

    fn channel_index(self) -> Option<usize> {
        match self {
            Self::Nc | Self::Nchw | Self::NchwC4 => Some(1),
            Self::Nhwc => Some(3),
            _ => None,
        }
    }

    fn height_index(self) -> Option<usize> {
        match self {
            Self::Hw => Some(0),
            Self::Nhw | Self::Nhwc => Some(1),
            Self::Nchw | Self::NchwC4 => Some(2),
            _ => None,
        }
    }

    fn width_index(self) -> Option<usize> {
        match self {
            Self::W => Some(0),
            Self::Hw => Some(1),
            Self::Nhw | Self::Nhwc => Some(2),
            Self::Nchw | Self::NchwC4 => Some(3),
            Self::Nc => None,
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::W => "W",
            Self::Hw => "HW",
            Self::Nc => "NC",
            Self::Nhw => "NHW",
            Self::Nchw => "NCHW",
            Self::Nhwc => "NHWC",
            Self::NchwC4 => "NCHW_C4",
        };
        f.write_str(name)
    }
}

/// Element type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    #[default]
    F32,
    I32,
}

/// Typed backing storage of a buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl Storage {
    pub fn zeros(dtype: DataType, len: usize) -> Self {
        match dtype {
            DataType::F32 => Self::F32(vec![0.0; len]),
            DataType::I32 => Self::I32(vec![0; len]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DataType {
        match self {
            Self::F32(_) => DataType::F32,
            Self::I32(_) => DataType::I32,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Self::F32(v) => Some(v),
            Self::I32(_) => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            Self::F32(v) => Some(v),
            Self::I32(_) => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            Self::I32(v) => Some(v),
            Self::F32(_) => None,
        }
    }

    pub fn as_i32_mut(&mut self) -> Option<&mut [i32]> {
        match self {
            Self::I32(v) => Some(v),
            Self::F32(_) => None,
        }
    }
}

struct BufferInner {
    storage: RwLock<Storage>,
    transformed: AtomicBool,
}

/// Shared, internally synchronized storage.
///
/// Besides the data, a buffer carries the one-time transform flag used by
/// operators that rewrite their weights in place on first initialization.
#[derive(Clone)]
pub struct Buffer(Arc<BufferInner>);

impl Buffer {
    pub fn new(storage: Storage) -> Self {
        Self(Arc::new(BufferInner {
            storage: RwLock::new(storage),
            transformed: AtomicBool::new(false),
        }))
    }

    pub fn zeros(dtype: DataType, len: usize) -> Self {
        Self::new(Storage::zeros(dtype, len))
    }

    /// Read access. A poisoned lock still yields the data; a panicking
    /// kernel body cannot leave storage half-typed.
    pub fn read(&self) -> RwLockReadGuard<'_, Storage> {
        self.0.storage.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Storage> {
        self.0.storage.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DataType {
        self.read().dtype()
    }

    /// True when both handles point at the same storage.
    pub fn same(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Flag set once the buffer's contents have been rewritten into a
    /// kernel-specific layout.
    pub fn transform_flag(&self) -> &AtomicBool {
        &self.0.transformed
    }

    pub fn is_transformed(&self) -> bool {
        self.0.transformed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = self.read();
        f.debug_struct("Buffer")
            .field("dtype", &storage.dtype())
            .field("len", &storage.len())
            .field("transformed", &self.is_transformed())
            .finish()
    }
}

/// Panics unless every offset level starts at zero and never decreases.
pub fn check_seq_offset(offsets: &[Vec<usize>]) {
    for (level, lod) in offsets.iter().enumerate() {
        assert!(
            lod.first() == Some(&0),
            "sequence offset level {level} must start at 0, got {lod:?}"
        );
        assert!(
            lod.windows(2).all(|w| w[0] <= w[1]),
            "sequence offset level {level} must be non-decreasing, got {lod:?}"
        );
    }
}

/// Shape, layout and metadata over a shared [`Buffer`].
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Shape,
    layout: Layout,
    device_id: usize,
    seq_offset: Vec<Vec<usize>>,
    buffer: Buffer,
}

impl Default for Tensor {
    /// An empty rank-1 tensor, the usual placeholder for outputs before shape
    /// inference runs.
    fn default() -> Self {
        Self::new([0], Layout::W)
    }
}

impl Tensor {
    /// Zero-filled `f32` tensor.
    ///
    /// # Panics
    /// Panics if the shape rank does not match the layout.
    pub fn new(shape: impl Into<Shape>, layout: Layout) -> Self {
        Self::with_dtype(shape, layout, DataType::F32)
    }

    pub fn with_dtype(shape: impl Into<Shape>, layout: Layout, dtype: DataType) -> Self {
        let shape = shape.into();
        check_rank(&shape, layout);
        let buffer = Buffer::zeros(dtype, shape.count());
        Self {
            shape,
            layout,
            device_id: 0,
            seq_offset: Vec::new(),
            buffer,
        }
    }

    /// `f32` tensor over the given data.
    ///
    /// # Panics
    /// Panics if the data length does not match the shape.
    pub fn from_vec(shape: impl Into<Shape>, layout: Layout, data: Vec<f32>) -> Self {
        Self::from_storage(shape, layout, Storage::F32(data))
    }

    pub fn from_ints(shape: impl Into<Shape>, layout: Layout, data: Vec<i32>) -> Self {
        Self::from_storage(shape, layout, Storage::I32(data))
    }

    fn from_storage(shape: impl Into<Shape>, layout: Layout, storage: Storage) -> Self {
        let shape = shape.into();
        check_rank(&shape, layout);
        assert_eq!(
            shape.count(),
            storage.len(),
            "shape {:?} is incompatible with {} data elements",
            shape.dims(),
            storage.len()
        );
        Self {
            shape,
            layout,
            device_id: 0,
            seq_offset: Vec::new(),
            buffer: Buffer::new(storage),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn dtype(&self) -> DataType {
        self.buffer.dtype()
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    pub fn set_device_id(&mut self, id: usize) {
        self.device_id = id;
    }

    /// Number of elements described by the shape.
    pub fn valid_size(&self) -> usize {
        self.shape.count()
    }

    pub fn dims(&self) -> usize {
        self.shape.len()
    }

    pub fn num(&self) -> usize {
        self.layout.num_index().map_or(1, |i| self.shape[i])
    }

    pub fn channel(&self) -> usize {
        match self.layout {
            Layout::NchwC4 => self.shape[1] * self.shape[4],
            l => l.channel_index().map_or(1, |i| self.shape[i]),
        }
    }

    pub fn height(&self) -> usize {
        self.layout.height_index().map_or(1, |i| self.shape[i])
    }

    pub fn width(&self) -> usize {
        self.layout.width_index().map_or(1, |i| self.shape[i])
    }

    /// Changes shape and layout. Storage is replaced with a fresh zeroed
    /// buffer when the element count changes; otherwise it is kept.
    ///
    /// # Panics
    /// Panics if the shape rank does not match the layout.
    pub fn set_shape(&mut self, shape: impl Into<Shape>, layout: Layout) {
        let shape = shape.into();
        check_rank(&shape, layout);
        if shape.count() != self.buffer.len() {
            self.buffer = Buffer::zeros(self.buffer.dtype(), shape.count());
        }
        self.shape = shape;
        self.layout = layout;
    }

    pub fn seq_offset(&self) -> &[Vec<usize>] {
        &self.seq_offset
    }

    /// # Panics
    /// Panics if any level is malformed (see [`check_seq_offset`]), or if the
    /// innermost level does not end at [`num`](Self::num) for a layout with a
    /// batch axis.
    pub fn set_seq_offset(&mut self, offsets: Vec<Vec<usize>>) {
        check_seq_offset(&offsets);
        if self.layout.num_index().is_some() {
            if let Some(end) = offsets.last().and_then(|lod| lod.last()) {
                assert_eq!(
                    *end,
                    self.num(),
                    "sequence offsets {offsets:?} do not partition a batch of {}",
                    self.num()
                );
            }
        }
        self.seq_offset = offsets;
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Copies the contents out as `f32`, converting integer storage.
    pub fn to_vec(&self) -> Vec<f32> {
        match &*self.buffer.read() {
            Storage::F32(v) => v.clone(),
            Storage::I32(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    /// Overwrites the contents.
    ///
    /// # Panics
    /// Panics if the tensor is not `f32` or the length differs.
    pub fn copy_from_slice(&self, data: &[f32]) {
        let mut storage = self.buffer.write();
        let dst = storage
            .as_f32_mut()
            .unwrap_or_else(|| panic!("copy_from_slice on a non-f32 tensor"));
        assert_eq!(dst.len(), data.len(), "copy_from_slice length mismatch");
        dst.copy_from_slice(data);
    }
}

fn check_rank(shape: &Shape, layout: Layout) {
    assert_eq!(
        shape.len(),
        layout.rank(),
        "shape {:?} does not match layout {layout} (rank {})",
        shape.dims(),
        layout.rank()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_follow_layout() {
        let t = Tensor::new([2, 4, 5, 3], Layout::Nhwc);
        assert_eq!(t.num(), 2);
        assert_eq!(t.height(), 4);
        assert_eq!(t.width(), 5);
        assert_eq!(t.channel(), 3);

        let nc = Tensor::new([7, 9], Layout::Nc);
        assert_eq!((nc.num(), nc.channel(), nc.height(), nc.width()), (7, 9, 1, 1));
    }

    #[test]
    #[should_panic(expected = "does not match layout")]
    fn rank_mismatch_panics() {
        let _ = Tensor::new([2, 3], Layout::Nchw);
    }

    #[test]
    fn clones_share_buffer_and_flag() {
        let t = Tensor::from_vec([1, 2, 1, 1], Layout::Nchw, vec![1.0, 2.0]);
        let u = t.clone();
        assert!(t.buffer().same(u.buffer()));
        t.buffer().transform_flag().store(true, Ordering::Release);
        assert!(u.buffer().is_transformed());
    }

    #[test]
    fn set_shape_keeps_storage_when_count_matches() {
        let mut t = Tensor::from_vec([1, 4, 1, 1], Layout::Nchw, vec![1.0, 2.0, 3.0, 4.0]);
        let before = t.buffer().clone();
        t.set_shape([2, 2], Layout::Nc);
        assert!(t.buffer().same(&before));
        t.set_shape([1, 8, 1, 1], Layout::Nchw);
        assert!(!t.buffer().same(&before));
        assert_eq!(t.to_vec(), vec![0.0; 8]);
    }

    #[test]
    #[should_panic(expected = "must start at 0")]
    fn offsets_must_start_at_zero() {
        let mut t = Tensor::new([3, 1, 1, 1], Layout::Nchw);
        t.set_seq_offset(vec![vec![1, 3]]);
    }

    #[test]
    #[should_panic(expected = "non-decreasing")]
    fn offsets_must_not_decrease() {
        let mut t = Tensor::new([3, 1, 1, 1], Layout::Nchw);
        t.set_seq_offset(vec![vec![0, 2, 1]]);
    }

    #[test]
    #[should_panic(expected = "do not partition a batch of 3")]
    fn offsets_must_cover_the_batch() {
        let mut t = Tensor::new([3, 1, 1, 1], Layout::Nchw);
        t.set_seq_offset(vec![vec![0, 7]]);
    }

    #[test]
    fn offsets_on_batchless_layouts_are_unchecked() {
        let mut t = Tensor::new([3, 4], Layout::Hw);
        t.set_seq_offset(vec![vec![0, 7]]);
        assert_eq!(t.seq_offset(), &[vec![0, 7]]);
    }
}
