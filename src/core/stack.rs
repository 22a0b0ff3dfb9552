//! Image stacks: ordered sequences of 2-D planes stored as one 3-D array.

use crate::core::error::{StackError, StackResult};
use crate::memory::SharedArray;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape of a single plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaneShape {
    /// Rows.
    pub height: usize,
    /// Columns.
    pub width: usize,
}

impl PlaneShape {
    /// Create a plane shape.
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    /// Elements in one plane.
    pub fn len(&self) -> usize {
        self.height * self.width
    }

    /// Whether the plane has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for PlaneShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// Shape of a stack: `n` planes of `height` x `width`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackShape {
    /// Number of planes (axis 0).
    pub n: usize,
    /// Rows per plane.
    pub height: usize,
    /// Columns per plane.
    pub width: usize,
}

impl StackShape {
    /// Create a stack shape.
    pub fn new(n: usize, height: usize, width: usize) -> Self {
        Self { n, height, width }
    }

    /// Build from a dimension slice, which must have exactly three entries.
    pub fn from_dims(dims: &[usize]) -> StackResult<Self> {
        match *dims {
            [n, height, width] => Ok(Self::new(n, height, width)),
            _ => Err(StackError::Shape(format!(
                "expected a 3-D stack, got {} dimension(s) {:?}",
                dims.len(),
                dims
            ))),
        }
    }

    /// Dimensions as `[n, height, width]`.
    pub fn dims(&self) -> [usize; 3] {
        [self.n, self.height, self.width]
    }

    /// Shape of each plane.
    pub fn plane(&self) -> PlaneShape {
        PlaneShape::new(self.height, self.width)
    }

    /// Elements per plane, saturating at `usize::MAX`.
    pub fn plane_len(&self) -> usize {
        self.height.saturating_mul(self.width)
    }

    /// Total number of elements, saturating at `usize::MAX`. Use
    /// [`checked_len`](Self::checked_len) where an overflow must be reported.
    pub fn len(&self) -> usize {
        self.n.saturating_mul(self.plane_len())
    }

    /// Total number of elements, or `InvalidShape` when the product of the
    /// dimensions does not fit in `usize`. Zero dimensions are allowed.
    pub fn checked_len(&self) -> StackResult<usize> {
        self.height
            .checked_mul(self.width)
            .and_then(|plane| plane.checked_mul(self.n))
            .ok_or_else(|| StackError::invalid_shape(&self.dims(), "element count overflows usize"))
    }

    /// Whether any dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.n == 0 || self.height == 0 || self.width == 0
    }

    /// Same number of planes with a different plane shape.
    pub fn with_plane(&self, plane: PlaneShape) -> Self {
        Self::new(self.n, plane.height, plane.width)
    }
}

impl fmt::Display for StackShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.n, self.height, self.width)
    }
}

enum Storage {
    Heap(Vec<f32>),
    Shared(SharedArray<f32>),
}

/// A 3-D `f32` array of shape (N, H, W), stored contiguously.
///
/// The storage is either an ordinary heap buffer or a [`SharedArray`]. The
/// shape never changes after construction.
pub struct ImageStack {
    shape: StackShape,
    storage: Storage,
}

impl ImageStack {
    /// A heap-backed stack filled with zeros.
    pub fn zeros(shape: StackShape) -> StackResult<Self> {
        let len = shape.checked_len()?;
        Ok(Self {
            shape,
            storage: Storage::Heap(vec![0.0; len]),
        })
    }

    /// A heap-backed stack over `data`, which must hold exactly `shape.len()` elements.
    pub fn from_vec(shape: StackShape, data: Vec<f32>) -> StackResult<Self> {
        let len = shape.checked_len()?;
        if data.len() != len {
            return Err(StackError::Shape(format!(
                "stack {} needs {} elements, got {}",
                shape,
                len,
                data.len()
            )));
        }
        Ok(Self {
            shape,
            storage: Storage::Heap(data),
        })
    }

    /// Like [`from_vec`](Self::from_vec), with the shape given as a dimension slice.
    pub fn from_shape_vec(dims: &[usize], data: Vec<f32>) -> StackResult<Self> {
        Self::from_vec(StackShape::from_dims(dims)?, data)
    }

    /// A stack living in a shared segment.
    pub fn from_shared(shape: StackShape, array: SharedArray<f32>) -> StackResult<Self> {
        let len = shape.checked_len()?;
        if array.len() != len {
            return Err(StackError::Shape(format!(
                "shared array holds {} elements, stack {} needs {}",
                array.len(),
                shape,
                len
            )));
        }
        Ok(Self {
            shape,
            storage: Storage::Shared(array),
        })
    }

    /// Stack shape.
    pub fn shape(&self) -> StackShape {
        self.shape
    }

    /// Shape of each plane.
    pub fn plane_shape(&self) -> PlaneShape {
        self.shape.plane()
    }

    /// Number of planes.
    pub fn num_planes(&self) -> usize {
        self.shape.n
    }

    /// Whether the stack has no elements.
    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    /// Whether the stack lives in shared memory.
    pub fn is_shared(&self) -> bool {
        matches!(self.storage, Storage::Shared(_))
    }

    /// Shared segment name, when shared.
    pub fn segment_name(&self) -> Option<&str> {
        match &self.storage {
            Storage::Shared(array) => Some(array.name()),
            Storage::Heap(_) => None,
        }
    }

    /// All elements in row-major order.
    pub fn as_slice(&self) -> &[f32] {
        match &self.storage {
            Storage::Heap(data) => data,
            Storage::Shared(array) => array.as_slice(),
        }
    }

    /// All elements in row-major order, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        match &mut self.storage {
            Storage::Heap(data) => data,
            Storage::Shared(array) => array.as_mut_slice(),
        }
    }

    /// Plane `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= num_planes()`.
    pub fn plane(&self, index: usize) -> &[f32] {
        let len = self.shape.plane_len();
        &self.as_slice()[index * len..(index + 1) * len]
    }

    /// Plane `index`, mutably.
    ///
    /// # Panics
    ///
    /// Panics if `index >= num_planes()`.
    pub fn plane_mut(&mut self, index: usize) -> &mut [f32] {
        let len = self.shape.plane_len();
        &mut self.as_mut_slice()[index * len..(index + 1) * len]
    }

    /// Iterate over planes in index order.
    pub fn planes(&self) -> impl Iterator<Item = &[f32]> {
        self.as_slice().chunks_exact(self.shape.plane_len().max(1))
    }

    /// Copy the elements into a new heap vector.
    pub fn to_vec(&self) -> Vec<f32> {
        self.as_slice().to_vec()
    }

    /// Take the elements, copying out of shared memory if needed. A shared
    /// segment is released when the stack is consumed.
    pub fn into_vec(self) -> Vec<f32> {
        match self.storage {
            Storage::Heap(data) => data,
            Storage::Shared(array) => array.as_slice().to_vec(),
        }
    }
}

impl fmt::Debug for ImageStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageStack")
            .field("shape", &self.shape)
            .field("shared", &self.segment_name())
            .finish()
    }
}

impl Clone for ImageStack {
    /// Clones always land on the heap; a shared segment has a single owner.
    fn clone(&self) -> Self {
        Self {
            shape: self.shape,
            storage: Storage::Heap(self.to_vec()),
        }
    }
}
