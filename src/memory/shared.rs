//! Arrays backed by named POSIX shared memory.
//!
//! A [`SharedArray`] pairs a typed view with the segment it lives in. The
//! segment is created with `shm_open`, sized with `ftruncate` and mapped with
//! `mmap(MAP_SHARED)`, so any process that knows the name can attach to the
//! same pages through [`SharedArray::attach`].
//!
//! # Ownership
//!
//! Exactly one view, the one returned by
//! [`SharedBufferManager::allocate`](crate::memory::SharedBufferManager::allocate),
//! owns the segment name. Releasing it unmaps the view and unlinks the name.
//! Attached views only ever unmap. Release is idempotent and also runs from
//! `Drop`, so a segment cannot outlive the value that owns it.

use crate::core::error::{StackError, StackResult};
use crate::memory::manager::SegmentRegistry;
use bytemuck::Pod;
use log::{debug, warn};
use rustix::fd::OwnedFd;
use rustix::fs::Mode;
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags};
use rustix::shm::{self, ShmOFlags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

/// Everything another process needs to attach to a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHandle {
    /// POSIX shared memory name, including the leading `/`.
    pub name: String,
    /// Mapped size in bytes.
    pub byte_len: usize,
}

/// Whether a view is responsible for unlinking its segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Created the segment; unlinks it on release.
    Owner,
    /// Mapped an existing segment; only unmaps on release.
    Attached,
}

/// A live mapping of a shared memory object.
pub(crate) struct Segment {
    /// Keeps the descriptor open for the lifetime of the mapping.
    _fd: OwnedFd,
    ptr: NonNull<u8>,
    byte_len: usize,
}

impl Segment {
    /// Create and map a new segment. The name must not exist yet.
    pub(crate) fn create(name: &str, byte_len: usize) -> StackResult<Self> {
        let fd = shm::shm_open(
            name,
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| StackError::Allocation(format!("shm_open({}) failed: {}", name, e)))?;

        // The name is visible from here on; it must not survive a failed setup.
        let mapped = rustix::fs::ftruncate(&fd, byte_len as u64)
            .map_err(|e| StackError::Allocation(format!("ftruncate({}) failed: {}", name, e)))
            .and_then(|()| Self::map(name, fd, byte_len));

        if mapped.is_err() {
            unlink(name);
        }
        mapped
    }

    /// Map an existing segment of at least `byte_len` bytes.
    pub(crate) fn open(name: &str, byte_len: usize) -> StackResult<Self> {
        let fd = shm::shm_open(name, ShmOFlags::RDWR, Mode::empty())
            .map_err(|e| StackError::Allocation(format!("shm_open({}) failed: {}", name, e)))?;

        let actual = rustix::fs::fstat(&fd)?.st_size as u64;
        if actual < byte_len as u64 {
            return Err(StackError::Allocation(format!(
                "segment {} holds {} bytes, {} requested",
                name, actual, byte_len
            )));
        }

        Self::map(name, fd, byte_len)
    }

    fn map(name: &str, fd: OwnedFd, byte_len: usize) -> StackResult<Self> {
        if byte_len == 0 {
            return Err(StackError::Allocation(format!("segment {} has zero length", name)));
        }

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                byte_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|e| StackError::Allocation(format!("mmap({}) failed: {}", name, e)))?;

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| StackError::Allocation("mmap returned null".into()))?;

        Ok(Self {
            _fd: fd,
            ptr,
            byte_len,
        })
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.byte_len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.byte_len) }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Err(e) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.byte_len) } {
            warn!("munmap of {} bytes failed: {}", self.byte_len, e);
        }
        // The descriptor closes when `_fd` drops.
    }
}

// SAFETY: the mapping is plain memory owned by this value. Shared access only
// hands out `&[u8]`, mutable access requires `&mut Segment`.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

/// Unlink a segment name.
///
/// A name that is already gone counts as released. Anything else is only
/// reported, so this can run on every exit path without failing it.
pub(crate) fn unlink(name: &str) {
    match shm::shm_unlink(name) {
        Ok(()) => debug!("Unlinked shared segment {}", name),
        Err(Errno::NOENT) => debug!("Shared segment {} was already unlinked", name),
        Err(e) => warn!("Failed to unlink shared segment {}: {}", name, e),
    }
}

/// A typed array view over a shared memory segment.
pub struct SharedArray<T: Pod> {
    segment: Option<Segment>,
    name: String,
    len: usize,
    ownership: Ownership,
    registry: Option<Arc<SegmentRegistry>>,
    _marker: PhantomData<T>,
}

impl<T: Pod> SharedArray<T> {
    /// Wrap a freshly created segment. The registry already lists `name`.
    pub(crate) fn owned(segment: Segment, name: String, len: usize, registry: Arc<SegmentRegistry>) -> Self {
        debug_assert_eq!(segment.byte_len, len * std::mem::size_of::<T>());
        Self {
            segment: Some(segment),
            name,
            len,
            ownership: Ownership::Owner,
            registry: Some(registry),
            _marker: PhantomData,
        }
    }

    /// Attach to a segment created elsewhere, possibly by another process.
    ///
    /// The returned view never unlinks the segment; its creator stays
    /// responsible for that.
    pub fn attach(handle: &SegmentHandle) -> StackResult<Self> {
        let elem = std::mem::size_of::<T>();
        if elem == 0 || handle.byte_len % elem != 0 {
            return Err(StackError::Allocation(format!(
                "segment {} length {} is not a multiple of the element size {}",
                handle.name, handle.byte_len, elem
            )));
        }

        let segment = Segment::open(&handle.name, handle.byte_len)?;
        debug!("Attached to shared segment {} ({} bytes)", handle.name, handle.byte_len);

        Ok(Self {
            segment: Some(segment),
            name: handle.name.clone(),
            len: handle.byte_len / elem,
            ownership: Ownership::Attached,
            registry: None,
            _marker: PhantomData,
        })
    }

    /// Name of the backing segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle for attaching from elsewhere.
    pub fn handle(&self) -> SegmentHandle {
        SegmentHandle {
            name: self.name.clone(),
            byte_len: self.len * std::mem::size_of::<T>(),
        }
    }

    /// Whether this view owns the segment name.
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Number of elements, or zero once released.
    pub fn len(&self) -> usize {
        if self.segment.is_some() {
            self.len
        } else {
            0
        }
    }

    /// Whether the view holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`release`](Self::release) has run.
    pub fn is_released(&self) -> bool {
        self.segment.is_none()
    }

    /// The elements. Empty after release.
    pub fn as_slice(&self) -> &[T] {
        match &self.segment {
            Some(segment) => bytemuck::cast_slice(segment.bytes()),
            None => &[],
        }
    }

    /// The elements, mutably. Empty after release.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match &mut self.segment {
            Some(segment) => bytemuck::cast_slice_mut(segment.bytes_mut()),
            None => &mut [],
        }
    }

    /// Unmap the view and, for the owner, unlink the segment.
    ///
    /// Calling this more than once is a no-op. Failures are logged, never
    /// returned.
    pub fn release(&mut self) {
        let Some(segment) = self.segment.take() else {
            return;
        };
        drop(segment);

        if self.ownership == Ownership::Owner {
            unlink(&self.name);
            if let Some(registry) = &self.registry {
                registry.remove(&self.name);
            }
        }
    }
}

impl<T: Pod> Drop for SharedArray<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: Pod> fmt::Debug for SharedArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedArray")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("ownership", &self.ownership)
            .field("released", &self.is_released())
            .finish()
    }
}
