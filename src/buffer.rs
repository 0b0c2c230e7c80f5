//! Buffer memory and the move-only handles that mediate access to it.
//!
//! At any instant a buffer index is owned by exactly one party: the queue's
//! free list, the kernel, or a single outstanding ref. The refs return their
//! index to the free list on drop unless the buffer was handed to the kernel,
//! which keeps the ownership accounting exact without reference counting.

use std::collections::BTreeSet;
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use nix::libc::timeval;

use crate::buf_type::BufType;
use crate::error::{Error, Result};
use crate::frame::VideoFrame;
use crate::raw::{self, VIDEO_MAX_PLANES};
use crate::shared::{BufFlag, Memory};
use crate::Device;

/// One mmap'ed plane region.
struct PlaneMapping {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is private to its `Buffer`; access goes through the exclusive
// buffer refs, which serialize readers and writers.
unsafe impl Send for PlaneMapping {}
unsafe impl Sync for PlaneMapping {}

/// One kernel-allocated V4L2 buffer and its per-plane memory.
pub(crate) struct Buffer {
    device: Arc<Device>,
    buffer_type: BufType,
    memory: Memory,
    format: raw::PixFormatMplane,
    index: u32,
    /// Plane descriptors as returned by `VIDIOC_QUERYBUF`; `bytesused` stays
    /// zero in this template, refs carry their own working copies.
    planes: [raw::Plane; VIDEO_MAX_PLANES],
    planes_count: usize,
    plane_mappings: Mutex<Vec<Option<PlaneMapping>>>,
    video_frame: Mutex<Option<Arc<VideoFrame>>>,
    /// Presentation timestamp the integrator associates with the payload
    /// currently in this buffer.
    pts: AtomicI64,
}

impl Buffer {
    pub(crate) fn new(
        device: Arc<Device>,
        buffer_type: BufType,
        memory: Memory,
        format: raw::PixFormatMplane,
        index: u32,
    ) -> Buffer {
        let planes_count = usize::from(format.num_planes).min(VIDEO_MAX_PLANES);
        log::debug!(
            "{} buffer created: index={}, planes={}",
            if buffer_type.is_output() { "input" } else { "output" },
            index,
            planes_count
        );

        Buffer {
            device,
            buffer_type,
            memory,
            format,
            index,
            planes: [unsafe { std::mem::zeroed() }; VIDEO_MAX_PLANES],
            planes_count,
            plane_mappings: Mutex::new((0..planes_count).map(|_| None).collect()),
            video_frame: Mutex::new(None),
            pts: AtomicI64::new(0),
        }
    }

    /// Queries the kernel for the buffer's plane lengths and offsets.
    pub(crate) fn query(&mut self) -> Result<()> {
        let mut v4l2_buffer: raw::Buffer = unsafe { std::mem::zeroed() };
        v4l2_buffer.index = self.index;
        v4l2_buffer.type_ = self.buffer_type;
        v4l2_buffer.memory = self.memory;
        v4l2_buffer.length = self.planes_count as u32;
        v4l2_buffer.m.planes = self.planes.as_mut_ptr();

        self.device.querybuf(&mut v4l2_buffer)?;
        Ok(())
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn planes_count(&self) -> usize {
        self.planes_count
    }

    pub(crate) fn planes(&self) -> &[raw::Plane] {
        &self.planes[..self.planes_count]
    }

    pub(crate) fn memory(&self) -> Memory {
        self.memory
    }

    pub(crate) fn pts(&self) -> i64 {
        self.pts.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pts(&self, pts: i64) {
        self.pts.store(pts, Ordering::Relaxed);
    }

    /// Returns the mapping of plane `plane`, mmap'ing it on first access.
    ///
    /// The mmap syscall runs outside the mappings lock; the exclusive buffer
    /// refs guarantee no two parties race to map the same plane.
    fn plane_mapping(&self, plane: usize) -> Result<NonNull<u8>> {
        if plane >= self.planes_count {
            return Err(Error::InvalidArgument("plane index out of range"));
        }

        {
            let mappings = self.plane_mappings.lock().unwrap();
            if let Some(mapping) = &mappings[plane] {
                return Ok(mapping.ptr);
            }
        }

        if self.memory != Memory::MMAP {
            return Err(Error::InvalidArgument(
                "cannot create a mapping on a non-MMAP buffer",
            ));
        }

        let len = self.planes[plane].length as usize;
        let offset = unsafe { self.planes[plane].m.mem_offset };
        let ptr = self.device.mmap(len, offset)?;
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| Error::Platform(std::io::Error::from_raw_os_error(nix::libc::EINVAL)))?;

        self.plane_mappings.lock().unwrap()[plane] = Some(PlaneMapping { ptr, len });
        Ok(ptr)
    }

    /// The frame layout of this buffer with its exported DMABUF fds,
    /// created on first use.
    ///
    /// Export ioctls run outside the lock; the exclusive buffer refs
    /// guarantee no two parties race to create the frame.
    pub(crate) fn video_frame(&self) -> Option<Arc<VideoFrame>> {
        {
            let slot = self.video_frame.lock().unwrap();
            if let Some(frame) = &*slot {
                return Some(frame.clone());
            }
        }

        let mut frame = VideoFrame::from_v4l2_format(&self.format)?;
        frame.dmabuf_fds =
            self.device
                .dmabufs_for_buffer(self.index, self.planes_count, self.buffer_type);
        if frame.dmabuf_fds.is_empty() {
            log::error!("failed to export DMABUFs of buffer {}", self.index);
            return None;
        }

        if !frame.dup_fds_to_plane_count() {
            return None;
        }

        let frame = Arc::new(frame);
        *self.video_frame.lock().unwrap() = Some(frame.clone());
        Some(frame)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.memory != Memory::MMAP {
            return;
        }

        let mappings = self.plane_mappings.get_mut().unwrap();
        for mapping in mappings.iter().flatten() {
            self.device
                .munmap(mapping.ptr.as_ptr() as *mut _, mapping.len);
        }
    }
}

/// Thread-safe set of buffer indices currently owned by a queue.
///
/// This is the only queue structure shared across threads: a ref dropped on
/// another thread pushes its index back here.
pub(crate) struct FreeList {
    free: Mutex<BTreeSet<u32>>,
}

impl FreeList {
    pub(crate) fn new() -> FreeList {
        FreeList {
            free: Mutex::new(BTreeSet::new()),
        }
    }

    pub(crate) fn return_buffer(&self, index: u32) {
        self.free.lock().unwrap().insert(index);
    }

    pub(crate) fn get_free_buffer(&self) -> Option<u32> {
        let mut free = self.free.lock().unwrap();
        let index = *free.iter().next()?;
        free.remove(&index);
        Some(index)
    }

    pub(crate) fn len(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

/// State shared by both ref flavors.
pub(crate) struct BufferRefBase {
    pub(crate) index: u32,
    pub(crate) memory: Memory,
    pub(crate) flags: BufFlag,
    pub(crate) timestamp: timeval,
    pub(crate) buffer_id: i32,
    pub(crate) planes: [raw::Plane; VIDEO_MAX_PLANES],
    pub(crate) planes_count: usize,
    pub(crate) buffer: Arc<Buffer>,
    free_list: Arc<FreeList>,
    pub(crate) queued: bool,
}

impl BufferRefBase {
    pub(crate) fn new(
        buffer: Arc<Buffer>,
        free_list: Arc<FreeList>,
        flags: BufFlag,
        timestamp: timeval,
    ) -> BufferRefBase {
        let mut planes = [unsafe { std::mem::zeroed() }; VIDEO_MAX_PLANES];
        let planes_count = buffer.planes_count();
        planes[..planes_count].copy_from_slice(buffer.planes());

        BufferRefBase {
            index: buffer.index(),
            memory: buffer.memory(),
            flags,
            timestamp,
            buffer_id: 0,
            planes,
            planes_count,
            buffer,
            free_list,
            queued: false,
        }
    }

    fn plane_slice(&self, plane: usize) -> Result<&mut [u8]> {
        if plane >= self.planes_count {
            return Err(Error::InvalidArgument("plane index out of range"));
        }

        let len = self.planes[plane].length as usize;
        let ptr = self.buffer.plane_mapping(plane)?;
        Ok(unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), len) })
    }
}

impl Drop for BufferRefBase {
    fn drop(&mut self) {
        if !self.queued {
            self.free_list.return_buffer(self.index);
        }
    }
}

/// A buffer owned by the application and not yet handed to the kernel.
///
/// Move-only: queueing consumes the ref, and dropping it without queueing
/// returns the index to the queue's free list exactly once.
pub struct WritableBufferRef {
    pub(crate) base: BufferRefBase,
}

impl WritableBufferRef {
    pub(crate) fn new(base: BufferRefBase) -> WritableBufferRef {
        WritableBufferRef { base }
    }

    pub fn index(&self) -> u32 {
        self.base.index
    }

    pub fn planes_count(&self) -> usize {
        self.base.planes_count
    }

    pub fn memory(&self) -> Memory {
        self.base.memory
    }

    /// The capacity of plane `plane` in bytes.
    pub fn buffer_size(&self, plane: usize) -> usize {
        if plane >= self.base.planes_count {
            return 0;
        }
        self.base.planes[plane].length as usize
    }

    pub fn set_buffer_size(&mut self, plane: usize, length: usize) {
        if plane < self.base.planes_count {
            self.base.planes[plane].length = length as u32;
        }
    }

    pub fn bytes_used(&self, plane: usize) -> usize {
        if plane >= self.base.planes_count {
            return 0;
        }
        self.base.planes[plane].bytesused as usize
    }

    /// Records how many bytes of plane `plane` carry payload. Values beyond
    /// the plane capacity are ignored.
    pub fn set_bytes_used(&mut self, plane: usize, bytes_used: usize) {
        if bytes_used > self.buffer_size(plane) {
            log::debug!(
                "bytes used {} larger than plane size {}",
                bytes_used,
                self.buffer_size(plane)
            );
            return;
        }

        if plane < self.base.planes_count {
            self.base.planes[plane].bytesused = bytes_used as u32;
        }
    }

    pub fn timestamp(&self) -> timeval {
        self.base.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: timeval) {
        self.base.timestamp = timestamp;
    }

    pub fn buffer_id(&self) -> i32 {
        self.base.buffer_id
    }

    pub fn set_buffer_id(&mut self, buffer_id: i32) {
        self.base.buffer_id = buffer_id;
    }

    pub fn set_flags(&mut self, flags: BufFlag) {
        self.base.flags = flags;
    }

    /// The presentation timestamp associated with the buffer's payload.
    pub fn buffer_pts(&self) -> i64 {
        self.base.buffer.pts()
    }

    pub fn set_buffer_pts(&self, pts: i64) {
        self.base.buffer.set_pts(pts);
    }

    /// Write access to the mmap'ed memory of plane `plane`.
    pub fn plane_mut(&mut self, plane: usize) -> Result<&mut [u8]> {
        self.base.plane_slice(plane)
    }

    /// The frame layout describing this buffer, with DMABUF fds exported.
    pub fn video_frame(&self) -> Option<Arc<VideoFrame>> {
        self.base.buffer.video_frame()
    }
}

/// A buffer just dequeued from the kernel, holding finished payload.
///
/// Dropping the ref returns the buffer to the queue's free list.
pub struct ReadableBufferRef {
    pub(crate) base: BufferRefBase,
    video_frame: Option<Arc<VideoFrame>>,
}

impl ReadableBufferRef {
    pub(crate) fn new(base: BufferRefBase, video_frame: Option<Arc<VideoFrame>>) -> ReadableBufferRef {
        ReadableBufferRef { base, video_frame }
    }

    pub fn index(&self) -> u32 {
        self.base.index
    }

    pub fn planes_count(&self) -> usize {
        self.base.planes_count
    }

    pub fn bytes_used(&self, plane: usize) -> usize {
        if plane >= self.base.planes_count {
            return 0;
        }
        self.base.planes[plane].bytesused as usize
    }

    pub fn data_offset(&self, plane: usize) -> usize {
        if plane >= self.base.planes_count {
            return 0;
        }
        self.base.planes[plane].data_offset as usize
    }

    pub fn timestamp(&self) -> timeval {
        self.base.timestamp
    }

    pub fn flags(&self) -> BufFlag {
        self.base.flags
    }

    /// Whether the driver marked this as the last buffer of a drained stream.
    pub fn is_last(&self) -> bool {
        self.base.flags.contains(BufFlag::LAST)
    }

    pub fn is_keyframe(&self) -> bool {
        self.base.flags.contains(BufFlag::KEYFRAME)
    }

    /// The presentation timestamp associated with the buffer's payload.
    pub fn buffer_pts(&self) -> i64 {
        self.base.buffer.pts()
    }

    /// Read access to the mmap'ed memory of plane `plane`.
    pub fn plane(&self, plane: usize) -> Result<&[u8]> {
        self.base.plane_slice(plane).map(|s| &*s)
    }

    /// The frame that was attached when the buffer was enqueued, if any.
    pub fn queued_video_frame(&self) -> Option<Arc<VideoFrame>> {
        self.video_frame.clone()
    }

    /// The frame layout describing this buffer, with DMABUF fds exported.
    pub fn video_frame(&self) -> Option<Arc<VideoFrame>> {
        self.base.buffer.video_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_list_hands_out_each_index_once() {
        let list = FreeList::new();
        for i in 0..4 {
            list.return_buffer(i);
        }
        assert_eq!(list.len(), 4);

        let mut handed_out = Vec::new();
        while let Some(index) = list.get_free_buffer() {
            handed_out.push(index);
        }
        handed_out.sort_unstable();
        assert_eq!(handed_out, vec![0, 1, 2, 3]);
        assert_eq!(list.len(), 0);
        assert_eq!(list.get_free_buffer(), None);
    }

    #[test]
    fn free_list_double_return_is_idempotent() {
        let list = FreeList::new();
        list.return_buffer(2);
        list.return_buffer(2);
        assert_eq!(list.len(), 1);
    }
}
