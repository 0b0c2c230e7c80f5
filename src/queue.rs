//! One streaming direction of a memory-to-memory device.

use std::collections::BTreeMap;
use std::ffi::c_void;
use std::sync::Arc;

use nix::errno::Errno;

use crate::buf_type::BufType;
use crate::buffer::{Buffer, BufferRefBase, FreeList, ReadableBufferRef, WritableBufferRef};
use crate::error::{Error, Result};
use crate::frame::VideoFrame;
use crate::geometry::{Rect, Size};
use crate::raw::{self, VIDEO_MAX_PLANES};
use crate::shared::Memory;
use crate::{Device, PixelFormat};

/// Names one side of the memory-to-memory pair in engine-facing APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDirection {
    Input,
    Output,
}

/// Manages the buffers of one V4L2 queue (INPUT or OUTPUT direction).
///
/// Every allocated buffer index is accounted for at all times: it is either
/// on the free list, recorded in the queued map (kernel-owned), or carried by
/// exactly one outstanding [`WritableBufferRef`]/[`ReadableBufferRef`].
pub struct Queue {
    device: Arc<Device>,
    buffer_type: BufType,
    memory: Memory,
    buffers: Vec<Arc<Buffer>>,
    free_list: Arc<FreeList>,
    /// Kernel-owned buffers, with the frame attached at enqueue time.
    queued: BTreeMap<u32, Option<Arc<VideoFrame>>>,
    current_format: Option<raw::PixFormatMplane>,
    planes_count: usize,
    streaming: bool,
}

impl Queue {
    pub fn new(device: Arc<Device>, buffer_type: BufType) -> Queue {
        Queue {
            device,
            buffer_type,
            memory: Memory::MMAP,
            buffers: Vec::new(),
            free_list: Arc::new(FreeList::new()),
            queued: BTreeMap::new(),
            current_format: None,
            planes_count: 0,
            streaming: false,
        }
    }

    pub fn buffer_type(&self) -> BufType {
        self.buffer_type
    }

    /// Reads the currently configured format.
    ///
    /// The raw errno is exposed because `EINVAL` means "no format negotiated
    /// yet" to the decoder's resolution probing.
    pub fn get_format(&self) -> Result<raw::PixFormatMplane, Errno> {
        self.device.g_fmt_mplane(self.buffer_type)
    }

    /// Negotiates the queue format and remembers the adjusted result.
    ///
    /// Returns `None` if the ioctl fails or the driver substitutes a
    /// different fourcc.
    pub fn set_format(
        &mut self,
        fourcc: PixelFormat,
        size: Size,
        buffer_size: usize,
    ) -> Option<raw::PixFormatMplane> {
        let mut pix_mp: raw::PixFormatMplane = unsafe { std::mem::zeroed() };
        pix_mp.pixel_format = fourcc;
        pix_mp.width = size.width;
        pix_mp.height = size.height;
        pix_mp.num_planes = fourcc.num_buffer_planes() as u8;
        pix_mp.plane_fmt[0].sizeimage = buffer_size as u32;

        let mut format: raw::Format = unsafe { std::mem::zeroed() };
        format.type_ = self.buffer_type;
        format.fmt.pix_mp = pix_mp;

        match self.device.s_fmt(&mut format) {
            Ok(()) => {}
            Err(e) => {
                log::debug!("failed to set format {}: {}", fourcc, e);
                return None;
            }
        }

        let pix_mp = unsafe { format.fmt.pix_mp };
        let adjusted_fourcc = pix_mp.pixel_format;
        if adjusted_fourcc != fourcc {
            log::debug!(
                "driver substituted {} for requested format {}",
                adjusted_fourcc,
                fourcc
            );
            return None;
        }

        self.current_format = Some(pix_mp);
        self.current_format
    }

    /// The visible rectangle the driver composes into, from `G_SELECTION`
    /// with a `G_CROP` fallback.
    pub fn visible_rect(&self) -> Option<Rect> {
        let compose_type = self.buffer_type.single_planar_equivalent();
        match self.device.g_selection_compose(compose_type) {
            Ok(rect) => return Some(rect.into()),
            Err(_) => log::debug!("falling back to VIDIOC_G_CROP"),
        }

        self.device.g_crop(self.buffer_type).ok().map(Rect::from)
    }

    /// Starts streaming. Calling this again without an intervening
    /// [`Queue::stream_off`] is a no-op.
    pub fn stream_on(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }

        self.device.streamon(self.buffer_type)?;
        self.streaming = true;
        Ok(())
    }

    /// Stops streaming. The kernel implicitly releases every queued buffer,
    /// so all of them move back to the free list.
    pub fn stream_off(&mut self) -> Result<()> {
        self.device.streamoff(self.buffer_type)?;

        for (&index, _) in &self.queued {
            self.free_list.return_buffer(index);
        }
        self.queued.clear();
        self.streaming = false;
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Allocates `count` buffers, honoring the (possibly smaller) count the
    /// driver grants. Returns the number of buffers actually allocated.
    pub fn allocate_buffers(&mut self, count: usize, memory: Memory) -> Result<usize> {
        if count == 0 {
            return Err(Error::InvalidArgument("attempting to allocate 0 buffers"));
        }

        if self.streaming {
            log::error!("cannot allocate buffers while streaming");
            return Err(Error::IllegalState);
        }

        if !self.buffers.is_empty() {
            log::error!("cannot allocate new buffers while others are still allocated");
            return Err(Error::IllegalState);
        }

        let format = self.get_format().map_err(Error::from)?;
        self.planes_count = usize::from(format.num_planes).min(VIDEO_MAX_PLANES);

        let allocated = self.device.reqbufs(count as u32, self.buffer_type, memory)?;
        log::debug!(
            "queue {:?} got {} buffers (requested {})",
            self.buffer_type,
            allocated,
            count
        );

        self.memory = memory;
        self.free_list = Arc::new(FreeList::new());

        for index in 0..allocated {
            let mut buffer = Buffer::new(
                self.device.clone(),
                self.buffer_type,
                memory,
                format,
                index,
            );
            if let Err(e) = buffer.query() {
                log::error!("VIDIOC_QUERYBUF failed for index {}: {}", index, e);
                self.deallocate_buffers()?;
                return Err(e);
            }

            self.buffers.push(Arc::new(buffer));
            self.free_list.return_buffer(index);
        }

        Ok(self.buffers.len())
    }

    /// Releases all buffers. Fails while the queue is streaming.
    pub fn deallocate_buffers(&mut self) -> Result<()> {
        if self.streaming {
            log::debug!("cannot deallocate buffers while streaming");
            return Err(Error::IllegalState);
        }

        if self.buffers.is_empty() {
            return Ok(());
        }

        // Unmaps happen in each buffer's drop. Refs still in flight keep
        // their `Arc<Buffer>` alive but return their index to the stale free
        // list, never to this queue.
        self.buffers.clear();
        self.queued.clear();
        self.free_list = Arc::new(FreeList::new());

        self.device.reqbufs(0, self.buffer_type, self.memory)?;
        Ok(())
    }

    pub fn allocated_buffers_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn free_buffers_count(&self) -> usize {
        self.free_list.len()
    }

    pub fn queued_buffers_count(&self) -> usize {
        self.queued.len()
    }

    /// Pops a free buffer and hands it to the caller as a writable ref.
    pub fn get_free_buffer(&mut self) -> Option<WritableBufferRef> {
        let index = self.free_list.get_free_buffer()?;
        let buffer = self.buffers[index as usize].clone();
        let base = BufferRefBase::new(
            buffer,
            self.free_list.clone(),
            crate::shared::BufFlag::empty(),
            nix::libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        );
        Some(WritableBufferRef::new(base))
    }

    /// Queues an MMAP buffer to the kernel, consuming the ref.
    pub fn queue_mmap(
        &mut self,
        buf: WritableBufferRef,
        video_frame: Option<Arc<VideoFrame>>,
    ) -> Result<()> {
        if buf.memory() != Memory::MMAP {
            log::error!("queue_mmap called on a non-MMAP buffer");
            return Err(Error::InvalidArgument("buffer does not use MMAP memory"));
        }

        self.do_queue(buf, video_frame)
    }

    /// Queues a USERPTR buffer with one pointer per plane, consuming the ref.
    pub fn queue_userptr(
        &mut self,
        mut buf: WritableBufferRef,
        ptrs: &[*mut c_void],
        video_frame: Option<Arc<VideoFrame>>,
    ) -> Result<()> {
        if buf.memory() != Memory::USERPTR {
            log::error!("queue_userptr called on a non-USERPTR buffer");
            return Err(Error::InvalidArgument("buffer does not use USERPTR memory"));
        }

        if ptrs.len() != buf.planes_count() {
            log::error!(
                "provided {} pointers while the buffer has {} planes",
                ptrs.len(),
                buf.planes_count()
            );
            return Err(Error::InvalidArgument("plane pointer count mismatch"));
        }

        for (plane, &ptr) in ptrs.iter().enumerate() {
            buf.base.planes[plane].m = raw::PlaneMemoryUnion {
                userptr: ptr as nix::libc::c_ulong,
            };
        }

        self.do_queue(buf, video_frame)
    }

    fn do_queue(
        &mut self,
        mut buf: WritableBufferRef,
        video_frame: Option<Arc<VideoFrame>>,
    ) -> Result<()> {
        let mut planes = buf.base.planes;
        let mut v4l2_buffer: raw::Buffer = unsafe { std::mem::zeroed() };
        v4l2_buffer.index = buf.base.index;
        v4l2_buffer.type_ = self.buffer_type;
        v4l2_buffer.memory = buf.base.memory;
        v4l2_buffer.flags = buf.base.flags;
        v4l2_buffer.timestamp = buf.base.timestamp;
        v4l2_buffer.length = buf.base.planes_count as u32;
        v4l2_buffer.m.planes = planes.as_mut_ptr();

        match self.device.qbuf(&mut v4l2_buffer) {
            Ok(()) => {
                // The kernel owns the buffer now; disarm the ref's drop path.
                buf.base.queued = true;
                self.queued.insert(buf.base.index, video_frame);
                Ok(())
            }
            Err(errno) => {
                // The ref drops here and returns the index to the free list.
                log::error!("VIDIOC_QBUF failed: {}", errno);
                Err(errno.into())
            }
        }
    }

    /// Dequeues one finished buffer.
    ///
    /// `Ok(None)` means there is nothing to dequeue right now (not streaming,
    /// nothing queued, or the driver answered `EAGAIN`/`EPIPE`); any other
    /// ioctl failure is an error.
    pub fn dequeue_buffer(&mut self) -> Result<Option<ReadableBufferRef>> {
        if self.queued.is_empty() {
            log::debug!("no buffers queued yet");
            return Ok(None);
        }

        if !self.streaming {
            log::debug!("attempting to dequeue a buffer while not streaming");
            return Ok(None);
        }

        let mut planes: [raw::Plane; VIDEO_MAX_PLANES] =
            [unsafe { std::mem::zeroed() }; VIDEO_MAX_PLANES];
        let mut v4l2_buffer: raw::Buffer = unsafe { std::mem::zeroed() };
        v4l2_buffer.type_ = self.buffer_type;
        v4l2_buffer.memory = self.memory;
        v4l2_buffer.length = self.planes_count as u32;
        v4l2_buffer.m.planes = planes.as_mut_ptr();

        match self.device.dqbuf(&mut v4l2_buffer) {
            Ok(()) => {}
            Err(Errno::EAGAIN) | Err(Errno::EPIPE) => return Ok(None),
            Err(errno) => {
                log::debug!(
                    "{} VIDIOC_DQBUF failed: {}",
                    if self.buffer_type.is_output() { "input" } else { "output" },
                    errno
                );
                return Err(errno.into());
            }
        }

        let index = v4l2_buffer.index;
        let video_frame = match self.queued.remove(&index) {
            Some(frame) => frame,
            None => {
                log::error!("dequeued buffer {} was not in the queued map", index);
                return Err(Error::Platform(std::io::Error::from_raw_os_error(
                    nix::libc::EINVAL,
                )));
            }
        };

        let buffer = self.buffers[index as usize].clone();
        let mut base = BufferRefBase::new(
            buffer,
            self.free_list.clone(),
            v4l2_buffer.flags,
            v4l2_buffer.timestamp,
        );
        base.planes[..self.planes_count].copy_from_slice(&planes[..self.planes_count]);

        Ok(Some(ReadableBufferRef::new(base, video_frame)))
    }
}
