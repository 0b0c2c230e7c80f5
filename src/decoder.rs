//! Stateful V4L2 memory-to-memory decode engine.
//!
//! The engine runs cooperatively on its caller's thread. Compressed chunks
//! accumulate into INPUT buffers, get queued to the driver, and finished
//! OUTPUT buffers travel to the client as [`ReadableBufferRef`]s. A single
//! background [`PollThread`] blocks in `poll()` and asks the client to
//! schedule the next pump iteration whenever the device (or the interrupt
//! eventfd) wakes it.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::libc::timeval;

use crate::buffer::{ReadableBufferRef, WritableBufferRef};
use crate::error::{Error, Result};
use crate::geometry::{Rect, Size};
use crate::pixel_format::VideoPixelFormat;
use crate::poll_thread::PollThread;
use crate::queue::{Queue, QueueDirection};
use crate::raw;
use crate::raw::controls::Cid;
use crate::shared::{CapabilityFlags, DecCmd, EventType, Memory, EVENT_SRC_CH_RESOLUTION};
use crate::{BufType, Device, DeviceType, PixelFormat, SupportedProfile};

/// Buffer id marking "no data, process the pending flush".
pub const FLUSH_BUFFER_ID: i32 = -2;

/// Number of INPUT (bitstream) buffers allocated up front.
const INPUT_BUFFER_COUNT: usize = 8;
/// INPUT plane size for devices capped at 1080p.
const INPUT_BUFFER_MAX_SIZE_1080P: usize = 1024 * 1024;
/// INPUT plane size for 4K-capable devices.
const INPUT_BUFFER_MAX_SIZE_4K: usize = 4 * 1024 * 1024;
/// Extra OUTPUT buffers requested beyond the stream's DPB size.
const DPB_OUTPUT_BUFFER_EXTRA_COUNT: u32 = 5;

/// Fatal decoder errors, as reported to [`DecoderClient::notify_decoder_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderError {
    IllegalState,
    InvalidArgument,
    UnreadableInput,
    PlatformFailure,
}

impl DecoderError {
    fn from_error(error: &Error) -> DecoderError {
        match error {
            Error::IllegalState => DecoderError::IllegalState,
            Error::InvalidArgument(_) => DecoderError::InvalidArgument,
            Error::UnreadableInput => DecoderError::UnreadableInput,
            _ => DecoderError::PlatformFailure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DecoderState {
    Uninitialized = 0,
    Initialized,
    Decoding,
    Flushing,
    Resetting,
    ChangingResolution,
    AwaitingPictureBuffers,
    Error,
    Destroying,
}

impl DecoderState {
    fn from_u32(raw: u32) -> DecoderState {
        match raw {
            1 => DecoderState::Initialized,
            2 => DecoderState::Decoding,
            3 => DecoderState::Flushing,
            4 => DecoderState::Resetting,
            5 => DecoderState::ChangingResolution,
            6 => DecoderState::AwaitingPictureBuffers,
            7 => DecoderState::Error,
            8 => DecoderState::Destroying,
            _ => DecoderState::Uninitialized,
        }
    }
}

/// Who allocates the output picture backing memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// The engine allocates MMAP buffers and exports DMABUFs.
    Allocate,
    /// The client imports its own buffers.
    Import,
}

#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub frame_width: u32,
    pub frame_height: u32,
    pub profile: crate::VideoCodecProfile,
    pub output_mode: OutputMode,
}

/// What the engine learned during initialization, for the client's benefit.
#[derive(Debug, Clone)]
pub struct DecoderClientConfig {
    pub output_pixel_format: VideoPixelFormat,
    /// The engine feeds and recycles buffers itself; the client never has to
    /// pace it.
    pub should_control_buffer_feed: bool,
}

/// Whether a compressed chunk was taken or the caller should retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Accepted,
    /// All input buffers are in flight; retry after the next pump.
    Stalled,
}

/// Outcome of [`VideoDecoder::reset_decoding_buffers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetStatus {
    Completed,
    /// A source-change event was pending; the engine started the resolution
    /// change instead, and the caller retries once it completes.
    ResolutionChangePending,
}

/// Callbacks through which the engine reports to its integrating layer.
pub trait DecoderClient: Send + Sync {
    /// Ask the client to provide `count` picture buffers. A
    /// `pixel_format` of [`VideoPixelFormat::Unknown`] means the engine
    /// allocates the backing memory itself.
    fn create_output_buffers(
        &self,
        pixel_format: VideoPixelFormat,
        count: u32,
        texture_target: u32,
    ) -> bool;

    /// Ask the client to drop all references to its picture buffers.
    /// Returning `false` skips the device-side deallocation.
    fn destroy_output_buffers(&self) -> bool;

    fn schedule_decode_buffer_task_if_needed(&self);

    fn start_resolution_change(&self);

    fn notify_flush_done(&self);

    fn notify_flush_done_if_needed(&self);

    fn notify_reset_done(&self);

    fn is_destroy_pending(&self) -> bool;

    fn on_start_device_poll(&self) {}

    fn on_stop_device_poll(&self) {}

    fn create_buffers_for_format(&self, coded_size: Size, visible_size: Size);

    /// Delivers one decoded picture. Dropping the ref recycles the buffer.
    fn send_buffer_to_client(&self, index: u32, buffer_id: i32, buffer: ReadableBufferRef);

    fn check_gl_fences(&self) {}

    fn notify_decoder_error(&self, error: DecoderError);

    /// Posted from the poll thread: run
    /// [`VideoDecoder::run_decode_buffer_task`] on the engine thread.
    fn notify_decode_buffer_task(&self, event_pending: bool, has_output: bool);

    fn notify_decode_buffer_done(&self) {}
}

/// The V4L2 decode engine.
pub struct VideoDecoder {
    client: Option<Arc<dyn DecoderClient>>,
    device: Option<Arc<Device>>,
    input_queue: Option<Queue>,
    output_queue: Option<Queue>,
    poll_thread: PollThread,
    state: AtomicU32,

    output_mode: OutputMode,
    input_format: PixelFormat,
    output_format: Option<PixelFormat>,
    egl_image_format: Option<PixelFormat>,
    input_buffer_size: usize,

    coded_size: Size,
    visible_size: Size,
    output_dpb_size: u32,

    current_input_buffer: Option<WritableBufferRef>,
    input_ready_queue: VecDeque<WritableBufferRef>,

    decoder_cmd_supported: bool,
    flush_awaiting_last_output_buffer: bool,

    port_index: i32,
    start_time: Option<Instant>,
    frames_per_sec: u32,
    current_secs: u32,
}

impl Default for VideoDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoDecoder {
    pub fn new() -> VideoDecoder {
        VideoDecoder {
            client: None,
            device: None,
            input_queue: None,
            output_queue: None,
            poll_thread: PollThread::new("v4l2-decoder-poll"),
            state: AtomicU32::new(DecoderState::Uninitialized as u32),
            output_mode: OutputMode::Allocate,
            input_format: PixelFormat::NONE,
            output_format: None,
            egl_image_format: None,
            input_buffer_size: INPUT_BUFFER_MAX_SIZE_1080P,
            coded_size: Size::default(),
            visible_size: Size::default(),
            output_dpb_size: 0,
            current_input_buffer: None,
            input_ready_queue: VecDeque::new(),
            decoder_cmd_supported: false,
            flush_awaiting_last_output_buffer: false,
            port_index: -1,
            start_time: None,
            frames_per_sec: 0,
            current_secs: 0,
        }
    }

    /// Every decodable profile across the platform's decoder nodes.
    pub fn supported_profiles() -> Vec<SupportedProfile> {
        Device::supported_decode_profiles()
    }

    /// Opens the device, negotiates formats, allocates input buffers, and
    /// starts the poll thread.
    pub fn initialize(
        &mut self,
        config: &DecoderConfig,
        client: Arc<dyn DecoderClient>,
        vdec_port_index: i32,
    ) -> Result<DecoderClientConfig> {
        log::debug!("resource index received: {}", vdec_port_index);
        self.client = Some(client);

        if vdec_port_index < 0 {
            log::error!("resource not acquired: {}", vdec_port_index);
            return Err(Error::InvalidArgument("negative decoder port index"));
        }
        self.port_index = vdec_port_index;

        self.check_config(config)?;
        self.subscribe_events()?;

        if let Err(e) = self.allocate_input_buffers() {
            self.notify_error(&e);
            return Err(e);
        }

        self.decoder_cmd_supported = self.is_decoder_cmd_supported();

        let client_config = DecoderClientConfig {
            output_pixel_format: self
                .egl_image_format
                .map(PixelFormat::to_video_pixel_format)
                .unwrap_or(VideoPixelFormat::Unknown),
            // Feed and release based control is not possible here because the
            // decode and capture sides live on the same device.
            should_control_buffer_feed: false,
        };

        self.start_device_poll()?;
        Ok(client_config)
    }

    /// Best-effort teardown; never fails.
    pub fn destroy(&mut self) {
        if let Err(e) = self.stop_device_poll() {
            log::error!("stopping device poll during destroy: {}", e);
        }
        if let Err(e) = self.stop_output_stream() {
            log::error!("stopping output stream during destroy: {}", e);
        }
        if let Err(e) = self.stop_input_stream() {
            log::error!("stopping input stream during destroy: {}", e);
        }

        self.current_input_buffer = None;

        self.destroy_input_buffers();
        self.destroy_output_buffers();

        self.input_queue = None;
        self.output_queue = None;
        self.device = None;
        self.start_time = None;
    }

    pub fn state(&self) -> DecoderState {
        DecoderState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Records the externally driven engine state.
    ///
    /// Valid even while no device is open: the state is cached and simply
    /// read back by the next initialization.
    pub fn set_state(&self, state: DecoderState) {
        let old = self.state();
        if old != state {
            log::debug!("decoder state [{:?} -> {:?}]", old, state);
            self.state.store(state as u32, Ordering::Release);
        }
    }

    /// Drops the partially filled input buffer, if any.
    pub fn reset_input_buffer(&mut self) {
        self.current_input_buffer = None;
    }

    /// Quiesces the device queues for a reset.
    pub fn reset_decoding_buffers(&mut self) -> Result<ResetStatus> {
        self.stop_device_poll()?;
        self.stop_output_stream()?;

        if self.dequeue_resolution_change_event() {
            self.start_resolution_change();
            return Ok(ResetStatus::ResolutionChangePending);
        }

        self.stop_input_stream()?;
        Ok(ResetStatus::Completed)
    }

    /// Ensures the poll thread is running again after a reset.
    pub fn can_notify_reset_done(&mut self) -> bool {
        if self.poll_thread.is_running() {
            return true;
        }

        self.start_device_poll().is_ok()
    }

    /// Copies a compressed chunk into the current input buffer.
    ///
    /// A `size == 0` call only binds `buffer_id` to the buffer (the flush
    /// sentinel uses this). Returns [`FeedStatus::Stalled`] when every input
    /// buffer is in flight.
    pub fn decode_buffer(
        &mut self,
        data: &[u8],
        buffer_id: i32,
        buffer_pts: i64,
    ) -> Result<FeedStatus> {
        log::debug!(
            "size [{}], id [{}], pts [{}]",
            data.len(),
            buffer_id,
            buffer_pts
        );

        // Flush the current buffer first if this chunk would overflow it.
        let needs_flush = self.current_input_buffer.as_ref().map_or(false, |current| {
            current.bytes_used(0) + data.len() > current.buffer_size(0)
        });
        if needs_flush {
            self.flush_input_buffers()?;
        }

        if self.current_input_buffer.is_none() {
            if self
                .input_queue
                .as_ref()
                .map_or(0, Queue::free_buffers_count)
                == 0
            {
                self.dequeue_buffers();
            }

            let buffer = self.input_queue.as_mut().and_then(Queue::get_free_buffer);
            match buffer {
                Some(mut buffer) => {
                    buffer.set_timestamp(timeval {
                        tv_sec: buffer_id as _,
                        tv_usec: 0,
                    });
                    buffer.set_buffer_id(buffer_id);
                    buffer.set_buffer_pts(buffer_pts);
                    self.current_input_buffer = Some(buffer);
                }
                None => {
                    log::debug!("stalled for input buffers");
                    return Ok(FeedStatus::Stalled);
                }
            }
        }

        if data.is_empty() {
            log::debug!("buffer size is zero, buffer_id={}", buffer_id);
            return Ok(FeedStatus::Accepted);
        }

        let current = match self.current_input_buffer.as_mut() {
            Some(current) => current,
            None => return Err(Error::IllegalState),
        };

        let plane_size = current.buffer_size(0);
        let bytes_used = current.bytes_used(0);
        if data.len() > plane_size - bytes_used {
            log::error!("over-size frame, erroring");
            let error = Error::UnreadableInput;
            self.notify_error(&error);
            return Err(error);
        }

        let plane = current.plane_mut(0)?;
        plane[bytes_used..bytes_used + data.len()].copy_from_slice(data);
        current.set_bytes_used(0, bytes_used + data.len());

        Ok(FeedStatus::Accepted)
    }

    /// Moves the current input buffer onto the ready queue and pumps.
    ///
    /// An id-bound buffer without payload is silently recycled; only the
    /// flush sentinel travels empty.
    pub fn flush_input_buffers(&mut self) -> Result<()> {
        let current = match self.current_input_buffer.take() {
            Some(current) => current,
            None => {
                log::debug!("no current input buffer");
                return Ok(());
            }
        };

        let input_id = current.buffer_id();
        if input_id >= 0 && current.bytes_used(0) == 0 {
            // Dropping the ref returns the buffer to the free list.
            return Ok(());
        }

        log::debug!("queuing buffer input_id={}", input_id);
        self.input_ready_queue.push_back(current);

        self.enqueue_buffers();

        if self.state() == DecoderState::Error {
            return Err(Error::IllegalState);
        }
        Ok(())
    }

    /// Whether a requested flush has fully drained. Restarts the streams
    /// once it has.
    pub fn did_flush_buffers_done(&mut self) -> Result<bool> {
        if self.current_input_buffer.is_some() {
            log::debug!("current input buffer still in use");
            return Ok(false);
        }

        if self.input_ready_queue.len() + self.input_queued_count() != 0 {
            log::debug!("some input buffers are not dequeued");
            return Ok(false);
        }

        if self.flush_awaiting_last_output_buffer {
            log::debug!("waiting for last output buffer");
            return Ok(false);
        }

        self.stop_device_poll()?;
        self.stop_output_stream()?;
        self.stop_input_stream()?;

        self.start_device_poll()?;
        Ok(true)
    }

    /// One pump iteration, scheduled by the client after
    /// [`DecoderClient::notify_decode_buffer_task`].
    pub fn run_decode_buffer_task(&mut self, event_pending: bool) {
        log::debug!("event_pending [{}]", event_pending);

        let mut resolution_change_pending = false;
        if event_pending {
            resolution_change_pending = self.dequeue_resolution_change_event();
        }

        // At stream start there is no event yet; a successful G_FMT while we
        // have no coded size plays the same role.
        if !resolution_change_pending && self.coded_size.is_empty() {
            if let Ok(Some(_)) = self.format_info() {
                resolution_change_pending = true;
                self.dequeue_resolution_change_event();
            }
        }

        self.dequeue_buffers();
        self.enqueue_buffers();

        if let Some(device) = self.device.clone() {
            if let Err(e) = device.clear_device_poll_interrupt() {
                log::error!("failed to clear the interrupt fd: {}", e);
                self.notify_error(&e);
                return;
            }
        }

        let poll_device = self.input_queued_count() + self.output_queued_count() > 0;
        self.schedule_device_poll_task(poll_device);

        if let Some(client) = self.client.clone() {
            client.schedule_decode_buffer_task_if_needed();
        }
        if resolution_change_pending {
            self.start_resolution_change();
        }
    }

    /// The broker-assigned decoder slot this engine occupies.
    pub fn port_index(&self) -> i32 {
        self.port_index
    }

    /// The buffer id bound to the partially filled input buffer, if any.
    pub fn current_input_buffer_id(&self) -> Option<i32> {
        self.current_input_buffer
            .as_ref()
            .map(WritableBufferRef::buffer_id)
    }

    pub fn free_buffers_count(&self, direction: QueueDirection) -> usize {
        let queue = match direction {
            QueueDirection::Input => &self.input_queue,
            QueueDirection::Output => &self.output_queue,
        };
        queue.as_ref().map_or(0, Queue::free_buffers_count)
    }

    /// Allocates the OUTPUT queue and hands out one writable ref per buffer
    /// for the client to bind. Dropping a ref puts the buffer up for
    /// queueing by the next pump.
    pub fn allocate_output_buffers(&mut self, buffer_count: u32) -> Result<Vec<WritableBufferRef>> {
        let required = self.output_dpb_size + DPB_OUTPUT_BUFFER_EXTRA_COUNT;
        log::debug!(
            "request output buffers (got: {}, requested: {})",
            buffer_count,
            required
        );
        if buffer_count < required {
            log::error!(
                "failed to provide requested output buffers (got: {}, requested: {})",
                buffer_count,
                required
            );
            let error = Error::InvalidArgument("too few output buffers provided");
            self.notify_error(&error);
            return Err(error);
        }

        let allocated = {
            let output_queue = match self.output_queue.as_mut() {
                Some(queue) => queue,
                None => return Err(Error::IllegalState),
            };
            match output_queue.allocate_buffers(buffer_count as usize, Memory::MMAP) {
                Ok(allocated) => allocated,
                Err(e) => {
                    log::error!("failed to request buffers");
                    self.notify_error(&e);
                    return Err(e);
                }
            }
        };

        if allocated != buffer_count as usize {
            log::error!(
                "could not allocate output buffers, requested [{}], allocated [{}]",
                buffer_count,
                allocated
            );
            let error = Error::Platform(io::Error::new(
                io::ErrorKind::Other,
                "short output buffer allocation",
            ));
            self.notify_error(&error);
            return Err(error);
        }

        let mut buffers = Vec::with_capacity(allocated);
        while let Some(buffer) = self
            .output_queue
            .as_mut()
            .and_then(Queue::get_free_buffer)
        {
            buffers.push(buffer);
        }

        log::debug!("allocated [{}]", buffers.len());
        Ok(buffers)
    }

    /// Whether pictures in `pixel_format` can back an EGL image on this
    /// device.
    pub fn can_create_egl_image_from(&self, pixel_format: VideoPixelFormat) -> bool {
        let device = match &self.device {
            Some(device) => device,
            None => return false,
        };

        match PixelFormat::from_video_pixel_format(pixel_format, true) {
            Some(fourcc) => device.can_create_egl_image_from(fourcc),
            None => false,
        }
    }

    /// Notification that the client is done displaying a picture.
    pub fn reuse_picture_buffer(&self, picture_buffer_id: i32) {
        log::debug!("picture_buffer_id: {}", picture_buffer_id);
    }

    /// Called when the platform's resource broker revokes the codec slot:
    /// quiesce and surface an error so the client tears the session down.
    pub fn release_resources(&mut self) {
        if let Err(e) = self.stop_device_poll() {
            log::error!("stopping device poll on resource release: {}", e);
        }

        let error = Error::Platform(io::Error::new(
            io::ErrorKind::Other,
            "codec hardware resources revoked",
        ));
        self.notify_error(&error);
    }

    // === Initialization helpers ===

    fn check_config(&mut self, config: &DecoderConfig) -> Result<()> {
        log::debug!("profile [{:?}]", config.profile);

        self.output_mode = config.output_mode;
        self.input_format = config.profile.to_v4l2_pix_fmt();

        let device = Arc::new(Device::open(DeviceType::Decoder, self.input_format)?);

        let caps = device.capabilities()?;
        let required = CapabilityFlags::VIDEO_M2M_MPLANE | CapabilityFlags::STREAMING;
        if !caps.all_capabilities().contains(required) {
            log::error!(
                "capability check failed: {:?}",
                caps.all_capabilities()
            );
            return Err(Error::Platform(io::Error::new(
                io::ErrorKind::Other,
                "device is not a streaming mem2mem decoder",
            )));
        }

        self.input_queue = Some(Queue::new(device.clone(), BufType::VIDEO_OUTPUT_MPLANE));
        self.output_queue = Some(Queue::new(device.clone(), BufType::VIDEO_CAPTURE_MPLANE));
        self.device = Some(device);

        self.setup_formats()
    }

    fn setup_formats(&mut self) -> Result<()> {
        let device = match self.device.clone() {
            Some(device) => device,
            None => return Err(Error::IllegalState),
        };

        let (_, max_resolution) = device.supported_resolution(self.input_format);
        self.input_buffer_size = if max_resolution.width > 1920 && max_resolution.height > 1088 {
            INPUT_BUFFER_MAX_SIZE_4K
        } else {
            INPUT_BUFFER_MAX_SIZE_1080P
        };

        let input_formats = device.supported_pixel_formats(BufType::VIDEO_OUTPUT_MPLANE);
        if !input_formats.contains(&self.input_format) {
            log::error!("input fourcc {} not supported by device", self.input_format);
            return Err(Error::NoDevice(self.input_format));
        }

        let input_size = self.input_buffer_size;
        let input_set = self
            .input_queue
            .as_mut()
            .and_then(|q| q.set_format(self.input_format, Size::default(), input_size));
        if input_set.is_none() {
            return Err(Error::Platform(io::Error::new(
                io::ErrorKind::Other,
                "failed to set input format",
            )));
        }

        // The output format must be set up front as well; whether the driver
        // can produce our chosen format may depend on the input format, and
        // some drivers refuse to change it once streaming starts.
        let mut output_format = None;
        for desc in device.formats(BufType::VIDEO_CAPTURE_MPLANE) {
            let desc = match desc {
                Ok(desc) => desc,
                Err(_) => break,
            };
            let fourcc = PixelFormat::from_v4l2_pix_fmt(desc.pixel_format().as_u32());
            if fourcc != PixelFormat::NONE && device.can_create_egl_image_from(fourcc) {
                output_format = Some(fourcc);
                break;
            }
        }

        let output_format = match output_format {
            Some(format) => format,
            None => {
                log::error!("no output fourcc supported by device");
                return Err(Error::Platform(io::Error::new(
                    io::ErrorKind::Other,
                    "no EGL-compatible output format",
                )));
            }
        };

        let output_set = self
            .output_queue
            .as_mut()
            .and_then(|q| q.set_format(output_format, Size::default(), 0));
        if output_set.is_none() {
            return Err(Error::Platform(io::Error::new(
                io::ErrorKind::Other,
                "failed to set output format",
            )));
        }

        self.output_format = Some(output_format);
        self.egl_image_format = Some(output_format);
        log::debug!("success format [{}]", output_format);
        Ok(())
    }

    fn subscribe_events(&self) -> Result<()> {
        match &self.device {
            Some(device) => device.subscribe_source_change_event(),
            None => Err(Error::IllegalState),
        }
    }

    fn allocate_input_buffers(&mut self) -> Result<()> {
        let input_queue = match self.input_queue.as_mut() {
            Some(queue) => queue,
            None => return Err(Error::IllegalState),
        };

        let allocated = input_queue.allocate_buffers(INPUT_BUFFER_COUNT, Memory::MMAP)?;
        log::debug!("allocated [{}]", allocated);
        Ok(())
    }

    fn is_decoder_cmd_supported(&self) -> bool {
        let supported = self
            .device
            .as_ref()
            .map_or(false, |d| d.try_decoder_cmd(DecCmd::STOP).is_ok());
        if !supported {
            log::debug!("V4L2_DEC_CMD_STOP is not supported");
        }
        supported
    }

    // === Pump ===

    fn input_queued_count(&self) -> usize {
        self.input_queue
            .as_ref()
            .map_or(0, Queue::queued_buffers_count)
    }

    fn output_queued_count(&self) -> usize {
        self.output_queue
            .as_ref()
            .map_or(0, Queue::queued_buffers_count)
    }

    fn input_streaming(&self) -> bool {
        self.input_queue.as_ref().map_or(false, Queue::is_streaming)
    }

    fn enqueue_buffers(&mut self) {
        let client = match self.client.clone() {
            Some(client) => client,
            None => return,
        };

        if client.is_destroy_pending() || self.state() == DecoderState::ChangingResolution {
            log::debug!("state [{:?}]", self.state());
            return;
        }

        let old_inputs_queued = self.input_queued_count();
        loop {
            let front_id = match self.input_ready_queue.front() {
                Some(buffer) => buffer.buffer_id(),
                None => break,
            };

            let mut flush_handled = false;
            if front_id == FLUSH_BUFFER_ID {
                // Let the driver drain everything already queued first.
                if self.input_queued_count() > 0 {
                    break;
                }

                if self.coded_size.is_empty() || !self.input_streaming() {
                    log::debug!("nothing to flush, notifying flush done directly");
                    client.notify_flush_done();
                    flush_handled = true;
                } else if self.decoder_cmd_supported {
                    if !self.send_decoder_cmd_stop() {
                        return;
                    }
                    flush_handled = true;
                }
            }

            if flush_handled {
                self.input_ready_queue.pop_front();
            } else {
                let buffer = match self.input_ready_queue.pop_front() {
                    Some(buffer) => buffer,
                    None => break,
                };
                if !self.enqueue_input_buffer(buffer) {
                    return;
                }
            }
        }

        if old_inputs_queued == 0 && self.input_queued_count() != 0 {
            if !self.interrupt_device_poll() {
                return;
            }

            let result = self.input_queue.as_mut().map(Queue::stream_on);
            if let Some(Err(e)) = result {
                log::error!("failed to stream on input queue");
                self.notify_error(&e);
                return;
            }
        }

        if !self.input_streaming() {
            return;
        }

        let old_outputs_queued = self.output_queued_count();
        client.check_gl_fences();
        while let Some(buffer) = self.output_queue.as_mut().and_then(Queue::get_free_buffer) {
            if !self.enqueue_output_buffer(buffer) {
                return;
            }
        }

        if old_outputs_queued == 0 && self.output_queued_count() != 0 {
            if !self.interrupt_device_poll() {
                return;
            }

            let result = self.output_queue.as_mut().map(Queue::stream_on);
            if let Some(Err(e)) = result {
                log::error!("failed to stream on output queue");
                self.notify_error(&e);
                return;
            }
        }
    }

    fn interrupt_device_poll(&mut self) -> bool {
        let result = self
            .device
            .as_ref()
            .map(|d| d.set_device_poll_interrupt())
            .unwrap_or(Err(Error::IllegalState));
        if let Err(e) = result {
            log::error!("set_device_poll_interrupt failed");
            self.notify_error(&e);
            return false;
        }
        true
    }

    fn dequeue_buffers(&mut self) {
        while self.input_queued_count() > 0 {
            if !self.dequeue_input_buffer() {
                break;
            }
        }

        while self.output_queued_count() > 0 {
            if !self.dequeue_output_buffer() {
                break;
            }
        }

        if let Some(client) = self.client.clone() {
            client.notify_flush_done_if_needed();
        }
    }

    fn enqueue_input_buffer(&mut self, buffer: WritableBufferRef) -> bool {
        let buffer_index = buffer.index();
        let buffer_id = buffer.buffer_id();
        let bytes_used = buffer.bytes_used(0);

        if !self.queue_to_device(buffer, QueueDirection::Input) {
            log::error!("error enqueuing input buffer");
            self.notify_error(&Error::Platform(io::Error::new(
                io::ErrorKind::Other,
                "failed to queue input buffer",
            )));
            return false;
        }

        log::debug!(
            "buffer index [{}], id [{}], size [{}]",
            buffer_index,
            buffer_id,
            bytes_used
        );
        true
    }

    fn enqueue_output_buffer(&mut self, buffer: WritableBufferRef) -> bool {
        let buffer_index = buffer.index();

        if !self.queue_to_device(buffer, QueueDirection::Output) {
            log::error!("error enqueuing output buffer");
            self.notify_error(&Error::Platform(io::Error::new(
                io::ErrorKind::Other,
                "failed to queue output buffer",
            )));
            return false;
        }

        log::debug!("buffer index [{}]", buffer_index);
        true
    }

    fn queue_to_device(&mut self, buffer: WritableBufferRef, direction: QueueDirection) -> bool {
        let queue = match direction {
            QueueDirection::Input => self.input_queue.as_mut(),
            QueueDirection::Output => self.output_queue.as_mut(),
        };
        let queue = match queue {
            Some(queue) => queue,
            None => return false,
        };

        let result = match buffer.memory() {
            Memory::MMAP => queue.queue_mmap(buffer, None),
            Memory::USERPTR => match buffer.video_frame() {
                Some(frame) => {
                    let ptrs = frame.data[..buffer.planes_count()].to_vec();
                    queue.queue_userptr(buffer, &ptrs, Some(frame))
                }
                None => Err(Error::InvalidArgument("userptr buffer without a frame")),
            },
            _ => Err(Error::InvalidArgument("unsupported buffer memory type")),
        };

        result.is_ok()
    }

    fn dequeue_input_buffer(&mut self) -> bool {
        let result = match self.input_queue.as_mut() {
            Some(queue) => queue.dequeue_buffer(),
            None => return false,
        };

        match result {
            Err(e) => {
                log::error!("error dequeuing input buffer");
                self.notify_error(&e);
                false
            }
            Ok(None) => {
                log::debug!("input dequeue: waiting");
                false
            }
            // Dropping the ref recycles the bitstream buffer.
            Ok(Some(_)) => true,
        }
    }

    fn dequeue_output_buffer(&mut self) -> bool {
        let result = match self.output_queue.as_mut() {
            Some(queue) => queue.dequeue_buffer(),
            None => return false,
        };

        let buffer = match result {
            Err(e) => {
                log::error!("error dequeuing output buffer");
                self.notify_error(&e);
                return false;
            }
            Ok(None) => {
                log::debug!("output dequeue: waiting");
                return false;
            }
            Ok(Some(buffer)) => buffer,
        };

        let is_last = buffer.is_last();
        if buffer.bytes_used(0) > 0 {
            let index = buffer.index();
            let buffer_id = buffer.timestamp().tv_sec as i32;
            log::debug!("sending buffer: index [{}], id [{}]", index, buffer_id);
            if let Some(client) = self.client.clone() {
                client.send_buffer_to_client(index, buffer_id, buffer);
            }
        }

        self.record_output_frame();

        if is_last {
            log::debug!(
                "got last output buffer, awaiting [{}]",
                self.flush_awaiting_last_output_buffer
            );
            if self.flush_awaiting_last_output_buffer && !self.send_decoder_cmd_start() {
                return false;
            }
        }

        true
    }

    fn record_output_frame(&mut self) {
        let now = Instant::now();
        let start = *self.start_time.get_or_insert(now);

        self.frames_per_sec += 1;
        if now.duration_since(start) >= Duration::from_secs(1) {
            self.current_secs += 1;
            log::info!(
                "decoder @ {} secs => {} fps",
                self.current_secs,
                self.frames_per_sec
            );
            self.start_time = Some(now);
            self.frames_per_sec = 0;
        }
    }

    // === Decoder commands ===

    fn send_decoder_cmd_stop(&mut self) -> bool {
        let result = match &self.device {
            Some(device) => device.decoder_cmd(DecCmd::STOP),
            None => Err(Error::IllegalState),
        };

        match result {
            Ok(()) => {
                self.flush_awaiting_last_output_buffer = true;
                true
            }
            Err(e) => {
                self.notify_error(&e);
                false
            }
        }
    }

    fn send_decoder_cmd_start(&mut self) -> bool {
        self.flush_awaiting_last_output_buffer = false;

        let result = match &self.device {
            Some(device) => device.decoder_cmd(DecCmd::START),
            None => Err(Error::IllegalState),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                self.notify_error(&e);
                false
            }
        }
    }

    // === Resolution change ===

    /// Drains pending events; reports whether a resolution change arrived.
    fn dequeue_resolution_change_event(&mut self) -> bool {
        let device = match self.device.clone() {
            Some(device) => device,
            None => return false,
        };

        while let Some(event) = device.dequeue_event() {
            if event.type_ == EventType::SOURCE_CHANGE {
                let changes = unsafe { event.u.src_change.changes };
                if changes & EVENT_SRC_CH_RESOLUTION != 0 {
                    log::debug!("got resolution change event");
                    return true;
                }
            } else {
                log::debug!("got an event ({:?}) we haven't subscribed to", event.type_);
            }
        }

        false
    }

    fn start_resolution_change(&mut self) {
        if self.stop_device_poll().is_err() || self.stop_output_stream().is_err() {
            return;
        }

        if let Some(client) = self.client.clone() {
            client.start_resolution_change();
        }

        if !self.destroy_output_buffers() {
            log::error!("failed destroying output buffers");
            self.notify_error(&Error::Platform(io::Error::new(
                io::ErrorKind::Other,
                "failed destroying output buffers",
            )));
            return;
        }

        self.finish_resolution_change();
    }

    fn finish_resolution_change(&mut self) {
        if self.state() == DecoderState::Error {
            log::debug!("early out: error state");
            return;
        }

        let (format, visible_size) = match self.format_info() {
            Ok(Some(info)) => info,
            _ => {
                log::error!("couldn't get format info after resolution change");
                self.notify_error(&Error::Platform(io::Error::new(
                    io::ErrorKind::Other,
                    "no format info after resolution change",
                )));
                return;
            }
        };

        if !self.create_buffers_for_format(&format, visible_size) {
            log::error!("couldn't reallocate buffers after resolution change");
            self.notify_error(&Error::Platform(io::Error::new(
                io::ErrorKind::Other,
                "picture buffer reallocation failed",
            )));
            return;
        }

        if let Err(e) = self.start_device_poll() {
            log::error!("restarting device poll: {}", e);
        }
    }

    /// Reads the negotiated output format. `Ok(None)` means the driver has
    /// not yet seen enough stream to know it.
    fn format_info(&self) -> Result<Option<(raw::PixFormatMplane, Size)>> {
        let output_queue = match &self.output_queue {
            Some(queue) => queue,
            None => return Err(Error::IllegalState),
        };

        let format = match output_queue.get_format() {
            Ok(format) => format,
            // EINVAL means we haven't seen sufficient stream to decode the format.
            Err(Errno::EINVAL) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let expected = match self.output_format {
            Some(expected) => expected,
            None => return Err(Error::IllegalState),
        };
        let reported = format.pixel_format;
        if reported != expected {
            log::debug!("unexpected format from G_FMT on output");
            return Err(Error::Platform(io::Error::new(
                io::ErrorKind::Other,
                "output format changed behind our back",
            )));
        }

        let coded_size = Size::new(format.width, format.height);
        Ok(Some((format, self.visible_size_for(coded_size))))
    }

    fn visible_size_for(&self, coded_size: Size) -> Size {
        let rect = match self.output_queue.as_ref().and_then(Queue::visible_rect) {
            Some(rect) => rect,
            None => return coded_size,
        };

        if !Rect::from(coded_size).contains(rect) {
            log::debug!("visible rect is not inside coded size");
            return coded_size;
        }

        if rect.is_empty() {
            log::debug!("visible size is empty");
            return coded_size;
        }

        // Clients assume the picture is coded at (0, 0).
        if rect.x != 0 || rect.y != 0 {
            log::debug!("unexpected: visible rect does not start at (0,0)");
            return coded_size;
        }

        rect.size()
    }

    fn create_buffers_for_format(
        &mut self,
        format: &raw::PixFormatMplane,
        visible_size: Size,
    ) -> bool {
        self.coded_size = Size::new(format.width, format.height);
        self.visible_size = visible_size;
        let num_planes = format.num_planes;
        log::debug!(
            "resolution {:?}, visible {:?}, output planes [{}]",
            self.coded_size,
            self.visible_size,
            num_planes
        );

        if let Some(client) = self.client.clone() {
            client.create_buffers_for_format(self.coded_size, self.visible_size);
        }

        self.create_output_buffers()
    }

    fn create_output_buffers(&mut self) -> bool {
        let device = match self.device.clone() {
            Some(device) => device,
            None => return false,
        };

        let dpb_size = match device.read_ctrl(Cid::MIN_BUFFERS_FOR_CAPTURE) {
            Ok(value) => value,
            Err(_) => return false,
        };
        self.output_dpb_size = dpb_size as u32;

        let buffer_count = self.output_dpb_size + DPB_OUTPUT_BUFFER_EXTRA_COUNT;
        log::debug!(
            "buffer_count [{}], coded_size {:?}",
            buffer_count,
            self.coded_size
        );

        let pixel_format = if self.output_mode == OutputMode::Import {
            self.egl_image_format
                .map(PixelFormat::to_video_pixel_format)
                .unwrap_or(VideoPixelFormat::Unknown)
        } else {
            VideoPixelFormat::Unknown
        };

        match self.client.clone() {
            Some(client) => {
                client.create_output_buffers(pixel_format, buffer_count, device.texture_target())
            }
            None => false,
        }
    }

    fn destroy_output_buffers(&mut self) -> bool {
        if self.output_queue.is_none() {
            return true;
        }

        let client_released = match self.client.clone() {
            Some(client) => client.destroy_output_buffers(),
            None => false,
        };
        if !client_released {
            return true;
        }

        let result = self
            .output_queue
            .as_mut()
            .map(Queue::deallocate_buffers)
            .unwrap_or(Ok(()));
        if let Err(e) = result {
            log::error!("failed deallocating output buffers");
            self.notify_error(&e);
            return false;
        }

        true
    }

    fn destroy_input_buffers(&mut self) {
        if let Some(input_queue) = self.input_queue.as_mut() {
            if let Err(e) = input_queue.deallocate_buffers() {
                log::debug!("deallocating input buffers: {}", e);
            }
        }
    }

    // === Streams and polling ===

    fn stop_input_stream(&mut self) -> Result<()> {
        let input_queue = match self.input_queue.as_mut() {
            Some(queue) if queue.is_streaming() => queue,
            _ => return Ok(()),
        };

        if let Err(e) = input_queue.stream_off() {
            log::error!("failed streaming off input queue");
            self.notify_error(&e);
            return Err(e);
        }

        // Reset accounting info for input.
        self.input_ready_queue.clear();
        Ok(())
    }

    fn stop_output_stream(&mut self) -> Result<()> {
        let output_queue = match self.output_queue.as_mut() {
            Some(queue) if queue.is_streaming() => queue,
            _ => return Ok(()),
        };

        if let Err(e) = output_queue.stream_off() {
            log::error!("failed streaming off output queue");
            self.notify_error(&e);
            return Err(e);
        }

        // Output stream is stopped; no need to wait for the LAST buffer.
        self.flush_awaiting_last_output_buffer = false;
        Ok(())
    }

    fn start_device_poll(&mut self) -> Result<()> {
        if self.poll_thread.is_running() {
            return Ok(());
        }

        if let Some(client) = self.client.clone() {
            client.on_start_device_poll();
        }

        self.poll_thread.start();
        self.schedule_device_poll_task(false);
        Ok(())
    }

    fn stop_device_poll(&mut self) -> Result<()> {
        if !self.poll_thread.is_running() {
            return Ok(());
        }

        match &self.device {
            Some(device) => device.set_device_poll_interrupt()?,
            None => return Err(Error::IllegalState),
        }

        self.poll_thread.stop();
        if let Some(client) = self.client.clone() {
            client.on_stop_device_poll();
        }

        match &self.device {
            Some(device) => device.clear_device_poll_interrupt()?,
            None => return Err(Error::IllegalState),
        }

        Ok(())
    }

    fn schedule_device_poll_task(&self, poll_device: bool) {
        let device = match self.device.clone() {
            Some(device) => device,
            None => return,
        };
        let client = match self.client.clone() {
            Some(client) => client,
            None => return,
        };

        self.poll_thread.post(move || {
            // All queue processing happens on the engine thread; this task
            // only sleeps and reports.
            match device.poll(poll_device) {
                Ok(event_pending) => client.notify_decode_buffer_task(event_pending, false),
                Err(e) => {
                    log::error!("failed during poll: {}", e);
                    client.notify_decoder_error(DecoderError::PlatformFailure);
                }
            }
        });
    }

    fn notify_error(&self, error: &Error) {
        log::error!("decoder error: {}", error);
        self.set_state(DecoderState::Error);
        if let Some(client) = &self.client {
            client.notify_decoder_error(DecoderError::from_error(error));
        }
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        let decoder = VideoDecoder::new();
        assert_eq!(decoder.state(), DecoderState::Uninitialized);

        // The state survives without an open device, so a later
        // initialization can pick it up.
        decoder.set_state(DecoderState::Decoding);
        assert_eq!(decoder.state(), DecoderState::Decoding);
        decoder.set_state(DecoderState::Decoding);
        assert_eq!(decoder.state(), DecoderState::Decoding);
        decoder.set_state(DecoderState::Resetting);
        assert_eq!(decoder.state(), DecoderState::Resetting);
    }

    #[test]
    fn error_kind_mapping() {
        assert_eq!(
            DecoderError::from_error(&Error::IllegalState),
            DecoderError::IllegalState
        );
        assert_eq!(
            DecoderError::from_error(&Error::InvalidArgument("x")),
            DecoderError::InvalidArgument
        );
        assert_eq!(
            DecoderError::from_error(&Error::UnreadableInput),
            DecoderError::UnreadableInput
        );
        assert_eq!(
            DecoderError::from_error(&Error::NoDevice(PixelFormat::H264)),
            DecoderError::PlatformFailure
        );
    }

    #[test]
    fn feed_before_initialize_stalls() {
        let mut decoder = VideoDecoder::new();
        // No queues exist yet, so the chunk cannot be accepted; the engine
        // signals a stall rather than an error.
        assert_eq!(
            decoder.decode_buffer(&[0, 0, 0, 1], 1, 0).unwrap(),
            FeedStatus::Stalled
        );
        assert_eq!(decoder.current_input_buffer_id(), None);
    }

    #[test]
    fn flush_sentinel_id() {
        assert_eq!(FLUSH_BUFFER_ID, -2);
    }
}
