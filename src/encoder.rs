//! Stateful V4L2 memory-to-memory encode engine.
//!
//! Raw frames go in through an internal submission queue, encoded bitstream
//! chunks come back as [`ReadableBufferRef`]s. The threading model matches
//! the decoder: all queue work happens on the caller's thread, and one
//! [`PollThread`] blocks in `poll()` between pump iterations.

use std::collections::VecDeque;
use std::io;
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::{ReadableBufferRef, WritableBufferRef};
use crate::codec::h264_level_idc_to_v4l2_level;
use crate::error::{Error, Result};
use crate::frame::{allocation_size, coded_size_from_format, plane_size, VideoFrame};
use crate::geometry::{Rect, Size};
use crate::pixel_format::VideoPixelFormat;
use crate::poll_thread::PollThread;
use crate::queue::{Queue, QueueDirection};
use crate::raw;
use crate::raw::controls::{Cid, EntropyMode, HeaderMode, LoopFilterMode};
use crate::shared::{CapabilityFlags, EncCmd, Memory};
use crate::{
    BufType, Device, DeviceType, PixelFormat, SupportedProfile, VideoCodecProfile,
};

/// Number of raw-frame INPUT buffers, allocated lazily on the first frame.
const INPUT_BUFFER_COUNT: usize = 2;
/// Number of bitstream OUTPUT buffers, allocated during initialization.
const OUTPUT_BUFFER_COUNT: usize = 2;

/// Fatal encoder errors, as reported to [`EncoderClient::notify_encoder_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderError {
    IllegalState,
    InvalidArgument,
    PlatformFailure,
}

impl EncoderError {
    fn from_error(error: &Error) -> EncoderError {
        match error {
            Error::IllegalState => EncoderError::IllegalState,
            Error::InvalidArgument(_) => EncoderError::InvalidArgument,
            _ => EncoderError::PlatformFailure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EncoderState {
    Uninitialized = 0,
    Initialized,
    Encoding,
    Flushing,
    Error,
    Destroying,
}

impl EncoderState {
    fn from_u32(raw: u32) -> EncoderState {
        match raw {
            1 => EncoderState::Initialized,
            2 => EncoderState::Encoding,
            3 => EncoderState::Flushing,
            4 => EncoderState::Error,
            5 => EncoderState::Destroying,
            _ => EncoderState::Uninitialized,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bit_rate: u32,
    pub pixel_format: VideoPixelFormat,
    pub gop_length: u32,
    pub h264_output_level: u8,
    pub output_buffer_size: usize,
    pub profile: VideoCodecProfile,
}

/// What the engine learned during initialization, for the client's benefit.
#[derive(Debug, Clone)]
pub struct EncoderClientConfig {
    /// The coded size the device actually operates on; input frames must be
    /// laid out for this size.
    pub input_frame_size: Size,
    pub should_control_buffer_feed: bool,
    /// The adjusted size of one bitstream output buffer.
    pub output_buffer_byte_size: usize,
    /// Whether the client must prepend SPS/PPS to IDR samples itself.
    pub should_inject_sps_and_pps: bool,
}

/// Callbacks through which the engine reports to its integrating layer.
pub trait EncoderClient: Send + Sync {
    fn create_input_buffers(&self, count: usize);

    fn destroy_input_buffers(&self);

    /// A frame was copied into device buffer `index` and handed to the
    /// driver.
    fn enqueue_input_buffer(&self, index: u32);

    /// Device buffer `index` finished encoding and was recycled.
    fn dequeue_input_buffer(&self, index: u32);

    /// Delivers one encoded chunk. Keyframe flag and timestamp ride on the
    /// ref; dropping it recycles the bitstream buffer.
    fn bitstream_buffer_ready(&self, buffer: ReadableBufferRef);

    /// Called once per pump that delivered at least one chunk.
    fn pump_bitstream_buffers(&self);

    /// The H.264 `level_idc` cap to program, derived from the configuration.
    fn get_h264_level_limit(&self, config: &EncoderConfig) -> u8;

    fn stop_device_poll(&self) {}

    /// Flush progress: `true` once every frame queued before the flush has
    /// been submitted, `false` if the flush failed.
    fn notify_flush_if_needed(&self, flush_done: bool);

    /// Posted from the poll thread: run
    /// [`VideoEncoder::run_encode_buffer_task`] on the engine thread.
    fn notify_encode_buffer_task(&self);

    fn notify_encoder_error(&self, error: EncoderError);

    fn notify_encoder_state(&self, state: EncoderState);
}

/// One pending submission: a frame, or the flush marker (`frame == None`).
#[derive(Clone)]
struct InputFrameInfo {
    frame: Option<Arc<VideoFrame>>,
    force_keyframe: bool,
}

/// The V4L2 encode engine.
pub struct VideoEncoder {
    client: Option<Arc<dyn EncoderClient>>,
    device: Option<Arc<Device>>,
    input_queue: Option<Queue>,
    output_queue: Option<Queue>,
    poll_thread: PollThread,
    state: AtomicU32,

    config: Option<EncoderConfig>,
    output_format: PixelFormat,
    input_memory_type: Memory,
    output_memory_type: Memory,
    input_visible_rect: Rect,
    output_buffer_size: usize,
    input_frame_size: Size,

    /// Layout of the negotiated device-side input format.
    device_input_frame: Option<Arc<VideoFrame>>,

    encoder_input_queue: VecDeque<InputFrameInfo>,
    input_buffers_created: bool,
    flush_supported: bool,
    inject_sps_and_pps: bool,

    current_bitrate: u32,
    current_framerate: u32,

    port_index: i32,
    start_time: Option<Instant>,
    frames_per_sec: u32,
    current_secs: u32,
}

impl Default for VideoEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoder {
    pub fn new() -> VideoEncoder {
        VideoEncoder {
            client: None,
            device: None,
            input_queue: None,
            output_queue: None,
            poll_thread: PollThread::new("v4l2-encoder-poll"),
            state: AtomicU32::new(EncoderState::Uninitialized as u32),
            config: None,
            output_format: PixelFormat::NONE,
            input_memory_type: Memory::MMAP,
            output_memory_type: Memory::MMAP,
            input_visible_rect: Rect::default(),
            output_buffer_size: 0,
            input_frame_size: Size::default(),
            device_input_frame: None,
            encoder_input_queue: VecDeque::new(),
            input_buffers_created: false,
            flush_supported: false,
            inject_sps_and_pps: false,
            current_bitrate: 0,
            current_framerate: 0,
            port_index: -1,
            start_time: None,
            frames_per_sec: 0,
            current_secs: 0,
        }
    }

    /// Every encodable profile across the platform's encoder nodes.
    pub fn supported_profiles() -> Vec<SupportedProfile> {
        Device::supported_encode_profiles()
    }

    pub fn state(&self) -> EncoderState {
        EncoderState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: EncoderState) {
        let old = self.state();
        if old != state {
            log::debug!("encoder state [{:?} -> {:?}]", old, state);
            self.state.store(state as u32, Ordering::Release);
        }
    }

    pub fn is_flush_supported(&self) -> bool {
        self.flush_supported
    }

    /// The broker-assigned encoder slot this engine occupies.
    pub fn port_index(&self) -> i32 {
        self.port_index
    }

    /// The configuration this engine was initialized with.
    pub fn config(&self) -> Option<&EncoderConfig> {
        self.config.as_ref()
    }

    /// Opens the device, negotiates both formats, programs the codec
    /// controls, and allocates the bitstream buffers.
    pub fn initialize(
        &mut self,
        config: &EncoderConfig,
        client: Arc<dyn EncoderClient>,
        venc_port_index: i32,
    ) -> Result<EncoderClientConfig> {
        log::debug!(
            "profile [{:?}], resource index [{}], size [{}x{}]",
            config.profile,
            venc_port_index,
            config.width,
            config.height
        );

        self.client = Some(client.clone());
        self.port_index = venc_port_index;

        self.input_visible_rect = Rect::from(Size::new(config.width, config.height));
        self.output_format = config.profile.to_v4l2_pix_fmt();

        let device = Arc::new(Device::open(DeviceType::Encoder, self.output_format)?);

        let (min_resolution, max_resolution) = device.supported_resolution(self.output_format);
        if config.width < min_resolution.width
            || config.height < min_resolution.height
            || config.width > max_resolution.width
            || config.height > max_resolution.height
        {
            log::error!(
                "unsupported resolution [{}x{}], min {:?}, max {:?}",
                config.width,
                config.height,
                min_resolution,
                max_resolution
            );
            return Err(Error::InvalidArgument("resolution outside device limits"));
        }

        self.flush_supported = device.try_encoder_cmd(EncCmd::STOP).is_ok();
        if !self.flush_supported {
            log::debug!("V4L2_ENC_CMD_STOP is not supported");
        }

        let caps = device.capabilities()?;
        let required = CapabilityFlags::VIDEO_M2M_MPLANE | CapabilityFlags::STREAMING;
        if !caps.all_capabilities().contains(required) {
            log::error!("capability check failed: {:?}", caps.all_capabilities());
            return Err(Error::Platform(io::Error::new(
                io::ErrorKind::Other,
                "device is not a streaming mem2mem encoder",
            )));
        }

        self.input_queue = Some(Queue::new(device.clone(), BufType::VIDEO_OUTPUT_MPLANE));
        self.output_queue = Some(Queue::new(device.clone(), BufType::VIDEO_CAPTURE_MPLANE));
        self.device = Some(device);

        self.output_buffer_size = config.output_buffer_size;
        self.config = Some(config.clone());

        if let Err(e) = self.set_formats(config.pixel_format) {
            log::error!("failed setting up formats");
            return Err(e);
        }

        self.input_memory_type = Memory::MMAP;
        self.output_memory_type = Memory::MMAP;

        self.init_controls(config)?;
        self.create_output_buffers()?;

        if let Err(e) = self.update_encoding_params(config.bit_rate, config.frame_rate) {
            return Err(e);
        }

        self.start_device_poll()?;

        Ok(EncoderClientConfig {
            input_frame_size: self.input_frame_size,
            should_control_buffer_feed: false,
            output_buffer_byte_size: self.output_buffer_size,
            should_inject_sps_and_pps: self.inject_sps_and_pps,
        })
    }

    /// Best-effort teardown; never fails.
    pub fn destroy(&mut self) {
        if let Err(e) = self.stop_device_poll() {
            log::error!("stopping device poll during destroy: {}", e);
        }

        self.destroy_input_buffers();
        self.destroy_output_buffers();

        self.input_queue = None;
        self.output_queue = None;
        self.device = None;
        self.start_time = None;
    }

    /// Submits one frame for encoding.
    pub fn encode_frame(&mut self, frame: Arc<VideoFrame>, force_keyframe: bool) -> Result<()> {
        log::debug!("force_keyframe [{}]", force_keyframe);

        if self.state() == EncoderState::Error {
            log::debug!("early out: error state");
            return Err(Error::IllegalState);
        }

        if !self.input_buffers_created {
            self.create_input_buffers()?;
        }

        self.encoder_input_queue.push_back(InputFrameInfo {
            frame: Some(frame),
            force_keyframe,
        });
        self.enqueue_buffers();

        Ok(())
    }

    /// Requests a flush once every frame submitted so far is encoded.
    pub fn flush_frames(&mut self) -> Result<()> {
        if self.state() == EncoderState::Error {
            log::debug!("early out: error state");
            return Err(Error::IllegalState);
        }

        if !self.input_buffers_created {
            log::debug!("valid input frames are not queued yet");
            return Err(Error::IllegalState);
        }

        self.encoder_input_queue.push_back(InputFrameInfo {
            frame: None,
            force_keyframe: false,
        });
        self.enqueue_buffers();

        Ok(())
    }

    /// Applies a new bitrate and/or framerate; zero values are ignored.
    pub fn update_encoding_params(&mut self, bitrate: u32, framerate: u32) -> Result<()> {
        log::debug!("bitrate [{}], framerate [{}]", bitrate, framerate);

        if bitrate == 0 || framerate == 0 {
            return Ok(());
        }

        if let Some(device) = self.device.clone() {
            if self.current_bitrate != bitrate {
                if let Err(e) = device.write_ctrl(Cid::MPEG_VIDEO_BITRATE, bitrate as i32) {
                    log::error!("failed changing bitrate");
                    self.notify_error(&e);
                    return Err(e);
                }
            }

            if self.current_framerate != framerate {
                if let Err(e) = device.set_output_timeperframe(framerate) {
                    self.notify_error(&e);
                    return Err(e);
                }
            }
        }

        self.current_bitrate = bitrate;
        self.current_framerate = framerate;
        Ok(())
    }

    /// One pump iteration, scheduled by the client after
    /// [`EncoderClient::notify_encode_buffer_task`].
    pub fn run_encode_buffer_task(&mut self) {
        if self.state() == EncoderState::Error {
            log::debug!("early out: error state");
            return;
        }

        self.dequeue_buffers();
        self.enqueue_buffers();

        if let Some(device) = self.device.clone() {
            if device.clear_device_poll_interrupt().is_err() {
                return;
            }
        }

        let poll_device = self.input_queued_count() + self.output_queued_count() > 0;
        self.schedule_device_poll_task(poll_device);

        log::debug!(
            "[{}] => DEVICE[{}+{}/{} -> {}+{}/{}]",
            self.encoder_input_queue.len(),
            self.free_buffers_count(QueueDirection::Input),
            self.input_queued_count(),
            INPUT_BUFFER_COUNT,
            self.free_buffers_count(QueueDirection::Output),
            self.output_queued_count(),
            self.output_queue
                .as_ref()
                .map_or(0, Queue::allocated_buffers_count),
        );
    }

    pub fn free_buffers_count(&self, direction: QueueDirection) -> usize {
        let queue = match direction {
            QueueDirection::Input => &self.input_queue,
            QueueDirection::Output => &self.output_queue,
        };
        queue.as_ref().map_or(0, Queue::free_buffers_count)
    }

    /// Called when the platform's resource broker revokes the codec slot.
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

    // === Formats ===

    fn set_formats(&mut self, input_format: VideoPixelFormat) -> Result<()> {
        log::debug!("input format [{:?}]", input_format);

        let streaming = self.input_queue.as_ref().map_or(false, Queue::is_streaming)
            || self.output_queue.as_ref().map_or(false, Queue::is_streaming);
        if streaming {
            log::debug!("already streaming");
            return Ok(());
        }

        self.set_output_format()?;

        let input_size = self.input_visible_rect.size();
        let format = self.set_input_format(input_format, input_size)?;

        self.input_frame_size = coded_size_from_format(&format).ok_or(Error::Platform(
            io::Error::new(io::ErrorKind::Other, "cannot size the negotiated input"),
        ))?;
        log::debug!("input_frame_size {:?}", self.input_frame_size);

        Ok(())
    }

    fn set_output_format(&mut self) -> Result<()> {
        let visible_size = self.input_visible_rect.size();
        let buffer_size = self.output_buffer_size;
        let format = self
            .output_queue
            .as_mut()
            .and_then(|q| q.set_format(self.output_format, visible_size, buffer_size));

        let format = match format {
            Some(format) => format,
            None => {
                log::error!(
                    "failed to set output format [{}], input {:?}, output [{}]",
                    self.output_format,
                    visible_size,
                    buffer_size
                );
                return Err(Error::Platform(io::Error::new(
                    io::ErrorKind::Other,
                    "output format rejected",
                )));
            }
        };

        // The driver may round the buffer size up; its adjustment wins.
        let plane_fmts = format.plane_fmt;
        self.output_buffer_size = plane_fmts[0].sizeimage as usize;
        Ok(())
    }

    /// Tries the requested format first, then the device's preferred raw
    /// formats, until the driver accepts one whose coded size fits.
    fn set_input_format(
        &mut self,
        pixel_format: VideoPixelFormat,
        frame_size: Size,
    ) -> Result<raw::PixFormatMplane> {
        log::debug!("frame_size {:?}", frame_size);

        let mut candidates = Vec::new();
        match PixelFormat::from_video_pixel_format(pixel_format, false) {
            Some(fourcc) => candidates.push(fourcc),
            None => {
                log::error!("invalid input format {:?}", pixel_format);
                return Err(Error::InvalidArgument("input pixel format not expressible"));
            }
        }
        candidates.extend_from_slice(DeviceType::Encoder.preferred_input_formats());

        for fourcc in candidates {
            log::debug!("trying S_FMT with {}", fourcc);

            let format = match self
                .input_queue
                .as_mut()
                .and_then(|q| q.set_format(fourcc, frame_size, 0))
            {
                Some(format) => format,
                None => continue,
            };

            log::debug!("success S_FMT with {}", fourcc);
            let device_frame = match VideoFrame::from_v4l2_format(&format) {
                Some(frame) => Arc::new(frame),
                None => {
                    log::error!("invalid device input frame");
                    return Err(Error::Platform(io::Error::new(
                        io::ErrorKind::Other,
                        "unusable negotiated input format",
                    )));
                }
            };

            if !Rect::from(device_frame.coded_size).contains(Rect::from(frame_size)) {
                log::error!(
                    "input size {:?} exceeds encoder size {:?}",
                    frame_size,
                    device_frame.coded_size
                );
                return Err(Error::InvalidArgument("visible size exceeds coded size"));
            }

            self.device_input_frame = Some(device_frame);
            self.apply_crop()?;

            return Ok(format);
        }

        Err(Error::Platform(io::Error::new(
            io::ErrorKind::Other,
            "no acceptable input format",
        )))
    }

    /// Programs the visible rectangle; the adjusted rectangle must match the
    /// request exactly or initialization fails.
    fn apply_crop(&mut self) -> Result<()> {
        let device = match self.device.clone() {
            Some(device) => device,
            None => return Err(Error::IllegalState),
        };

        let requested: raw::Rect = self.input_visible_rect.into();

        let adjusted = match device.s_selection_crop(BufType::VIDEO_OUTPUT, requested) {
            Ok(rect) => {
                log::debug!("VIDIOC_S_SELECTION is supported");
                rect
            }
            Err(_) => {
                log::debug!("falling back to VIDIOC_S/G_CROP");
                device.s_crop(BufType::VIDEO_OUTPUT_MPLANE, requested)?;
                device.g_crop(BufType::VIDEO_OUTPUT_MPLANE)?
            }
        };

        let adjusted = Rect::from(adjusted);
        if self.input_visible_rect != adjusted {
            log::error!(
                "visible rect {:?} adjusted to {:?}",
                self.input_visible_rect,
                adjusted
            );
            return Err(Error::Platform(io::Error::new(
                io::ErrorKind::Other,
                "driver cannot crop to the requested rectangle",
            )));
        }

        Ok(())
    }

    // === Controls ===

    fn init_controls(&mut self, config: &EncoderConfig) -> Result<()> {
        match self.output_format {
            PixelFormat::H264 => self.init_controls_h264(config)?,
            PixelFormat::VP8 => self.init_controls_vp8(),
            _ => {
                log::error!("unsupported codec {}", self.output_format);
                return Err(Error::InvalidArgument("no control set for this codec"));
            }
        }

        if let Some(device) = &self.device {
            // Macroblock-level rate control; best effort on all codecs.
            let _ = device.write_ctrl(Cid::MPEG_VIDEO_MB_RC_ENABLE, 1);
            if let Err(e) = device.set_gop_length(config.gop_length) {
                log::debug!("set_gop_length failed: {}", e);
            }
        }

        Ok(())
    }

    fn init_controls_h264(&mut self, config: &EncoderConfig) -> Result<()> {
        let device = match self.device.clone() {
            Some(device) => device,
            None => return Err(Error::IllegalState),
        };

        self.inject_sps_and_pps = false;

        let _ = device.write_ctrl(Cid::MPEG_VIDEO_B_FRAMES, 0);

        let profile_value = match config.profile.to_v4l2_h264_profile() {
            Some(value) => value,
            None => {
                log::error!("invalid H264 profile value");
                let error = Error::InvalidArgument("profile is not an H264 profile");
                self.notify_error(&error);
                return Err(error);
            }
        };
        let _ = device.write_ctrl(Cid::MPEG_VIDEO_H264_PROFILE, profile_value.0);

        let level_idc = match &self.client {
            Some(client) => client.get_h264_level_limit(config),
            None => config.h264_output_level,
        };
        match h264_level_idc_to_v4l2_level(level_idc) {
            Some(level) => {
                let _ = device.write_ctrl(Cid::MPEG_VIDEO_H264_LEVEL, level.0);
            }
            None => log::debug!("unmapped H264 level_idc {}", level_idc),
        }

        let _ = device.write_ctrl(
            Cid::MPEG_VIDEO_HEADER_MODE,
            HeaderMode::JOINED_WITH_1ST_FRAME.0,
        );
        let _ = device.write_ctrl(Cid::MPEG_VIDEO_H264_I_PERIOD, 0);
        let _ = device.write_ctrl(
            Cid::MPEG_VIDEO_H264_LOOP_FILTER_MODE,
            LoopFilterMode::ENABLED.0,
        );

        if config.profile == VideoCodecProfile::H264Main
            || config.profile == VideoCodecProfile::H264High
        {
            let _ = device.write_ctrl(Cid::MPEG_VIDEO_H264_ENTROPY_MODE, EntropyMode::CABAC.0);
        }

        if config.profile == VideoCodecProfile::H264High {
            let _ = device.write_ctrl(Cid::MPEG_VIDEO_H264_8X8_TRANSFORM, 1);
        }

        let _ = device.write_ctrl(Cid::MPEG_VIDEO_H264_MAX_QP, 42);
        let _ = device.write_ctrl(Cid::MPEG_VIDEO_H264_MIN_QP, 24);

        Ok(())
    }

    fn init_controls_vp8(&self) {
        if let Some(device) = &self.device {
            let _ = device.write_ctrl(Cid::MPEG_VIDEO_VPX_MIN_QP, 4);
            let _ = device.write_ctrl(Cid::MPEG_VIDEO_VPX_MAX_QP, 117);
        }
    }

    // === Buffers ===

    fn create_input_buffers(&mut self) -> Result<()> {
        let allocated = {
            let input_queue = match self.input_queue.as_mut() {
                Some(queue) => queue,
                None => return Err(Error::IllegalState),
            };
            input_queue.allocate_buffers(INPUT_BUFFER_COUNT, self.input_memory_type)?
        };

        if allocated < INPUT_BUFFER_COUNT {
            log::error!("failed to allocate input buffers");
            return Err(Error::Platform(io::Error::new(
                io::ErrorKind::Other,
                "short input buffer allocation",
            )));
        }

        if let Some(client) = &self.client {
            client.create_input_buffers(allocated);
        }
        self.input_buffers_created = true;

        log::debug!("allocated [{}]", allocated);
        Ok(())
    }

    fn create_output_buffers(&mut self) -> Result<()> {
        let allocated = {
            let output_queue = match self.output_queue.as_mut() {
                Some(queue) => queue,
                None => return Err(Error::IllegalState),
            };
            output_queue.allocate_buffers(OUTPUT_BUFFER_COUNT, self.output_memory_type)?
        };

        if allocated < OUTPUT_BUFFER_COUNT {
            log::error!("failed to allocate output buffers");
            return Err(Error::Platform(io::Error::new(
                io::ErrorKind::Other,
                "short output buffer allocation",
            )));
        }

        log::debug!("allocated [{}]", allocated);
        Ok(())
    }

    fn destroy_input_buffers(&mut self) {
        let input_queue = match self.input_queue.as_mut() {
            Some(queue) if queue.allocated_buffers_count() > 0 => queue,
            _ => return,
        };

        if let Err(e) = input_queue.deallocate_buffers() {
            log::debug!("deallocating input buffers: {}", e);
        }
        if let Some(client) = &self.client {
            client.destroy_input_buffers();
        }
    }

    fn destroy_output_buffers(&mut self) {
        let output_queue = match self.output_queue.as_mut() {
            Some(queue) if queue.allocated_buffers_count() > 0 => queue,
            _ => return,
        };

        if let Err(e) = output_queue.deallocate_buffers() {
            log::debug!("deallocating output buffers: {}", e);
        }
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

        log::debug!(
            "free input buffers [{}], submission queue [{}]",
            self.free_buffers_count(QueueDirection::Input),
            self.encoder_input_queue.len()
        );

        let mut do_streamon = false;
        let old_inputs_queued = self.input_queued_count();

        while !self.encoder_input_queue.is_empty()
            && self.free_buffers_count(QueueDirection::Input) > 0
        {
            let is_flush_marker = self
                .encoder_input_queue
                .front()
                .map_or(false, |info| info.frame.is_none());

            if is_flush_marker {
                log::debug!("all input frames needing flush are enqueued");
                self.encoder_input_queue.pop_front();

                if !self.input_streaming() {
                    client.notify_flush_if_needed(true);
                    return;
                }

                let result = match &self.device {
                    Some(device) => device.encoder_cmd(EncCmd::STOP),
                    None => Err(Error::IllegalState),
                };
                if let Err(e) = result {
                    log::error!("VIDIOC_ENCODER_CMD failed");
                    self.notify_error(&e);
                    client.notify_flush_if_needed(false);
                    return;
                }

                client.notify_encoder_state(EncoderState::Flushing);
                break;
            }

            let input = match self.input_queue.as_mut().and_then(Queue::get_free_buffer) {
                Some(input) => input,
                None => return,
            };
            if !self.enqueue_input_buffer(input) {
                return;
            }
        }

        if old_inputs_queued == 0 && self.input_queued_count() != 0 {
            let interrupted = self
                .device
                .as_ref()
                .map_or(false, |d| d.set_device_poll_interrupt().is_ok());
            if !interrupted {
                return;
            }
            do_streamon = !self.input_streaming();
        }

        if !self.input_streaming() && !do_streamon {
            return;
        }

        let old_outputs_queued = self.output_queued_count();
        while let Some(output) = self.output_queue.as_mut().and_then(Queue::get_free_buffer) {
            if !self.enqueue_output_buffer(output) {
                return;
            }
        }
        if old_outputs_queued == 0 && self.output_queued_count() != 0 {
            let interrupted = self
                .device
                .as_ref()
                .map_or(false, |d| d.set_device_poll_interrupt().is_ok());
            if !interrupted {
                return;
            }
        }

        if do_streamon {
            // The output side must be streaming before the first input
            // buffer makes it to the driver.
            let result = self
                .output_queue
                .as_mut()
                .map(Queue::stream_on)
                .unwrap_or(Err(Error::IllegalState))
                .and_then(|()| {
                    self.input_queue
                        .as_mut()
                        .map(Queue::stream_on)
                        .unwrap_or(Err(Error::IllegalState))
                });
            if let Err(e) = result {
                log::error!("failed to stream on");
                self.notify_error(&e);
            }
        }
    }

    fn dequeue_buffers(&mut self) {
        while self.input_queued_count() > 0 {
            if !self.dequeue_input_buffer() {
                break;
            }
        }

        let mut buffer_dequeued = false;
        while self.output_queued_count() > 0 {
            if !self.dequeue_output_buffer() {
                break;
            }
            buffer_dequeued = true;
        }

        if buffer_dequeued {
            if let Some(client) = self.client.clone() {
                client.pump_bitstream_buffers();
            }
        }
    }

    fn enqueue_input_buffer(&mut self, mut buffer: WritableBufferRef) -> bool {
        let info = match self.encoder_input_queue.front().cloned() {
            Some(info) => info,
            None => return false,
        };

        if info.force_keyframe {
            let forced = self
                .device
                .as_ref()
                .map_or(false, |d| d.write_ctrl(Cid::MPEG_VIDEO_FORCE_KEY_FRAME, 0).is_ok());
            if !forced {
                log::error!("failed requesting keyframe");
                self.notify_error(&Error::Platform(io::Error::new(
                    io::ErrorKind::Other,
                    "force-keyframe control rejected",
                )));
                return false;
            }
        }

        let frame = match info.frame {
            Some(frame) => frame,
            None => return false,
        };

        let device_frame = match self.device_input_frame.clone() {
            Some(device_frame) => device_frame,
            None => return false,
        };

        let buffer_index = buffer.index();
        buffer.set_timestamp(frame.timestamp);

        let fourcc = PixelFormat::from_video_pixel_format(
            device_frame.format,
            !device_frame.is_multi_planar,
        );
        let num_planes = match fourcc {
            Some(fourcc) => fourcc.num_buffer_planes(),
            None => return false,
        };

        for plane in 0..num_planes {
            let bytes_used = if num_planes == 1 {
                allocation_size(frame.format, device_frame.coded_size)
            } else {
                plane_size(frame.format, plane, device_frame.coded_size)
            };

            match buffer.memory() {
                Memory::MMAP => {
                    let src_ptr = frame.data[plane] as *const u8;
                    if src_ptr.is_null() {
                        log::error!("frame plane {} has no data pointer", plane);
                        return false;
                    }

                    let capacity = buffer.buffer_size(plane);
                    let copy_len = bytes_used.min(capacity);
                    let dst = match buffer.plane_mut(plane) {
                        Ok(dst) => dst,
                        Err(e) => {
                            log::error!("mapping input plane {}: {}", plane, e);
                            return false;
                        }
                    };
                    let src = unsafe { slice::from_raw_parts(src_ptr, copy_len) };
                    dst[..copy_len].copy_from_slice(src);
                }
                Memory::USERPTR => {
                    buffer.set_buffer_size(plane, device_frame.color_planes[plane].size);
                }
                _ => return false,
            }

            buffer.set_bytes_used(plane, bytes_used);
        }

        let queued = match buffer.memory() {
            Memory::MMAP => self
                .input_queue
                .as_mut()
                .map(|q| q.queue_mmap(buffer, None))
                .map_or(false, |r| r.is_ok()),
            Memory::USERPTR => {
                let ptrs = frame.data[..num_planes].to_vec();
                self.input_queue
                    .as_mut()
                    .map(|q| q.queue_userptr(buffer, &ptrs, Some(frame.clone())))
                    .map_or(false, |r| r.is_ok())
            }
            _ => false,
        };
        if !queued {
            return false;
        }

        if let Some(client) = &self.client {
            client.enqueue_input_buffer(buffer_index);
        }
        self.encoder_input_queue.pop_front();

        true
    }

    fn enqueue_output_buffer(&mut self, buffer: WritableBufferRef) -> bool {
        let result = match buffer.memory() {
            Memory::MMAP => self
                .output_queue
                .as_mut()
                .map(|q| q.queue_mmap(buffer, None)),
            _ => None,
        };

        match result {
            Some(Ok(())) => true,
            _ => {
                log::debug!("error enqueuing output buffer");
                false
            }
        }
    }

    fn dequeue_input_buffer(&mut self) -> bool {
        log::debug!("inputs queued: {}", self.input_queued_count());

        let result = match self.input_queue.as_mut() {
            Some(queue) => queue.dequeue_buffer(),
            None => return false,
        };

        match result {
            Err(e) => {
                self.notify_error(&e);
                false
            }
            // We're just out of buffers to dequeue.
            Ok(None) => false,
            Ok(Some(buffer)) => {
                if let Some(client) = &self.client {
                    client.dequeue_input_buffer(buffer.index());
                }
                true
            }
        }
    }

    fn dequeue_output_buffer(&mut self) -> bool {
        let result = match self.output_queue.as_mut() {
            Some(queue) => queue.dequeue_buffer(),
            None => return false,
        };

        let buffer = match result {
            Err(e) => {
                self.notify_error(&e);
                return false;
            }
            // We're just out of buffers to dequeue.
            Ok(None) => return false,
            Ok(Some(buffer)) => buffer,
        };

        self.record_output_frame();

        if let Some(client) = &self.client {
            client.bitstream_buffer_ready(buffer);
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
                "encoder @ {} secs => {} fps",
                self.current_secs,
                self.frames_per_sec
            );
            self.start_time = Some(now);
            self.frames_per_sec = 0;
        }
    }

    // === Polling ===

    pub fn start_device_poll(&mut self) -> Result<()> {
        if self.poll_thread.is_running() {
            return Ok(());
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

        match &self.device {
            Some(device) => device.clear_device_poll_interrupt()?,
            None => return Err(Error::IllegalState),
        }

        // Some drivers cannot stream off a stream that is already off, so
        // check first.
        if let Some(input_queue) = self.input_queue.as_mut() {
            if input_queue.is_streaming() {
                input_queue.stream_off()?;
            }
        }
        if let Some(output_queue) = self.output_queue.as_mut() {
            if output_queue.is_streaming() {
                output_queue.stream_off()?;
            }
        }

        // Reset all our accounting info.
        self.encoder_input_queue.clear();
        if let Some(client) = &self.client {
            client.stop_device_poll();
        }

        log::debug!("device poll thread stopped");
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

        self.poll_thread.post(move || match device.poll(poll_device) {
            Ok(_) => client.notify_encode_buffer_task(),
            Err(e) => {
                log::error!("failed during poll: {}", e);
                client.notify_encoder_error(EncoderError::PlatformFailure);
            }
        });
    }

    fn notify_error(&self, error: &Error) {
        log::error!("encoder error: {}", error);
        self.set_state(EncoderState::Error);
        if let Some(client) = &self.client {
            client.notify_encoder_error(EncoderError::from_error(error));
        }
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        let encoder = VideoEncoder::new();
        assert_eq!(encoder.state(), EncoderState::Uninitialized);
        encoder.set_state(EncoderState::Encoding);
        assert_eq!(encoder.state(), EncoderState::Encoding);
        encoder.set_state(EncoderState::Flushing);
        assert_eq!(encoder.state(), EncoderState::Flushing);
    }

    #[test]
    fn error_kind_mapping() {
        assert_eq!(
            EncoderError::from_error(&Error::IllegalState),
            EncoderError::IllegalState
        );
        assert_eq!(
            EncoderError::from_error(&Error::InvalidArgument("x")),
            EncoderError::InvalidArgument
        );
        assert_eq!(
            EncoderError::from_error(&Error::UnreadableInput),
            EncoderError::PlatformFailure
        );
    }

    #[test]
    fn flush_without_frames_is_rejected() {
        let mut encoder = VideoEncoder::new();
        // No frame was ever submitted, so there is nothing a flush could
        // wait for.
        assert!(matches!(
            encoder.flush_frames(),
            Err(Error::IllegalState)
        ));
    }

    #[test]
    fn param_updates_ignore_zero_values() {
        let mut encoder = VideoEncoder::new();
        encoder.update_encoding_params(0, 30).unwrap();
        encoder.update_encoding_params(1_000_000, 0).unwrap();
        assert_eq!(encoder.current_bitrate, 0);
        assert_eq!(encoder.current_framerate, 0);
    }
}
