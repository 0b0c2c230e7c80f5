//! **Linux** video **codec** library: drives V4L2 memory-to-memory decode and
//! encode devices.
//!
//! A [`Device`] wraps one codec node (`/dev/video1x`) together with the
//! eventfd used to interrupt blocking polls. On top of it, [`queue::Queue`]
//! manages the paired INPUT/OUTPUT buffer queues, and
//! [`decoder::VideoDecoder`] / [`encoder::VideoEncoder`] run the actual
//! streaming state machines.

#[macro_use]
mod macros;
mod buf_type;
mod buffer;
mod codec;
mod error;
mod frame;
mod geometry;
mod pixel_format;
mod poll_thread;
mod raw;
mod shared;

pub mod decoder;
pub mod encoder;
pub mod queue;
pub mod resource;

use std::ffi::c_void;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::mem::{self, MaybeUninit};
use std::os::unix::prelude::*;
use std::path::Path;
use std::ptr;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd;

use raw::controls::Cid;

pub use buf_type::*;
pub use buffer::{ReadableBufferRef, WritableBufferRef};
pub use codec::{h264_level_idc_to_v4l2_level, SupportedProfile, VideoCodec, VideoCodecProfile};
pub use error::{Error, Result};
pub use frame::{allocation_size, coded_size_from_format, plane_size, ColorPlane, VideoFrame};
pub use geometry::{Rect, Size};
pub use pixel_format::{PixelFormat, VideoPixelFormat};
pub use poll_thread::PollThread;
pub use shared::*;

/// `GL_TEXTURE_EXTERNAL_OES`; decoded pictures bind to this texture target.
pub const TEXTURE_TARGET_EXTERNAL_OES: u32 = 0x8D65;

/// The codec backend to instantiate, selected through the
/// `USE_CODEC_INSTANCE` environment variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecBackend {
    /// The V4L2 memory-to-memory engines implemented by this crate.
    V4l2,
    /// A GStreamer-based encoder provided by the platform layer; not part of
    /// this crate.
    GStreamer,
}

/// Reads the backend selection from the environment. Defaults to
/// [`CodecBackend::V4l2`].
pub fn active_backend() -> CodecBackend {
    match std::env::var("USE_CODEC_INSTANCE") {
        Ok(value) if value == "GST" => CodecBackend::GStreamer,
        _ => CodecBackend::V4l2,
    }
}

/// The kinds of video device nodes a platform exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Decoder,
    Encoder,
    ImageProcessor,
    JpegDecoder,
}

impl DeviceType {
    /// Device paths probed for this type, in order.
    pub fn candidate_paths(self) -> &'static [&'static str] {
        match self {
            DeviceType::Decoder => &["/dev/video10"],
            DeviceType::Encoder => &["/dev/video11"],
            DeviceType::ImageProcessor => &["/dev/video12"],
            DeviceType::JpegDecoder => &["/dev/jpeg-dec"],
        }
    }

    /// The queue whose formats identify a device of this type: decoders are
    /// recognized by their compressed INPUT side, encoders by their
    /// compressed OUTPUT side.
    fn probe_buf_type(self) -> BufType {
        match self {
            DeviceType::Encoder => BufType::VIDEO_CAPTURE_MPLANE,
            _ => BufType::VIDEO_OUTPUT_MPLANE,
        }
    }

    /// Raw-frame formats the device prefers on its input, most preferred
    /// first.
    pub fn preferred_input_formats(self) -> &'static [PixelFormat] {
        match self {
            DeviceType::Encoder => &[PixelFormat::YU12, PixelFormat::NM12, PixelFormat::NV12],
            _ => &[],
        }
    }
}

/// A V4L2 memory-to-memory codec device.
pub struct Device {
    file: File,
    /// Eventfd used to pre-empt a blocking [`Device::poll`].
    interrupt: File,
    device_type: DeviceType,
}

impl Device {
    /// Opens the first device of `device_type` that supports `pix_fmt` on
    /// the side identified by the device type.
    pub fn open(device_type: DeviceType, pix_fmt: PixelFormat) -> Result<Device> {
        for path in device_type.candidate_paths() {
            let device = match Self::open_path(Path::new(path), device_type) {
                Ok(device) => device,
                Err(e) => {
                    log::debug!("failed opening {}: {}", path, e);
                    continue;
                }
            };

            if device
                .supported_pixel_formats(device_type.probe_buf_type())
                .contains(&pix_fmt)
            {
                log::debug!("opened {} for {}", path, pix_fmt);
                return Ok(device);
            }
        }

        log::info!("no device supporting {}", pix_fmt);
        Err(Error::NoDevice(pix_fmt))
    }

    /// Opens a specific device node without checking its formats.
    pub fn open_path(path: &Path, device_type: DeviceType) -> Result<Device> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nix::libc::O_NONBLOCK | nix::libc::O_CLOEXEC)
            .open(path)?;

        let interrupt_fd = eventfd(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)?;
        let interrupt = unsafe { File::from_raw_fd(interrupt_fd) };

        Ok(Device {
            file,
            interrupt,
            device_type,
        })
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn capabilities(&self) -> Result<Capabilities> {
        unsafe {
            let mut caps = MaybeUninit::uninit();
            retry_eintr!(raw::querycap(self.fd(), caps.as_mut_ptr()))?;
            Ok(Capabilities(caps.assume_init()))
        }
    }

    /// Enumerates the supported formats of a queue.
    pub fn formats(&self, buf_type: BufType) -> FormatDescIter<'_> {
        FormatDescIter {
            device: self,
            buf_type,
            next_index: 0,
            finished: false,
        }
    }

    /// The pixel formats the driver lists on `buf_type`.
    pub fn supported_pixel_formats(&self, buf_type: BufType) -> Vec<PixelFormat> {
        self.formats(buf_type)
            .filter_map(|desc| match desc {
                Ok(desc) => Some(desc.pixel_format()),
                Err(e) => {
                    log::debug!("format enumeration failed: {}", e);
                    None
                }
            })
            .collect()
    }

    /// The frame size range the driver reports for `pix_fmt`.
    ///
    /// Falls back to 16x16 .. 1920x1080 when the driver reports neither
    /// discrete nor stepwise sizes.
    pub fn supported_resolution(&self, pix_fmt: PixelFormat) -> (Size, Size) {
        let mut min = Size::default();
        let mut max = Size::default();

        let mut index = 0;
        loop {
            let mut frame_size: raw::FrmSizeEnum = unsafe { mem::zeroed() };
            frame_size.index = index;
            frame_size.pixel_format = pix_fmt;
            if unsafe { retry_eintr!(raw::enum_framesizes(self.fd(), &mut frame_size)) }.is_err() {
                break;
            }
            index += 1;

            match frame_size.type_ {
                FrmSizeType::DISCRETE => {
                    let discrete = unsafe { frame_size.union.discrete };
                    if discrete.width >= max.width && discrete.height >= max.height {
                        max = Size::new(discrete.width, discrete.height);
                    }
                    if min.is_empty()
                        || (discrete.width <= min.width && discrete.height <= min.height)
                    {
                        min = Size::new(discrete.width, discrete.height);
                    }
                }
                FrmSizeType::STEPWISE | FrmSizeType::CONTINUOUS => {
                    let stepwise = unsafe { frame_size.union.stepwise };
                    max = Size::new(stepwise.max_width, stepwise.max_height);
                    min = Size::new(stepwise.min_width, stepwise.min_height);
                    break;
                }
                _ => {}
            }
        }

        if max.is_empty() {
            max = Size::new(1920, 1080);
        }
        if min.is_empty() {
            min = Size::new(16, 16);
        }

        (min, max)
    }

    /// The codec profiles selectable for a compressed format.
    ///
    /// Queries the driver's profile menu; drivers without profile
    /// enumeration get a fixed fallback list.
    pub fn profiles_for_pix_fmt(&self, pix_fmt: PixelFormat) -> Vec<VideoCodecProfile> {
        let mut profiles = match pix_fmt {
            PixelFormat::H264 => self.query_profile_menu(VideoCodec::H264).unwrap_or_else(|| {
                log::info!("driver does not enumerate H264 profiles, assuming defaults");
                vec![
                    VideoCodecProfile::H264Baseline,
                    VideoCodecProfile::H264Main,
                    VideoCodecProfile::H264High,
                ]
            }),
            PixelFormat::VP8 => vec![VideoCodecProfile::Vp8Any],
            PixelFormat::VP9 => self.query_profile_menu(VideoCodec::Vp9).unwrap_or_else(|| {
                log::info!("driver does not enumerate VP9 profiles, assuming profile 0");
                vec![VideoCodecProfile::Vp9Profile0]
            }),
            _ => return Vec::new(),
        };

        profiles.sort_unstable();
        profiles.dedup();
        profiles
    }

    fn query_profile_menu(&self, codec: VideoCodec) -> Option<Vec<VideoCodecProfile>> {
        let cid = match codec {
            VideoCodec::H264 => Cid::MPEG_VIDEO_H264_PROFILE,
            VideoCodec::Vp8 => Cid::MPEG_VIDEO_VP8_PROFILE,
            VideoCodec::Vp9 => Cid::MPEG_VIDEO_VP9_PROFILE,
        };

        let mut query: raw::QueryCtrl = unsafe { mem::zeroed() };
        query.id = cid.0;
        unsafe { retry_eintr!(raw::queryctrl(self.fd(), &mut query)) }.ok()?;

        let mut profiles = Vec::new();
        for index in query.minimum..=query.maximum {
            let mut menu: raw::QueryMenu = unsafe { mem::zeroed() };
            menu.id = query.id;
            menu.index = index as u32;
            if unsafe { retry_eintr!(raw::querymenu(self.fd(), &mut menu)) }.is_ok() {
                if let Some(profile) = VideoCodecProfile::from_v4l2_menu_index(codec, index) {
                    profiles.push(profile);
                }
            }
        }

        Some(profiles)
    }

    /// Sweeps all decoder nodes and reports every decodable profile.
    pub fn supported_decode_profiles() -> Vec<SupportedProfile> {
        Self::supported_profiles_for_type(DeviceType::Decoder)
    }

    /// Sweeps all encoder nodes and reports every encodable profile.
    pub fn supported_encode_profiles() -> Vec<SupportedProfile> {
        Self::supported_profiles_for_type(DeviceType::Encoder)
    }

    fn supported_profiles_for_type(device_type: DeviceType) -> Vec<SupportedProfile> {
        let mut supported = Vec::new();
        for path in device_type.candidate_paths() {
            let device = match Self::open_path(Path::new(path), device_type) {
                Ok(device) => device,
                Err(e) => {
                    log::info!("failed opening {}: {}", path, e);
                    continue;
                }
            };

            for pix_fmt in device.supported_pixel_formats(device_type.probe_buf_type()) {
                let (min_resolution, max_resolution) = device.supported_resolution(pix_fmt);
                for profile in device.profiles_for_pix_fmt(pix_fmt) {
                    log::debug!(
                        "profile {:?}, min {:?}, max {:?}",
                        profile,
                        min_resolution,
                        max_resolution
                    );
                    supported.push(SupportedProfile {
                        profile,
                        min_resolution,
                        max_resolution,
                        encrypted_only: false,
                    });
                }
            }
        }

        supported.sort_unstable_by_key(|p| p.profile);
        supported.dedup();
        supported
    }

    /// Whether an EGL image can be created from pictures in `pix_fmt`.
    pub fn can_create_egl_image_from(&self, pix_fmt: PixelFormat) -> bool {
        const DRM_ARGB8888: u32 = u32::from_le_bytes(*b"AR24");
        const DRM_NV12: u32 = u32::from_le_bytes(*b"NV12");
        const DRM_YVU420: u32 = u32::from_le_bytes(*b"YV12");

        let drm_format = match pix_fmt {
            PixelFormat::NV12 | PixelFormat::NM12 => DRM_NV12,
            PixelFormat::YV12 => DRM_YVU420,
            PixelFormat::RGB4 => DRM_ARGB8888,
            _ => return false,
        };

        [DRM_ARGB8888, DRM_NV12, DRM_YVU420].contains(&drm_format)
    }

    pub fn texture_target(&self) -> u32 {
        TEXTURE_TARGET_EXTERNAL_OES
    }

    // === Event handling ===

    /// Subscribes to the source-change event stream.
    pub fn subscribe_source_change_event(&self) -> Result<()> {
        let mut sub: raw::EventSubscription = unsafe { mem::zeroed() };
        sub.type_ = EventType::SOURCE_CHANGE;
        unsafe { retry_eintr!(raw::subscribe_event(self.fd(), &sub)) }?;
        Ok(())
    }

    pub fn unsubscribe_source_change_event(&self) -> Result<()> {
        let mut sub: raw::EventSubscription = unsafe { mem::zeroed() };
        sub.type_ = EventType::SOURCE_CHANGE;
        unsafe { retry_eintr!(raw::unsubscribe_event(self.fd(), &sub)) }?;
        Ok(())
    }

    /// Pops one pending event, or `None` if the event queue is empty.
    pub fn dequeue_event(&self) -> Option<raw::Event> {
        unsafe {
            let mut event = MaybeUninit::uninit();
            match retry_eintr!(raw::dqevent(self.fd(), event.as_mut_ptr())) {
                Ok(_) => Some(event.assume_init()),
                Err(_) => {
                    log::debug!("failed to dequeue event");
                    None
                }
            }
        }
    }

    // === Controls ===

    pub fn read_ctrl(&self, cid: Cid) -> Result<i32> {
        let mut ctrl: raw::ExtControl = unsafe { mem::zeroed() };
        ctrl.id = cid.0;

        let mut ctrls: raw::ExtControls = unsafe { mem::zeroed() };
        ctrls.count = 1;
        ctrls.controls = &mut ctrl;

        unsafe { retry_eintr!(raw::g_ext_ctrls(self.fd(), &mut ctrls)) }.map_err(|e| {
            log::info!("failed to get control {:?}: {}", cid, e);
            Error::from(e)
        })?;

        Ok(unsafe { ctrl.value.value })
    }

    pub fn write_ctrl(&self, cid: Cid, value: i32) -> Result<()> {
        log::debug!("set control {:?} = {}", cid, value);

        let mut ctrl: raw::ExtControl = unsafe { mem::zeroed() };
        ctrl.id = cid.0;
        ctrl.value = raw::ExtControlUnion { value };

        let mut ctrls: raw::ExtControls = unsafe { mem::zeroed() };
        ctrls.ctrl_class = cid.class();
        ctrls.count = 1;
        ctrls.controls = &mut ctrl;

        unsafe { retry_eintr!(raw::s_ext_ctrls(self.fd(), &mut ctrls)) }.map_err(|e| {
            log::info!("failed to set control {:?}: {}", cid, e);
            Error::from(e)
        })?;

        Ok(())
    }

    pub fn is_ctrl_exposed(&self, cid: Cid) -> bool {
        let mut query: raw::QueryCtrl = unsafe { mem::zeroed() };
        query.id = cid.0;
        unsafe { retry_eintr!(raw::queryctrl(self.fd(), &mut query)) }.is_ok()
    }

    /// Sets the encoder GOP length. Drivers that reject an infinite GOP
    /// (length 0) get the control's maximum instead.
    pub fn set_gop_length(&self, gop_length: u32) -> Result<()> {
        log::debug!("gop_length [{}]", gop_length);

        match self.write_ctrl(Cid::MPEG_VIDEO_GOP_SIZE, gop_length as i32) {
            Ok(()) => Ok(()),
            Err(e) => {
                if gop_length == 0 {
                    let mut query: raw::QueryExtCtrl = unsafe { mem::zeroed() };
                    query.id = Cid::MPEG_VIDEO_GOP_SIZE.0;
                    if unsafe { retry_eintr!(raw::query_ext_ctrl(self.fd(), &mut query)) }.is_ok() {
                        log::info!("unable to set GOP to 0, instead using max {}", query.maximum);
                        return self.write_ctrl(Cid::MPEG_VIDEO_GOP_SIZE, query.maximum as i32);
                    }
                }
                Err(e)
            }
        }
    }

    // === Poll / interrupt ===

    /// Blocks until the interrupt fd is written or, with `poll_device`, the
    /// device becomes ready. Returns whether the device signalled a pending
    /// V4L2 event (`POLLPRI`).
    pub fn poll(&self, poll_device: bool) -> Result<bool> {
        let interrupt_events = PollFlags::POLLIN | PollFlags::POLLERR;
        let device_events =
            PollFlags::POLLIN | PollFlags::POLLOUT | PollFlags::POLLERR | PollFlags::POLLPRI;

        let mut fds = Vec::with_capacity(2);
        fds.push(PollFd::new(self.interrupt.as_raw_fd(), interrupt_events));
        if poll_device {
            log::debug!("adding device fd to poll() set");
            fds.push(PollFd::new(self.fd(), device_events));
        }

        retry_eintr!(poll(&mut fds, -1)).map_err(|e| {
            log::debug!("poll() failed: {}", e);
            Error::from(e)
        })?;

        let event_pending = poll_device
            && fds[1]
                .revents()
                .map_or(false, |revents| revents.contains(PollFlags::POLLPRI));
        Ok(event_pending)
    }

    /// Wakes up a blocking [`Device::poll`] from another thread.
    pub fn set_device_poll_interrupt(&self) -> Result<()> {
        let buf = 1u64.to_ne_bytes();
        retry_eintr!(unistd::write(self.interrupt.as_raw_fd(), &buf)).map_err(|e| {
            log::info!("interrupt write() failed: {}", e);
            Error::from(e)
        })?;
        Ok(())
    }

    /// Drains the interrupt fd so the next poll blocks again.
    pub fn clear_device_poll_interrupt(&self) -> Result<()> {
        let mut buf = [0u8; 8];
        match retry_eintr!(unistd::read(self.interrupt.as_raw_fd(), &mut buf)) {
            Ok(_) => Ok(()),
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => {
                log::info!("interrupt read() failed: {}", e);
                Err(e.into())
            }
        }
    }

    // === Memory ===

    pub(crate) fn mmap(&self, len: usize, offset: u32) -> Result<*mut c_void> {
        unsafe {
            mmap(
                ptr::null_mut(),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                self.fd(),
                offset as nix::libc::off_t,
            )
            .map_err(|e| {
                log::error!("mmap() failed: {}", e);
                Error::from(e)
            })
        }
    }

    pub(crate) fn munmap(&self, addr: *mut c_void, len: usize) {
        unsafe {
            munmap(addr, len).ok();
        }
    }

    /// Exports one DMABUF fd per plane of buffer `index`. Any failure
    /// discards the whole batch.
    pub fn dmabufs_for_buffer(
        &self,
        index: u32,
        num_planes: usize,
        buf_type: BufType,
    ) -> Vec<RawFd> {
        let mut fds = Vec::with_capacity(num_planes);
        for plane in 0..num_planes {
            let mut expbuf: raw::ExportBuffer = unsafe { mem::zeroed() };
            expbuf.type_ = buf_type;
            expbuf.index = index;
            expbuf.plane = plane as u32;
            expbuf.flags = nix::libc::O_CLOEXEC as u32;
            if unsafe { retry_eintr!(raw::expbuf(self.fd(), &mut expbuf)) }.is_err() {
                fds.clear();
                break;
            }

            log::debug!("exported dmabuf fd {}", expbuf.fd);
            fds.push(expbuf.fd);
        }

        fds
    }

    // === Codec commands ===

    pub fn try_decoder_cmd(&self, cmd: DecCmd) -> Result<(), Errno> {
        let mut arg: raw::DecoderCmd = unsafe { mem::zeroed() };
        arg.cmd = cmd;
        unsafe { retry_eintr!(raw::try_decoder_cmd(self.fd(), &mut arg)) }.map(drop)
    }

    pub fn decoder_cmd(&self, cmd: DecCmd) -> Result<()> {
        let mut arg: raw::DecoderCmd = unsafe { mem::zeroed() };
        arg.cmd = cmd;
        unsafe { retry_eintr!(raw::decoder_cmd(self.fd(), &mut arg)) }?;
        Ok(())
    }

    pub fn try_encoder_cmd(&self, cmd: EncCmd) -> Result<(), Errno> {
        let mut arg: raw::EncoderCmd = unsafe { mem::zeroed() };
        arg.cmd = cmd;
        unsafe { retry_eintr!(raw::try_encoder_cmd(self.fd(), &mut arg)) }.map(drop)
    }

    pub fn encoder_cmd(&self, cmd: EncCmd) -> Result<()> {
        let mut arg: raw::EncoderCmd = unsafe { mem::zeroed() };
        arg.cmd = cmd;
        unsafe { retry_eintr!(raw::encoder_cmd(self.fd(), &mut arg)) }?;
        Ok(())
    }

    /// Sets the OUTPUT-queue frame interval to `1/framerate`.
    pub fn set_output_timeperframe(&self, framerate: u32) -> Result<()> {
        let mut output: raw::OutputParm = unsafe { mem::zeroed() };
        output.timeperframe = raw::Fract {
            numerator: 1,
            denominator: framerate,
        };

        let mut parm: raw::StreamParm = unsafe { mem::zeroed() };
        parm.type_ = BufType::VIDEO_OUTPUT_MPLANE;
        parm.union.output = output;

        unsafe { retry_eintr!(raw::s_parm(self.fd(), &mut parm)) }?;
        Ok(())
    }

    // === Queue plumbing (used by `queue::Queue`) ===

    pub(crate) fn g_fmt_mplane(&self, buf_type: BufType) -> Result<raw::PixFormatMplane, Errno> {
        let mut format: raw::Format = unsafe { mem::zeroed() };
        format.type_ = buf_type;
        unsafe { retry_eintr!(raw::g_fmt(self.fd(), &mut format)) }?;
        Ok(unsafe { format.fmt.pix_mp })
    }

    pub(crate) fn s_fmt(&self, format: &mut raw::Format) -> Result<(), Errno> {
        unsafe { retry_eintr!(raw::s_fmt(self.fd(), format)) }.map(drop)
    }

    pub(crate) fn reqbufs(&self, count: u32, buf_type: BufType, memory: Memory) -> Result<u32> {
        let mut req: raw::RequestBuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = buf_type;
        req.memory = memory;
        unsafe { retry_eintr!(raw::reqbufs(self.fd(), &mut req)) }.map_err(|e| {
            log::error!("VIDIOC_REQBUFS failed: {}", e);
            Error::from(e)
        })?;
        Ok(req.count)
    }

    pub(crate) fn querybuf(&self, buffer: &mut raw::Buffer) -> Result<()> {
        unsafe { retry_eintr!(raw::querybuf(self.fd(), buffer)) }.map_err(|e| {
            log::error!("VIDIOC_QUERYBUF failed: {}", e);
            Error::from(e)
        })?;
        Ok(())
    }

    pub(crate) fn qbuf(&self, buffer: &mut raw::Buffer) -> Result<(), Errno> {
        unsafe { retry_eintr!(raw::qbuf(self.fd(), buffer)) }.map(drop)
    }

    pub(crate) fn dqbuf(&self, buffer: &mut raw::Buffer) -> Result<(), Errno> {
        unsafe { retry_eintr!(raw::dqbuf(self.fd(), buffer)) }.map(drop)
    }

    pub(crate) fn streamon(&self, buf_type: BufType) -> Result<()> {
        unsafe { retry_eintr!(raw::streamon(self.fd(), &buf_type)) }.map_err(|e| {
            log::error!("VIDIOC_STREAMON failed: {}", e);
            Error::from(e)
        })?;
        Ok(())
    }

    pub(crate) fn streamoff(&self, buf_type: BufType) -> Result<()> {
        unsafe { retry_eintr!(raw::streamoff(self.fd(), &buf_type)) }.map_err(|e| {
            log::error!("VIDIOC_STREAMOFF failed: {}", e);
            Error::from(e)
        })?;
        Ok(())
    }

    pub(crate) fn g_selection_compose(&self, buf_type: BufType) -> Result<raw::Rect, Errno> {
        let mut selection: raw::Selection = unsafe { mem::zeroed() };
        selection.type_ = buf_type;
        selection.target = SelectionTarget::COMPOSE;
        unsafe { retry_eintr!(raw::g_selection(self.fd(), &mut selection)) }?;
        Ok(selection.r)
    }

    pub(crate) fn s_selection_crop(
        &self,
        buf_type: BufType,
        rect: raw::Rect,
    ) -> Result<raw::Rect, Errno> {
        let mut selection: raw::Selection = unsafe { mem::zeroed() };
        selection.type_ = buf_type;
        selection.target = SelectionTarget::CROP;
        selection.r = rect;
        unsafe { retry_eintr!(raw::s_selection(self.fd(), &mut selection)) }?;
        Ok(selection.r)
    }

    pub(crate) fn g_crop(&self, buf_type: BufType) -> Result<raw::Rect, Errno> {
        let mut crop: raw::Crop = unsafe { mem::zeroed() };
        crop.type_ = buf_type;
        unsafe { retry_eintr!(raw::g_crop(self.fd(), &mut crop)) }?;
        Ok(crop.c)
    }

    pub(crate) fn s_crop(&self, buf_type: BufType, rect: raw::Rect) -> Result<(), Errno> {
        let crop = raw::Crop {
            type_: buf_type,
            c: rect,
        };
        unsafe { retry_eintr!(raw::s_crop(self.fd(), &crop)) }.map(drop)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("fd", &self.fd())
            .field("device_type", &self.device_type)
            .finish()
    }
}

pub struct Capabilities(raw::Capabilities);

impl Capabilities {
    /// Returns the identifier of the V4L2 driver that provides this device.
    pub fn driver(&self) -> &str {
        byte_array_to_str(&self.0.driver)
    }

    /// Returns the card or device name.
    pub fn card(&self) -> &str {
        byte_array_to_str(&self.0.card)
    }

    /// Returns a description of where on the system the device is attached.
    pub fn bus_info(&self) -> &str {
        byte_array_to_str(&self.0.bus_info)
    }

    /// Returns all capabilities the underlying hardware device exposes.
    pub fn all_capabilities(&self) -> CapabilityFlags {
        self.0.capabilities
    }

    /// Returns the capabilities available through the currently opened device node.
    pub fn device_capabilities(&self) -> CapabilityFlags {
        if self.0.capabilities.contains(CapabilityFlags::DEVICE_CAPS) {
            self.0.device_caps
        } else {
            self.0.capabilities
        }
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("driver", &self.driver())
            .field("card", &self.card())
            .field("bus_info", &self.bus_info())
            .field("capabilities", &self.0.capabilities)
            .field("device_caps", &self.0.device_caps)
            .finish()
    }
}

/// Iterator over a queue's supported [`FormatDesc`]s.
pub struct FormatDescIter<'a> {
    device: &'a Device,
    buf_type: BufType,
    next_index: u32,
    finished: bool,
}

impl Iterator for FormatDescIter<'_> {
    type Item = Result<FormatDesc>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        unsafe {
            let mut desc = raw::FmtDesc {
                index: self.next_index,
                type_: self.buf_type,
                mbus_code: 0,
                ..mem::zeroed()
            };
            match retry_eintr!(raw::enum_fmt(self.device.fd(), &mut desc)) {
                Ok(_) => {}
                Err(e) => {
                    self.finished = true;
                    match e {
                        Errno::EINVAL => return None,
                        e => return Some(Err(e.into())),
                    }
                }
            }

            self.next_index += 1;

            Some(Ok(FormatDesc(desc)))
        }
    }
}

pub struct FormatDesc(raw::FmtDesc);

impl FormatDesc {
    pub fn flags(&self) -> FmtFlags {
        self.0.flags
    }

    pub fn description(&self) -> &str {
        byte_array_to_str(&self.0.description)
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.0.pixel_format
    }
}

impl fmt::Debug for FormatDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Format")
            .field("index", &self.0.index)
            .field("type", &self.0.type_)
            .field("flags", &self.0.flags)
            .field("description", &self.description())
            .field("pixel_format", &self.0.pixel_format)
            .finish()
    }
}

/// Turns a zero-padded byte array containing UTF-8 or ASCII data into a `&str`.
fn byte_array_to_str(bytes: &[u8]) -> &str {
    let len = bytes
        .iter()
        .position(|b| *b == 0)
        .expect("missing NUL terminator");
    std::str::from_utf8(&bytes[..len]).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_tables() {
        assert_eq!(DeviceType::Decoder.candidate_paths(), ["/dev/video10"]);
        assert_eq!(DeviceType::Encoder.candidate_paths(), ["/dev/video11"]);
        assert_eq!(
            DeviceType::ImageProcessor.candidate_paths(),
            ["/dev/video12"]
        );
        assert_eq!(DeviceType::JpegDecoder.candidate_paths(), ["/dev/jpeg-dec"]);
    }

    #[test]
    fn probe_sides() {
        // Decoders advertise their coded formats on the INPUT (OUTPUT_MPLANE)
        // side, encoders on the OUTPUT (CAPTURE_MPLANE) side.
        assert_eq!(
            DeviceType::Decoder.probe_buf_type(),
            BufType::VIDEO_OUTPUT_MPLANE
        );
        assert_eq!(
            DeviceType::Encoder.probe_buf_type(),
            BufType::VIDEO_CAPTURE_MPLANE
        );
    }

    #[test]
    fn preferred_encoder_inputs() {
        assert_eq!(
            DeviceType::Encoder.preferred_input_formats(),
            [PixelFormat::YU12, PixelFormat::NM12, PixelFormat::NV12]
        );
        assert!(DeviceType::Decoder.preferred_input_formats().is_empty());
    }

    #[test]
    fn backend_default() {
        // Only meaningful when the variable is unset, which is the common
        // test environment.
        if std::env::var("USE_CODEC_INSTANCE").is_err() {
            assert_eq!(active_backend(), CodecBackend::V4l2);
        }
    }
}
