//! Frame layout descriptions exchanged between the engines and their clients.

use std::ffi::c_void;
use std::os::unix::prelude::RawFd;
use std::ptr;

use nix::libc::timeval;
use nix::unistd;

use crate::geometry::Size;
use crate::pixel_format::VideoPixelFormat;
use crate::raw::{self, VIDEO_MAX_PLANES};
use crate::PixelFormat;

/// Layout of a single color plane inside a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorPlane {
    pub stride: i32,
    pub offset: usize,
    pub size: usize,
}

impl ColorPlane {
    pub fn new(stride: i32, offset: usize, size: usize) -> Self {
        Self {
            stride,
            offset,
            size,
        }
    }
}

/// Describes the memory layout of one video frame.
///
/// Frames flow in both directions: the engines derive one from each
/// negotiated format to describe driver-owned buffers (with the DMABUF fds
/// exported for them), and encoder clients hand in frames whose `data`
/// pointers address the raw pixels to submit.
pub struct VideoFrame {
    pub format: VideoPixelFormat,
    pub coded_size: Size,
    pub color_planes: Vec<ColorPlane>,
    /// One exported fd per color plane; duplicated entries where the buffer
    /// has fewer V4L2 planes than color planes. The receiver owns the fds.
    pub dmabuf_fds: Vec<RawFd>,
    pub is_multi_planar: bool,
    pub timestamp: timeval,
    /// Client-provided plane pointers for the userptr and copy paths. Unused
    /// entries are null.
    pub data: [*mut c_void; VIDEO_MAX_PLANES],
}

// The `data` pointers are owned by whichever side created the frame and stay
// valid for the frame's lifetime; the struct itself never dereferences them.
unsafe impl Send for VideoFrame {}
unsafe impl Sync for VideoFrame {}

impl VideoFrame {
    pub fn new(format: VideoPixelFormat, coded_size: Size) -> Self {
        Self {
            format,
            coded_size,
            color_planes: Vec::new(),
            dmabuf_fds: Vec::new(),
            is_multi_planar: false,
            timestamp: timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            data: [ptr::null_mut(); VIDEO_MAX_PLANES],
        }
    }

    /// Derives a frame layout from a negotiated multi-planar format.
    ///
    /// When the format packs several color planes into one buffer plane (the
    /// single-buffer `NV12`/`YU12`/`YV12` cases), the missing plane
    /// descriptors are computed from the luma stride.
    pub fn from_v4l2_format(pix_mp: &raw::PixFormatMplane) -> Option<VideoFrame> {
        let pix_fmt = PixelFormat::from_v4l2_pix_fmt(pix_mp.pixel_format.as_u32());
        let format = pix_fmt.to_video_pixel_format();
        if format == VideoPixelFormat::Unknown {
            log::error!("no frame layout for fourcc {}", pix_mp.pixel_format.as_u32());
            return None;
        }

        let coded_size = Size::new(pix_mp.width, pix_mp.height);
        let num_buffers = usize::from(pix_mp.num_planes);
        let num_color_planes = format.num_planes();
        if num_color_planes == 0 || num_buffers > num_color_planes {
            log::error!(
                "driver reported {} buffer planes for {:?} ({} color planes)",
                num_buffers,
                format,
                num_color_planes
            );
            return None;
        }

        let plane_fmts = pix_mp.plane_fmt;
        let mut frame = VideoFrame::new(format, coded_size);
        for plane_fmt in &plane_fmts[..num_buffers] {
            frame.color_planes.push(ColorPlane::new(
                plane_fmt.bytesperline as i32,
                0,
                plane_fmt.sizeimage as usize,
            ));
        }

        if num_color_planes > num_buffers {
            let y_stride = frame.color_planes[0].stride;
            let y_stride_abs = y_stride as usize;
            let height = pix_mp.height as usize;
            match pix_fmt {
                PixelFormat::NV12 => {
                    frame.color_planes.push(ColorPlane::new(
                        y_stride,
                        y_stride_abs * height,
                        y_stride_abs * height / 2,
                    ));
                }
                PixelFormat::YU12 | PixelFormat::YV12 => {
                    if y_stride % 2 != 0 || height % 2 != 0 {
                        log::error!(
                            "luma stride ({}) and height ({}) must be even",
                            y_stride,
                            height
                        );
                        return None;
                    }
                    let half_stride = y_stride / 2;
                    let plane_0_area = y_stride_abs * height;
                    let plane_1_area = plane_0_area / 4;
                    frame
                        .color_planes
                        .push(ColorPlane::new(half_stride, plane_0_area, plane_1_area));
                    frame.color_planes.push(ColorPlane::new(
                        half_stride,
                        plane_0_area + plane_1_area,
                        plane_1_area,
                    ));
                }
                _ => {
                    log::error!("cannot derive chroma planes for fourcc {}", pix_fmt);
                    return None;
                }
            }
        }

        frame.is_multi_planar = num_buffers != 1;
        Some(frame)
    }

    /// Extends `dmabuf_fds` by duplicating the last fd until there is one fd
    /// per color plane. A zero fd is propagated without duplication.
    pub(crate) fn dup_fds_to_plane_count(&mut self) -> bool {
        while self.dmabuf_fds.len() < self.color_planes.len() {
            let last = match self.dmabuf_fds.last() {
                Some(&fd) => fd,
                None => return false,
            };

            if last == 0 {
                self.dmabuf_fds.push(0);
                continue;
            }

            match retry_eintr!(unistd::dup(last)) {
                Ok(fd) => self.dmabuf_fds.push(fd),
                Err(e) => {
                    log::error!("failed duplicating dmabuf fd: {}", e);
                    return false;
                }
            }
        }

        true
    }
}

/// The size in bytes of plane `plane` at the given coded size.
pub fn plane_size(format: VideoPixelFormat, plane: usize, coded_size: Size) -> usize {
    let w = coded_size.width as usize;
    let h = coded_size.height as usize;
    match (format, plane) {
        (VideoPixelFormat::I420 | VideoPixelFormat::Yv12, 0) => w * h,
        (VideoPixelFormat::I420 | VideoPixelFormat::Yv12, 1 | 2) => (w / 2) * (h / 2),
        (VideoPixelFormat::I422, 0) => w * h,
        (VideoPixelFormat::I422, 1 | 2) => (w / 2) * h,
        (VideoPixelFormat::Nv12 | VideoPixelFormat::Nv21, 0) => w * h,
        (VideoPixelFormat::Nv12 | VideoPixelFormat::Nv21, 1) => w * (h / 2),
        (VideoPixelFormat::P016le, 0) => 2 * w * h,
        (VideoPixelFormat::P016le, 1) => 2 * w * (h / 2),
        (VideoPixelFormat::Yuy2, 0) => 2 * w * h,
        (
            VideoPixelFormat::Argb
            | VideoPixelFormat::Xrgb
            | VideoPixelFormat::Abgr
            | VideoPixelFormat::Xbgr
            | VideoPixelFormat::Bgra,
            0,
        ) => 4 * w * h,
        _ => 0,
    }
}

/// Total number of bytes a packed single-buffer frame occupies.
pub fn allocation_size(format: VideoPixelFormat, coded_size: Size) -> usize {
    (0..format.num_planes())
        .map(|plane| plane_size(format, plane, coded_size))
        .sum()
}

/// Bits one horizontal pixel occupies in plane `plane`.
fn plane_horizontal_bits_per_pixel(format: VideoPixelFormat, plane: usize) -> usize {
    match (format, plane) {
        (VideoPixelFormat::I420 | VideoPixelFormat::Yv12 | VideoPixelFormat::I422, 0) => 8,
        (VideoPixelFormat::I420 | VideoPixelFormat::Yv12 | VideoPixelFormat::I422, 1 | 2) => 4,
        (VideoPixelFormat::Nv12 | VideoPixelFormat::Nv21, 0) => 8,
        (VideoPixelFormat::Nv12 | VideoPixelFormat::Nv21, 1) => 8,
        (VideoPixelFormat::P016le, _) => 16,
        (VideoPixelFormat::Yuy2, 0) => 16,
        (
            VideoPixelFormat::Argb
            | VideoPixelFormat::Xrgb
            | VideoPixelFormat::Abgr
            | VideoPixelFormat::Xbgr
            | VideoPixelFormat::Bgra,
            0,
        ) => 32,
        _ => 0,
    }
}

/// Bits one full-image pixel contributes to plane `plane`.
fn plane_bits_per_pixel(format: VideoPixelFormat, plane: usize) -> usize {
    match (format, plane) {
        (VideoPixelFormat::I420 | VideoPixelFormat::Yv12, 0) => 8,
        (VideoPixelFormat::I420 | VideoPixelFormat::Yv12, 1 | 2) => 2,
        (VideoPixelFormat::I422, 0) => 8,
        (VideoPixelFormat::I422, 1 | 2) => 4,
        (VideoPixelFormat::Nv12 | VideoPixelFormat::Nv21, 0) => 8,
        (VideoPixelFormat::Nv12 | VideoPixelFormat::Nv21, 1) => 4,
        (VideoPixelFormat::P016le, 0) => 16,
        (VideoPixelFormat::P016le, 1) => 8,
        (VideoPixelFormat::Yuy2, 0) => 16,
        (
            VideoPixelFormat::Argb
            | VideoPixelFormat::Xrgb
            | VideoPixelFormat::Abgr
            | VideoPixelFormat::Xbgr
            | VideoPixelFormat::Bgra,
            0,
        ) => 32,
        _ => 0,
    }
}

/// Recovers the coded (allocated) size from an adjusted format.
///
/// The driver reports per-plane `bytesperline` and `sizeimage`; inverting the
/// bit arithmetic yields the actual buffer dimensions, which may exceed the
/// visible `width`/`height`.
pub fn coded_size_from_format(pix_mp: &raw::PixFormatMplane) -> Option<Size> {
    let pix_fmt = PixelFormat::from_v4l2_pix_fmt(pix_mp.pixel_format.as_u32());
    let format = pix_fmt.to_video_pixel_format();
    if format == VideoPixelFormat::Unknown {
        return None;
    }

    let plane_fmts = pix_mp.plane_fmt;
    let bytesperline = plane_fmts[0].bytesperline as usize;
    let sizeimage: usize = plane_fmts[..usize::from(pix_mp.num_planes)]
        .iter()
        .map(|p| p.sizeimage as usize)
        .sum();

    let horiz_bpp = plane_horizontal_bits_per_pixel(format, 0);
    let total_bpp: usize = (0..format.num_planes())
        .map(|plane| plane_bits_per_pixel(format, plane))
        .sum();

    if sizeimage == 0
        || bytesperline == 0
        || horiz_bpp == 0
        || total_bpp == 0
        || (bytesperline * 8) % horiz_bpp != 0
    {
        log::error!("cannot infer coded size from format");
        return None;
    }

    let coded_width = bytesperline * 8 / horiz_bpp;
    let coded_height = (sizeimage * 8 + coded_width * total_bpp - 1) / (coded_width * total_bpp);

    Some(Size::new(coded_width as u32, coded_height as u32))
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    fn mplane_format(fourcc: PixelFormat, width: u32, height: u32, planes: &[(u32, u32)]) -> raw::PixFormatMplane {
        let mut pix_mp: raw::PixFormatMplane = unsafe { mem::zeroed() };
        pix_mp.width = width;
        pix_mp.height = height;
        pix_mp.pixel_format = fourcc;
        pix_mp.num_planes = planes.len() as u8;
        for (i, &(bytesperline, sizeimage)) in planes.iter().enumerate() {
            pix_mp.plane_fmt[i].bytesperline = bytesperline;
            pix_mp.plane_fmt[i].sizeimage = sizeimage;
        }
        pix_mp
    }

    #[test]
    fn nv12_single_buffer_layout() {
        let pix_mp = mplane_format(PixelFormat::NV12, 1920, 1088, &[(1920, 1920 * 1088 * 3 / 2)]);
        let frame = VideoFrame::from_v4l2_format(&pix_mp).unwrap();
        assert_eq!(frame.format, VideoPixelFormat::Nv12);
        assert!(!frame.is_multi_planar);
        assert_eq!(frame.color_planes.len(), 2);
        assert_eq!(frame.color_planes[1].stride, 1920);
        assert_eq!(frame.color_planes[1].offset, 1920 * 1088);
        assert_eq!(frame.color_planes[1].size, 1920 * 1088 / 2);
    }

    #[test]
    fn yu12_single_buffer_layout() {
        let pix_mp = mplane_format(PixelFormat::YU12, 640, 480, &[(640, 640 * 480 * 3 / 2)]);
        let frame = VideoFrame::from_v4l2_format(&pix_mp).unwrap();
        assert_eq!(frame.color_planes.len(), 3);
        assert_eq!(frame.color_planes[1].stride, 320);
        assert_eq!(frame.color_planes[1].offset, 640 * 480);
        assert_eq!(frame.color_planes[2].offset, 640 * 480 + 640 * 480 / 4);
        assert_eq!(frame.color_planes[2].size, 640 * 480 / 4);
    }

    #[test]
    fn odd_stride_rejected() {
        let pix_mp = mplane_format(PixelFormat::YU12, 641, 480, &[(641, 641 * 480 * 2)]);
        assert!(VideoFrame::from_v4l2_format(&pix_mp).is_none());
    }

    #[test]
    fn multi_planar_passthrough() {
        let pix_mp = mplane_format(
            PixelFormat::NM12,
            1280,
            720,
            &[(1280, 1280 * 720), (1280, 1280 * 360)],
        );
        let frame = VideoFrame::from_v4l2_format(&pix_mp).unwrap();
        assert!(frame.is_multi_planar);
        assert_eq!(frame.color_planes.len(), 2);
        assert_eq!(frame.color_planes[1].size, 1280 * 360);
    }

    #[test]
    fn sizes() {
        let coded = Size::new(640, 480);
        assert_eq!(allocation_size(VideoPixelFormat::I420, coded), 640 * 480 * 3 / 2);
        assert_eq!(allocation_size(VideoPixelFormat::Nv12, coded), 640 * 480 * 3 / 2);
        assert_eq!(allocation_size(VideoPixelFormat::Yuy2, coded), 640 * 480 * 2);
        assert_eq!(plane_size(VideoPixelFormat::I420, 1, coded), 320 * 240);
        assert_eq!(plane_size(VideoPixelFormat::Nv12, 1, coded), 640 * 240);
    }

    #[test]
    fn coded_size_inversion() {
        let pix_mp = mplane_format(PixelFormat::NV12, 1916, 1080, &[(1920, 1920 * 1088 * 3 / 2)]);
        let coded = coded_size_from_format(&pix_mp).unwrap();
        assert_eq!(coded, Size::new(1920, 1088));
    }
}
