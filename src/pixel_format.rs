use std::fmt;

/// Four character code (fourcc) defining the encoding of pixel data in an image buffer.
///
/// fourcc codes are documented on <https://www.fourcc.org/>.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PixelFormat(u32);

impl PixelFormat {
    /// The zero value; no format. Drivers never report this.
    pub const NONE: Self = Self(0);

    /// Creates a [`PixelFormat`] from a *fourcc* code.
    pub const fn from_fourcc(fourcc: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(fourcc))
    }

    /// Returns the *fourcc* code represented by `self`.
    pub const fn as_fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

// Just a shorthand for `PixelFormat::from_fourcc`.
const fn f(fourcc: &[u8; 4]) -> PixelFormat {
    PixelFormat::from_fourcc(*fourcc)
}

/// Uncompressed format constants.
impl PixelFormat {
    /// 32-bit BGRA, alpha in the most significant byte (`V4L2_PIX_FMT_ABGR32`).
    pub const AR24: Self = f(b"AR24");

    /// 32-bit RGBA (`V4L2_PIX_FMT_RGBA32`).
    pub const AB24: Self = f(b"AB24");

    /// 32-bit BGRX; the high byte is ignored (`V4L2_PIX_FMT_XBGR32`).
    pub const XR24: Self = f(b"XR24");

    /// 32-bit RGBX (`V4L2_PIX_FMT_RGBX32`).
    pub const XB24: Self = f(b"XB24");

    /// Legacy 32-bit RGB; the meaning of the fourth channel depends on the
    /// driver (`V4L2_PIX_FMT_RGB32`).
    pub const RGB4: Self = f(b"RGB4");

    /// Planar YUV 4:2:0, Y/Cb/Cr in a single buffer (`V4L2_PIX_FMT_YUV420`).
    pub const YU12: Self = f(b"YU12");

    /// Planar YVU 4:2:0, Cr before Cb (`V4L2_PIX_FMT_YVU420`).
    pub const YV12: Self = f(b"YV12");

    /// Planar YUV 4:2:0 spread over separate buffers (`V4L2_PIX_FMT_YUV420M`).
    pub const YM12: Self = f(b"YM12");

    /// Planar YVU 4:2:0 spread over separate buffers (`V4L2_PIX_FMT_YVU420M`).
    pub const YM21: Self = f(b"YM21");

    /// Packed YUV 4:2:2, `Y0 Cb Y1 Cr` (`V4L2_PIX_FMT_YUYV`).
    pub const YUYV: Self = f(b"YUYV");

    /// Semi-planar YUV 4:2:0, interleaved CbCr plane (`V4L2_PIX_FMT_NV12`).
    pub const NV12: Self = f(b"NV12");

    /// Semi-planar YUV 4:2:0, interleaved CrCb plane (`V4L2_PIX_FMT_NV21`).
    pub const NV21: Self = f(b"NV21");

    /// `NV12` with the planes in separate buffers (`V4L2_PIX_FMT_NV12M`).
    pub const NM12: Self = f(b"NM12");

    /// `NV21` with the planes in separate buffers (`V4L2_PIX_FMT_NV21M`).
    pub const NM21: Self = f(b"NM21");

    /// Planar YUV 4:2:2 in separate buffers (`V4L2_PIX_FMT_YUV422M`).
    pub const YM16: Self = f(b"YM16");

    /// MediaTek block mode, compressed (`V4L2_PIX_FMT_MT21C`).
    pub const MT21: Self = f(b"MT21");

    /// MediaTek block mode, uncompressed (`V4L2_PIX_FMT_MM21`).
    pub const MM21: Self = f(b"MM21");

    /// Semi-planar 4:2:0 with 10 bits per component (`V4L2_PIX_FMT_P010`).
    pub const P010: Self = f(b"P010");
}

/// Compressed format constants.
impl PixelFormat {
    /// H.264 Annex B byte stream (`V4L2_PIX_FMT_H264`).
    pub const H264: Self = f(b"H264");

    /// VP8 frames (`V4L2_PIX_FMT_VP8`).
    pub const VP8: Self = f(b"VP80");

    /// VP9 frames (`V4L2_PIX_FMT_VP9`).
    pub const VP9: Self = f(b"VP90");
}

impl PixelFormat {
    /// Maps a recognized raw fourcc to a catalog entry, or [`Self::NONE`].
    pub fn from_v4l2_pix_fmt(raw: u32) -> PixelFormat {
        let fmt = PixelFormat(raw);
        match fmt {
            Self::AR24 | Self::AB24 | Self::XR24 | Self::XB24 | Self::RGB4 | Self::YU12
            | Self::YV12 | Self::YM12 | Self::YM21 | Self::YUYV | Self::NV12 | Self::NV21
            | Self::NM12 | Self::NM21 | Self::YM16 | Self::MT21 | Self::MM21 | Self::P010 => fmt,
            _ => {
                log::debug!("unmapped fourcc: {}", fmt);
                Self::NONE
            }
        }
    }

    /// Whether each color plane lives in its own V4L2 buffer plane.
    pub fn is_multi_planar(self) -> bool {
        matches!(
            self,
            Self::YM12 | Self::YM21 | Self::NM12 | Self::NM21 | Self::YM16 | Self::MT21 | Self::MM21
        )
    }

    /// The single-planar layout carrying the same pixels, if one exists.
    pub fn to_single_planar(self) -> Option<PixelFormat> {
        match self {
            Self::AR24 | Self::AB24 | Self::XR24 | Self::XB24 | Self::RGB4 | Self::YU12
            | Self::YV12 | Self::YUYV | Self::NV12 | Self::NV21 | Self::P010 => Some(self),
            Self::YM12 => Some(Self::YU12),
            Self::YM21 => Some(Self::YV12),
            Self::NM12 => Some(Self::NV12),
            Self::NM21 => Some(Self::NV21),
            _ => None,
        }
    }

    /// How many V4L2 buffer planes a buffer of this format occupies.
    ///
    /// Multi-planar layouts use one buffer plane per color plane; everything
    /// else (including the compressed formats) packs into a single plane.
    pub fn num_buffer_planes(self) -> usize {
        if self.is_multi_planar() {
            self.to_video_pixel_format().num_planes()
        } else {
            1
        }
    }

    pub fn to_video_pixel_format(self) -> VideoPixelFormat {
        match self {
            Self::AR24 => VideoPixelFormat::Argb,
            Self::AB24 => VideoPixelFormat::Abgr,
            Self::XR24 => VideoPixelFormat::Xrgb,
            Self::XB24 => VideoPixelFormat::Xbgr,
            Self::RGB4 => VideoPixelFormat::Bgra,
            Self::YU12 | Self::YM12 => VideoPixelFormat::I420,
            Self::YV12 | Self::YM21 => VideoPixelFormat::Yv12,
            Self::YUYV => VideoPixelFormat::Yuy2,
            Self::NV12 | Self::NM12 | Self::MT21 | Self::MM21 => VideoPixelFormat::Nv12,
            Self::NV21 | Self::NM21 => VideoPixelFormat::Nv21,
            Self::YM16 => VideoPixelFormat::I422,
            Self::P010 => VideoPixelFormat::P016le,
            _ => VideoPixelFormat::Unknown,
        }
    }

    /// Picks the fourcc for a [`VideoPixelFormat`] in the requested plane layout.
    pub fn from_video_pixel_format(
        format: VideoPixelFormat,
        single_planar: bool,
    ) -> Option<PixelFormat> {
        if single_planar {
            match format {
                VideoPixelFormat::Argb => Some(Self::AR24),
                VideoPixelFormat::Abgr => Some(Self::AB24),
                VideoPixelFormat::Xrgb => Some(Self::XR24),
                VideoPixelFormat::Xbgr => Some(Self::XB24),
                VideoPixelFormat::Bgra => Some(Self::RGB4),
                VideoPixelFormat::I420 => Some(Self::YU12),
                VideoPixelFormat::Yv12 => Some(Self::YV12),
                VideoPixelFormat::Yuy2 => Some(Self::YUYV),
                VideoPixelFormat::Nv12 => Some(Self::NV12),
                VideoPixelFormat::Nv21 => Some(Self::NV21),
                VideoPixelFormat::P016le => Some(Self::P010),
                _ => None,
            }
        } else {
            match format {
                VideoPixelFormat::I420 => Some(Self::YM12),
                VideoPixelFormat::Yv12 => Some(Self::YM21),
                VideoPixelFormat::Nv12 => Some(Self::NM12),
                VideoPixelFormat::Nv21 => Some(Self::NM21),
                VideoPixelFormat::I422 => Some(Self::YM16),
                _ => None,
            }
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0.to_le_bytes();
        let [a, b, c, d] = [a as char, b as char, c as char, d as char];
        write!(f, "{}{}{}{}", a, b, c, d)
    }
}

impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// Frame memory layouts the engines and their clients exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoPixelFormat {
    Unknown,
    I420,
    Yv12,
    I422,
    Nv12,
    Nv21,
    Yuy2,
    Argb,
    Xrgb,
    Abgr,
    Xbgr,
    Bgra,
    P016le,
}

impl VideoPixelFormat {
    /// The number of color planes of the layout.
    pub fn num_planes(self) -> usize {
        match self {
            Self::I420 | Self::Yv12 | Self::I422 => 3,
            Self::Nv12 | Self::Nv21 | Self::P016le => 2,
            Self::Yuy2 | Self::Argb | Self::Xrgb | Self::Abgr | Self::Xbgr | Self::Bgra => 1,
            Self::Unknown => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &[PixelFormat] = &[
        PixelFormat::AR24,
        PixelFormat::AB24,
        PixelFormat::XR24,
        PixelFormat::XB24,
        PixelFormat::RGB4,
        PixelFormat::YU12,
        PixelFormat::YV12,
        PixelFormat::YM12,
        PixelFormat::YM21,
        PixelFormat::YUYV,
        PixelFormat::NV12,
        PixelFormat::NV21,
        PixelFormat::NM12,
        PixelFormat::NM21,
        PixelFormat::YM16,
        PixelFormat::MT21,
        PixelFormat::MM21,
        PixelFormat::P010,
    ];

    #[test]
    fn fourcc_packing() {
        assert_eq!(PixelFormat::NV12.to_string(), "NV12");
        assert_eq!(PixelFormat::VP8.to_string(), "VP80");
        let [a, b, c, d] = PixelFormat::H264.as_fourcc();
        assert_eq!(
            PixelFormat::H264.as_u32(),
            a as u32 | (b as u32) << 8 | (c as u32) << 16 | (d as u32) << 24
        );
    }

    #[test]
    fn raw_round_trip() {
        for &fmt in CATALOG {
            assert_eq!(PixelFormat::from_v4l2_pix_fmt(fmt.as_u32()), fmt);
        }
        assert_eq!(
            PixelFormat::from_v4l2_pix_fmt(PixelFormat::from_fourcc(*b"ZZZZ").as_u32()),
            PixelFormat::NONE
        );
    }

    #[test]
    fn video_pixel_format_round_trip() {
        for &fmt in CATALOG {
            let video = fmt.to_video_pixel_format();
            // MT21/MM21 and the legacy duplicates fold onto a canonical
            // fourcc; everything else maps back to itself.
            if let Some(back) = PixelFormat::from_video_pixel_format(video, !fmt.is_multi_planar())
            {
                assert_eq!(back.to_video_pixel_format(), video);
            }
        }

        assert_eq!(
            PixelFormat::from_video_pixel_format(VideoPixelFormat::I420, true),
            Some(PixelFormat::YU12)
        );
        assert_eq!(
            PixelFormat::from_video_pixel_format(VideoPixelFormat::I420, false),
            Some(PixelFormat::YM12)
        );
        assert_eq!(
            PixelFormat::from_video_pixel_format(VideoPixelFormat::Yuy2, false),
            None
        );
    }

    #[test]
    fn single_planar_folding() {
        assert_eq!(PixelFormat::NM12.to_single_planar(), Some(PixelFormat::NV12));
        assert_eq!(PixelFormat::YM21.to_single_planar(), Some(PixelFormat::YV12));
        assert_eq!(PixelFormat::NV12.to_single_planar(), Some(PixelFormat::NV12));
        assert_eq!(PixelFormat::MT21.to_single_planar(), None);
    }

    #[test]
    fn plane_counts() {
        assert_eq!(VideoPixelFormat::I420.num_planes(), 3);
        assert_eq!(VideoPixelFormat::Nv12.num_planes(), 2);
        assert_eq!(VideoPixelFormat::Yuy2.num_planes(), 1);
    }
}
