//! Codec and profile identifiers, and their V4L2 translations.

use crate::geometry::Size;
use crate::raw::controls::{H264Level, H264Profile};
use crate::PixelFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    Vp8,
    Vp9,
}

/// Codec profiles negotiable with a driver.
///
/// The numbering matches the cross-process protocol the client speaks, so it
/// must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum VideoCodecProfile {
    H264Baseline = 0,
    H264Main = 1,
    H264Extended = 2,
    H264High = 3,
    H264High10 = 4,
    H264High422 = 5,
    H264High444Predictive = 6,
    H264ScalableBaseline = 7,
    H264ScalableHigh = 8,
    H264StereoHigh = 9,
    H264MultiviewHigh = 10,
    Vp8Any = 11,
    Vp9Profile0 = 12,
    Vp9Profile1 = 13,
    Vp9Profile2 = 14,
    Vp9Profile3 = 15,
}

impl VideoCodecProfile {
    pub fn codec(self) -> VideoCodec {
        use VideoCodecProfile::*;
        match self {
            H264Baseline | H264Main | H264Extended | H264High | H264High10 | H264High422
            | H264High444Predictive | H264ScalableBaseline | H264ScalableHigh | H264StereoHigh
            | H264MultiviewHigh => VideoCodec::H264,
            Vp8Any => VideoCodec::Vp8,
            Vp9Profile0 | Vp9Profile1 | Vp9Profile2 | Vp9Profile3 => VideoCodec::Vp9,
        }
    }

    /// The compressed-bitstream fourcc a device must support to handle this
    /// profile.
    pub fn to_v4l2_pix_fmt(self) -> PixelFormat {
        match self.codec() {
            VideoCodec::H264 => PixelFormat::H264,
            VideoCodec::Vp8 => PixelFormat::VP8,
            VideoCodec::Vp9 => PixelFormat::VP9,
        }
    }

    /// The `MPEG_VIDEO_H264_PROFILE` menu value selecting this profile, if it
    /// has one.
    pub fn to_v4l2_h264_profile(self) -> Option<H264Profile> {
        use VideoCodecProfile::*;
        match self {
            H264Baseline => Some(H264Profile::BASELINE),
            H264Main => Some(H264Profile::MAIN),
            H264Extended => Some(H264Profile::EXTENDED),
            H264High => Some(H264Profile::HIGH),
            H264High10 => Some(H264Profile::HIGH_10),
            H264High422 => Some(H264Profile::HIGH_422),
            H264High444Predictive => Some(H264Profile::HIGH_444_PREDICTIVE),
            H264ScalableBaseline => Some(H264Profile::SCALABLE_BASELINE),
            H264ScalableHigh => Some(H264Profile::SCALABLE_HIGH),
            H264StereoHigh => Some(H264Profile::STEREO_HIGH),
            H264MultiviewHigh => Some(H264Profile::MULTIVIEW_HIGH),
            _ => None,
        }
    }

    /// Maps a driver-reported profile menu index back to a profile.
    pub fn from_v4l2_menu_index(codec: VideoCodec, index: i32) -> Option<VideoCodecProfile> {
        use VideoCodecProfile::*;
        match codec {
            VideoCodec::H264 => match H264Profile(index) {
                H264Profile::BASELINE | H264Profile::CONSTRAINED_BASELINE => Some(H264Baseline),
                H264Profile::MAIN => Some(H264Main),
                H264Profile::EXTENDED => Some(H264Extended),
                H264Profile::HIGH => Some(H264High),
                H264Profile::STEREO_HIGH => Some(H264StereoHigh),
                H264Profile::MULTIVIEW_HIGH => Some(H264MultiviewHigh),
                _ => None,
            },
            VideoCodec::Vp8 => (0..=3).contains(&index).then_some(Vp8Any),
            VideoCodec::Vp9 => match index {
                0 => Some(Vp9Profile0),
                1 => Some(Vp9Profile1),
                2 => Some(Vp9Profile2),
                3 => Some(Vp9Profile3),
                _ => None,
            },
        }
    }
}

/// Maps an H.264 `level_idc` to the `MPEG_VIDEO_H264_LEVEL` menu value.
pub fn h264_level_idc_to_v4l2_level(level_idc: u8) -> Option<H264Level> {
    match level_idc {
        9 => Some(H264Level::L1B),
        10 => Some(H264Level::L1_0),
        11 => Some(H264Level::L1_1),
        12 => Some(H264Level::L1_2),
        13 => Some(H264Level::L1_3),
        20 => Some(H264Level::L2_0),
        21 => Some(H264Level::L2_1),
        22 => Some(H264Level::L2_2),
        30 => Some(H264Level::L3_0),
        31 => Some(H264Level::L3_1),
        32 => Some(H264Level::L3_2),
        40 => Some(H264Level::L4_0),
        41 => Some(H264Level::L4_1),
        42 => Some(H264Level::L4_2),
        50 => Some(H264Level::L5_0),
        51 => Some(H264Level::L5_1),
        _ => None,
    }
}

/// A codec profile a device supports, with its resolution range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedProfile {
    pub profile: VideoCodecProfile,
    pub min_resolution: Size,
    pub max_resolution: Size,
    pub encrypted_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_to_pix_fmt() {
        assert_eq!(
            VideoCodecProfile::H264High.to_v4l2_pix_fmt(),
            PixelFormat::H264
        );
        assert_eq!(VideoCodecProfile::Vp8Any.to_v4l2_pix_fmt(), PixelFormat::VP8);
        assert_eq!(
            VideoCodecProfile::Vp9Profile2.to_v4l2_pix_fmt(),
            PixelFormat::VP9
        );
    }

    #[test]
    fn h264_menu_values() {
        assert_eq!(
            VideoCodecProfile::H264Baseline.to_v4l2_h264_profile(),
            Some(H264Profile::BASELINE)
        );
        assert_eq!(
            VideoCodecProfile::H264High.to_v4l2_h264_profile(),
            Some(H264Profile::HIGH)
        );
        assert_eq!(VideoCodecProfile::Vp8Any.to_v4l2_h264_profile(), None);

        // Constrained baseline folds onto baseline when enumerating.
        assert_eq!(
            VideoCodecProfile::from_v4l2_menu_index(VideoCodec::H264, 1),
            Some(VideoCodecProfile::H264Baseline)
        );
    }

    #[test]
    fn level_idc_mapping() {
        assert_eq!(h264_level_idc_to_v4l2_level(10), Some(H264Level::L1_0));
        assert_eq!(h264_level_idc_to_v4l2_level(9), Some(H264Level::L1B));
        assert_eq!(h264_level_idc_to_v4l2_level(51), Some(H264Level::L5_1));
        assert_eq!(h264_level_idc_to_v4l2_level(52), None);
    }
}
