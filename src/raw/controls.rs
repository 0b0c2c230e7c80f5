ffi_enum! {
    pub enum CtrlClass: u32 {
        USER            = 0x00980000,
        CODEC           = 0x00990000,
        CAMERA          = 0x009a0000,
        FM_TX           = 0x009b0000,
        FLASH           = 0x009c0000,
        JPEG            = 0x009d0000,
        IMAGE_SOURCE    = 0x009e0000,
        IMAGE_PROC      = 0x009f0000,
        DV              = 0x00a00000,
        FM_RX           = 0x00a10000,
        RF_TUNER        = 0x00a20000,
        DETECT          = 0x00a30000,
        CODEC_STATELESS = 0x00a40000,
    }
}

ffi_enum! {
    /// Identifies a device control.
    ///
    /// Only the user-class and codec-class controls a memory-to-memory codec
    /// device exposes are named here; drivers can add their own
    /// driver-specific controls as well.
    pub enum Cid: u32 {
        /// User-class control base ID.
        BASE                            = CtrlClass::USER.0 | 0x900,
        /// The minimum number of CAPTURE buffers the decoder needs before it
        /// can produce output (the stream's DPB size).
        MIN_BUFFERS_FOR_CAPTURE         = Self::BASE.0 + 39,
        MIN_BUFFERS_FOR_OUTPUT          = Self::BASE.0 + 40,

        /// Codec-class (MPEG-class) control base ID.
        CODEC_BASE                      = CtrlClass::CODEC.0 | 0x900,
        MPEG_VIDEO_B_FRAMES             = Self::CODEC_BASE.0 + 202,
        MPEG_VIDEO_GOP_SIZE             = Self::CODEC_BASE.0 + 203,
        MPEG_VIDEO_BITRATE              = Self::CODEC_BASE.0 + 207,
        MPEG_VIDEO_HEADER_MODE          = Self::CODEC_BASE.0 + 215,
        MPEG_VIDEO_MB_RC_ENABLE         = Self::CODEC_BASE.0 + 217,
        MPEG_VIDEO_FORCE_KEY_FRAME      = Self::CODEC_BASE.0 + 229,

        MPEG_VIDEO_H264_MIN_QP          = Self::CODEC_BASE.0 + 353,
        MPEG_VIDEO_H264_MAX_QP          = Self::CODEC_BASE.0 + 354,
        MPEG_VIDEO_H264_8X8_TRANSFORM   = Self::CODEC_BASE.0 + 355,
        MPEG_VIDEO_H264_ENTROPY_MODE    = Self::CODEC_BASE.0 + 357,
        MPEG_VIDEO_H264_I_PERIOD        = Self::CODEC_BASE.0 + 358,
        MPEG_VIDEO_H264_LEVEL           = Self::CODEC_BASE.0 + 359,
        MPEG_VIDEO_H264_LOOP_FILTER_MODE = Self::CODEC_BASE.0 + 362,
        MPEG_VIDEO_H264_PROFILE         = Self::CODEC_BASE.0 + 363,

        MPEG_VIDEO_VPX_MIN_QP           = Self::CODEC_BASE.0 + 507,
        MPEG_VIDEO_VPX_MAX_QP           = Self::CODEC_BASE.0 + 508,
        MPEG_VIDEO_VP8_PROFILE          = Self::CODEC_BASE.0 + 511,
        MPEG_VIDEO_VP9_PROFILE          = Self::CODEC_BASE.0 + 512,
    }
}

impl Cid {
    /// The control class a control id belongs to.
    pub fn class(self) -> CtrlClass {
        CtrlClass(self.0 & 0x0fff0000)
    }
}

ffi_enum! {
    /// Menu values of `MPEG_VIDEO_H264_PROFILE`.
    pub enum H264Profile: i32 {
        BASELINE             = 0,
        CONSTRAINED_BASELINE = 1,
        MAIN                 = 2,
        EXTENDED             = 3,
        HIGH                 = 4,
        HIGH_10              = 5,
        HIGH_422             = 6,
        HIGH_444_PREDICTIVE  = 7,
        HIGH_10_INTRA        = 8,
        HIGH_422_INTRA       = 9,
        HIGH_444_INTRA       = 10,
        CAVLC_444_INTRA      = 11,
        SCALABLE_BASELINE    = 12,
        SCALABLE_HIGH        = 13,
        SCALABLE_HIGH_INTRA  = 14,
        STEREO_HIGH          = 15,
        MULTIVIEW_HIGH       = 16,
    }
}

ffi_enum! {
    /// Menu values of `MPEG_VIDEO_H264_LEVEL`.
    pub enum H264Level: i32 {
        L1_0 = 0,
        L1B  = 1,
        L1_1 = 2,
        L1_2 = 3,
        L1_3 = 4,
        L2_0 = 5,
        L2_1 = 6,
        L2_2 = 7,
        L3_0 = 8,
        L3_1 = 9,
        L3_2 = 10,
        L4_0 = 11,
        L4_1 = 12,
        L4_2 = 13,
        L5_0 = 14,
        L5_1 = 15,
    }
}

ffi_enum! {
    /// Menu values of `MPEG_VIDEO_HEADER_MODE`.
    pub enum HeaderMode: i32 {
        SEPARATE              = 0,
        JOINED_WITH_1ST_FRAME = 1,
    }
}

ffi_enum! {
    /// Menu values of `MPEG_VIDEO_H264_ENTROPY_MODE`.
    pub enum EntropyMode: i32 {
        CAVLC = 0,
        CABAC = 1,
    }
}

ffi_enum! {
    /// Menu values of `MPEG_VIDEO_H264_LOOP_FILTER_MODE`.
    pub enum LoopFilterMode: i32 {
        ENABLED                    = 0,
        DISABLED                   = 1,
        DISABLED_AT_SLICE_BOUNDARY = 2,
    }
}

ffi_enum! {
    /// Menu values of `MPEG_VIDEO_VP8_PROFILE`.
    pub enum Vp8Profile: i32 {
        PROFILE_0 = 0,
        PROFILE_1 = 1,
        PROFILE_2 = 2,
        PROFILE_3 = 3,
    }
}

ffi_enum! {
    /// Menu values of `MPEG_VIDEO_VP9_PROFILE`.
    pub enum Vp9Profile: i32 {
        PROFILE_0 = 0,
        PROFILE_1 = 1,
        PROFILE_2 = 2,
        PROFILE_3 = 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_class_ids() {
        // Spot-check against the values in v4l2-controls.h.
        assert_eq!(Cid::MPEG_VIDEO_BITRATE.0, 0x009909cf);
        assert_eq!(Cid::MPEG_VIDEO_GOP_SIZE.0, 0x009909cb);
        assert_eq!(Cid::MPEG_VIDEO_H264_PROFILE.0, 0x00990a6b);
        assert_eq!(Cid::MIN_BUFFERS_FOR_CAPTURE.0, 0x00980927);
        assert_eq!(Cid::MPEG_VIDEO_H264_PROFILE.class(), CtrlClass::CODEC);
        assert_eq!(Cid::MIN_BUFFERS_FOR_CAPTURE.class(), CtrlClass::USER);
    }
}
