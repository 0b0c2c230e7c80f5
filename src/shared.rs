//! FFI-compatible types that may also be exposed to Rust code.

use bitflags::bitflags;

ffi_enum! {
    pub enum Colorspace: u32 {
        DEFAULT        = 0,
        SMPTE170M      = 1,
        SMPTE240M      = 2,
        REC709         = 3,
        BT878          = 4,
        _470_SYSTEM_M  = 5,
        _470_SYSTEM_BG = 6,
        JPEG           = 7,
        SRGB           = 8,
        OPRGB          = 9,
        BT2020         = 10,
        RAW            = 11,
        DCI_P3         = 12,
    }
}

ffi_enum! {
    pub enum Field: u32 {
        /// Lets the driver choose.
        ANY           = 0,
        /// Don't use fields.
        NONE          = 1,
        TOP           = 2,
        BOTTOM        = 3,
        INTERLACED    = 4,
        SEQ_TB        = 5,
        SEQ_BT        = 6,
        ALTERNATE     = 7,
        INTERLACED_TB = 8,
        INTERLACED_BT = 9,
    }
}

ffi_enum! {
    pub enum CtrlType: u32 {
        INTEGER      = 1,
        BOOLEAN      = 2,
        MENU         = 3,
        BUTTON       = 4,
        INTEGER64    = 5,
        CTRL_CLASS   = 6,
        STRING       = 7,
        BITMASK      = 8,
        INTEGER_MENU = 9,

        U8           = 0x0100,
        U16          = 0x0101,
        U32          = 0x0102,
        AREA         = 0x0106,
    }
}

ffi_enum! {
    pub enum Memory: u32 {
        MMAP    = 1,
        USERPTR = 2,
        OVERLAY = 3,
        DMABUF  = 4,
    }
}

ffi_enum! {
    /// `v4l2_frmsizetypes`
    pub enum FrmSizeType: u32 {
        DISCRETE   = 1,
        CONTINUOUS = 2,
        STEPWISE   = 3,
    }
}

ffi_enum! {
    /// Selection rectangle targets for `VIDIOC_G/S_SELECTION`.
    pub enum SelectionTarget: u32 {
        CROP           = 0x0000,
        CROP_DEFAULT   = 0x0001,
        CROP_BOUNDS    = 0x0002,
        NATIVE_SIZE    = 0x0003,
        COMPOSE        = 0x0100,
        COMPOSE_DEFAULT = 0x0101,
        COMPOSE_BOUNDS = 0x0102,
        COMPOSE_PADDED = 0x0103,
    }
}

ffi_enum! {
    /// Event types deliverable through `VIDIOC_DQEVENT`.
    pub enum EventType: u32 {
        ALL           = 0,
        VSYNC         = 1,
        EOS           = 2,
        CTRL          = 3,
        FRAME_SYNC    = 4,
        SOURCE_CHANGE = 5,
        MOTION_DET    = 6,
    }
}

/// `V4L2_EVENT_SRC_CH_RESOLUTION`: the source resolution or format changed.
pub const EVENT_SRC_CH_RESOLUTION: u32 = 0x0001;

ffi_enum! {
    /// `v4l2_decoder_cmd` commands.
    pub enum DecCmd: u32 {
        START  = 0,
        STOP   = 1,
        PAUSE  = 2,
        RESUME = 3,
    }
}

ffi_enum! {
    /// `v4l2_encoder_cmd` commands.
    pub enum EncCmd: u32 {
        START  = 0,
        STOP   = 1,
        PAUSE  = 2,
        RESUME = 3,
    }
}

bitflags! {
    #[repr(transparent)]
    pub struct CtrlFlags: u32 {
        const DISABLED         = 0x0001;
        const GRABBED          = 0x0002;
        const READ_ONLY        = 0x0004;
        const UPDATE           = 0x0008;
        const INACTIVE         = 0x0010;
        const SLIDER           = 0x0020;
        const WRITE_ONLY       = 0x0040;
        const VOLATILE         = 0x0080;
        const HAS_PAYLOAD      = 0x0100;
        const EXECUTE_ON_WRITE = 0x0200;
        const MODIFY_LAYOUT    = 0x0400;

        const NEXT_CTRL        = 0x80000000;
    }
}

bitflags! {
    #[repr(transparent)]
    pub struct FmtFlags: u32 {
        /// This is a compressed format.
        const COMPRESSED             = 0x0001;
        /// This format is not native to the device but emulated through software.
        const EMULATED               = 0x0002;
        /// The stream does not require framing by the application. Valid for
        /// stateful decoders only.
        const CONTINUOUS_BYTESTREAM  = 0x0004;
        /// Dynamic resolution switching is supported by the device for this
        /// compressed bytestream format. The driver will emit
        /// `V4L2_EVENT_SOURCE_CHANGE` when it detects new video parameters.
        const DYN_RESOLUTION         = 0x0008;
        /// The CAPTURE coded frame interval can be set separately from the
        /// OUTPUT raw frame interval. Valid for stateful encoders only.
        const ENC_CAP_FRAME_INTERVAL = 0x0010;
        const CSC_COLORSPACE         = 0x0020;
        const CSC_XFER_FUNC          = 0x0040;
        const CSC_YCBCR_ENC          = 0x0080;
        const CSC_QUANTIZATION       = 0x0100;
    }
}

bitflags! {
    /// Device capabilities.
    #[repr(transparent)]
    pub struct CapabilityFlags: u32 {
        /// The device supports the single-planar API through the Video Capture interface.
        const VIDEO_CAPTURE        = 0x00000001;
        /// The device supports the single-planar API through the Video Output interface.
        const VIDEO_OUTPUT         = 0x00000002;
        const VIDEO_OVERLAY        = 0x00000004;
        const VBI_CAPTURE          = 0x00000010;
        const VBI_OUTPUT           = 0x00000020;
        const SLICED_VBI_CAPTURE   = 0x00000040;
        const SLICED_VBI_OUTPUT    = 0x00000080;
        const RDS_CAPTURE          = 0x00000100;
        const VIDEO_OUTPUT_OVERLAY = 0x00000200;
        const HW_FREQ_SEEK         = 0x00000400;
        const RDS_OUTPUT           = 0x00000800;

        /// The device supports the multi-planar API through the Video Capture interface.
        const VIDEO_CAPTURE_MPLANE = 0x00001000;
        /// The device supports the multi-planar API through the Video Output interface.
        const VIDEO_OUTPUT_MPLANE  = 0x00002000;
        /// The device supports the multi-planar API through the Video
        /// Memory-To-Memory interface. Every codec accelerator this crate
        /// drives must advertise this.
        const VIDEO_M2M_MPLANE     = 0x00004000;
        /// The device supports the single-planar API through the Video
        /// Memory-To-Memory interface.
        const VIDEO_M2M            = 0x00008000;

        const TUNER                = 0x00010000;
        const AUDIO                = 0x00020000;
        const RADIO                = 0x00040000;
        const MODULATOR            = 0x00080000;

        const SDR_CAPTURE          = 0x00100000;
        /// The device supports the struct v4l2_pix_format extended fields.
        const EXT_PIX_FORMAT       = 0x00200000;
        const SDR_OUTPUT           = 0x00400000;
        const META_CAPTURE         = 0x00800000;

        /// The device supports the `read()` and/or `write()` I/O methods.
        const READWRITE            = 0x01000000;
        const ASYNCIO              = 0x02000000;
        /// The device supports (some of) the streaming I/O methods.
        const STREAMING            = 0x04000000;
        const META_OUTPUT          = 0x08000000;

        const TOUCH                = 0x10000000;
        const IO_MC                = 0x20000000;
        /// The driver fills the device_caps field.
        const DEVICE_CAPS          = 0x80000000;
    }
}

bitflags! {
    #[repr(transparent)]
    pub struct BufCap: u32 {
        const SUPPORTS_MMAP                 = 1 << 0;
        const SUPPORTS_USERPTR              = 1 << 1;
        const SUPPORTS_DMABUF               = 1 << 2;
        const SUPPORTS_REQUESTS             = 1 << 3;
        const SUPPORTS_ORPHANED_BUFS        = 1 << 4;
        const SUPPORTS_M2M_HOLD_CAPTURE_BUF = 1 << 5;
        const SUPPORTS_MMAP_CACHE_HINTS     = 1 << 6;
    }
}

bitflags! {
    #[repr(transparent)]
    pub struct BufFlag: u32 {
        const MAPPED               = 0x00000001;
        const QUEUED               = 0x00000002;
        const DONE                 = 0x00000004;
        /// The buffer carries a keyframe (encoder output only).
        const KEYFRAME             = 0x00000008;
        const PFRAME               = 0x00000010;
        const BFRAME               = 0x00000020;
        const ERROR                = 0x00000040;
        const IN_REQUEST           = 0x00000080;
        const TIMECODE             = 0x00000100;
        const M2M_HOLD_CAPTURE_BUF = 0x00000200;
        const PREPARED             = 0x00000400;
        const NO_CACHE_INVALIDATE  = 0x00000800;
        const NO_CACHE_CLEAN       = 0x00001000;
        const TIMESTAMP_MASK       = 0x0000e000;
        const TIMESTAMP_UNKNOWN    = 0x00000000;
        const TIMESTAMP_MONOTONIC  = 0x00002000;
        const TIMESTAMP_COPY       = 0x00004000;
        const TIMESTAMP_SRC_MASK   = 0x00070000;
        const TIMESTAMP_SRC_EOF    = 0x00000000;
        const TIMESTAMP_SRC_SOE    = 0x00010000;
        /// The driver marks the final buffer of a flushed or drained stream.
        const LAST                 = 0x00100000;
        const REQUEST_FD           = 0x00800000;
    }
}

bitflags! {
    #[repr(transparent)]
    pub struct TimecodeFlags: u32 {
        const DROPFRAME            = 0x0001;
        const COLORFRAME           = 0x0002;
        const USERBITS_MASK        = 0x000C;
        const USERBITS_USERDEFINED = 0x0000;
        const USERBITS_8BITCHARS   = 0x0008;
    }
}
