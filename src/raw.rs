//! FFI definitions compatible with `videodev2.h`.
//!
//! These types do not provide a "Rusty" API and should not be exposed as public APIs.

#![allow(bad_style)]

pub mod controls;

use std::ffi::c_void;
use std::os::raw::c_ulong;

use nix::libc::{timespec, timeval};
use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

use crate::buf_type::BufType;
use crate::{shared::*, PixelFormat};

pub const VIDEO_MAX_PLANES: usize = 8;

#[repr(C)]
#[derive(Debug)]
pub struct Capabilities {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: CapabilityFlags,
    pub device_caps: CapabilityFlags,
    reserved: [u32; 3],
}

#[repr(C)]
pub struct FmtDesc {
    /// Number of the format in the enumeration, set by the application.
    pub index: u32,
    /// Type of the data stream, set by the application.
    pub type_: BufType,
    pub flags: FmtFlags,
    /// Description of the format, a NUL-terminated ASCII string.
    pub description: [u8; 32],
    /// The image format identifier. This is a four character code as computed
    /// by the `v4l2_fourcc()` macro:
    ///
    /// `#define v4l2_fourcc(a,b,c,d) (((__u32)(a)<<0)|((__u32)(b)<<8)|((__u32)(c)<<16)|((__u32)(d)<<24))`
    pub pixel_format: PixelFormat,
    /// Media bus code restricting the enumerated formats, set by the
    /// application. Shall be 0 unless the driver advertises `V4L2_CAP_IO_MC`.
    pub mbus_code: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
pub struct Format {
    pub type_: BufType,
    pub fmt: FormatUnion,
}

#[repr(C)]
pub union FormatUnion {
    pub pix: PixFormat,
    pub pix_mp: PixFormatMplane,
    pub raw_data: [u8; 200],
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Fract {
    pub numerator: u32,
    pub denominator: u32,
}

/// `v4l2_pix_format`
#[derive(Clone, Copy)]
#[repr(C)]
pub struct PixFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub field: Field,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: Colorspace,
    pub priv_: u32,
    // Below fields are only valid if `priv_` equals `V4L2_PIX_FMT_PRIV_MAGIC`.
    pub flags: u32,
    pub enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct PlanePixFormat {
    pub sizeimage: u32,
    pub bytesperline: u32,
    pub reserved: [u16; 6],
}

/// `v4l2_pix_format_mplane`
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct PixFormatMplane {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub field: u32,
    pub colorspace: u32,
    pub plane_fmt: [PlanePixFormat; VIDEO_MAX_PLANES],
    pub num_planes: u8,
    pub flags: u8,
    pub enc: u8,
    pub quantization: u8,
    pub xfer_func: u8,
    pub reserved: [u8; 7],
}

#[repr(C)]
pub struct QueryCtrl {
    pub id: u32,
    pub type_: CtrlType,
    pub name: [u8; 32],
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: CtrlFlags,
    pub reserved: [u32; 2],
}

#[repr(C, packed)]
pub struct QueryMenu {
    pub id: u32,
    pub index: u32,
    pub name_or_value: QueryMenuUnion,
    pub reserved: u32,
}

#[repr(C)]
pub union QueryMenuUnion {
    pub name: [u8; 32],
    pub value: i64,
}

/// `v4l2_query_ext_ctrl`
#[repr(C)]
pub struct QueryExtCtrl {
    pub id: u32,
    pub type_: CtrlType,
    pub name: [u8; 32],
    pub minimum: i64,
    pub maximum: i64,
    pub step: u64,
    pub default_value: i64,
    pub flags: CtrlFlags,
    pub elem_size: u32,
    pub elems: u32,
    pub nr_of_dims: u32,
    pub dims: [u32; 4],
    pub reserved: [u32; 32],
}

/// `v4l2_ext_control`
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct ExtControl {
    pub id: u32,
    pub size: u32,
    pub reserved2: [u32; 1],
    pub value: ExtControlUnion,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub union ExtControlUnion {
    pub value: i32,
    pub value64: i64,
    pub ptr: *mut c_void,
}

/// `v4l2_ext_controls`
#[repr(C)]
pub struct ExtControls {
    pub ctrl_class: controls::CtrlClass,
    pub count: u32,
    pub error_idx: u32,
    pub reserved: [u32; 2],
    pub controls: *mut ExtControl,
}

#[derive(Debug)]
#[repr(C)]
pub struct RequestBuffers {
    pub count: u32,
    pub type_: BufType,
    pub memory: Memory,
    pub capabilities: BufCap,
    pub reserved: [u32; 1],
}

#[repr(C)]
pub struct Timecode {
    pub type_: u32,
    pub flags: TimecodeFlags,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
pub struct Buffer {
    pub index: u32,
    pub type_: BufType,
    pub bytesused: u32,
    pub flags: BufFlag,
    pub field: u32,
    pub timestamp: timeval,
    pub timecode: Timecode,
    pub sequence: u32,
    pub memory: Memory,
    pub m: BufferMemoryUnion,
    pub length: u32,
    pub reserved2: u32,
    pub tail: BufferTailUnion,
}

#[repr(C)]
pub union BufferMemoryUnion {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut Plane,
    pub fd: i32,
}

#[repr(C)]
pub union BufferTailUnion {
    pub request_fd: i32,
    pub reserved: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct Plane {
    pub bytesused: u32,
    pub length: u32,
    pub m: PlaneMemoryUnion,
    pub data_offset: u32,
    pub reserved: [u32; 11],
}

#[derive(Clone, Copy)]
#[repr(C)]
pub union PlaneMemoryUnion {
    pub mem_offset: u32,
    pub userptr: c_ulong,
    pub fd: i32,
}

/// `v4l2_exportbuffer`
#[repr(C)]
pub struct ExportBuffer {
    pub type_: BufType,
    pub index: u32,
    pub plane: u32,
    pub flags: u32,
    pub fd: i32,
    pub reserved: [u32; 11],
}

#[repr(C)]
pub struct FrmSizeEnum {
    pub index: u32,
    pub pixel_format: PixelFormat,
    pub type_: FrmSizeType,
    pub union: FrmSizeUnion,
    pub reserved: [u32; 2],
}

#[repr(C)]
pub union FrmSizeUnion {
    pub discrete: FrmSizeDiscrete,
    pub stepwise: FrmSizeStepwise,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct FrmSizeDiscrete {
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct FrmSizeStepwise {
    pub min_width: u32,
    pub max_width: u32,
    pub step_width: u32,
    pub min_height: u32,
    pub max_height: u32,
    pub step_height: u32,
}

#[repr(C)]
pub struct StreamParm {
    pub type_: BufType,
    pub union: StreamParmUnion,
}

#[repr(C)]
pub union StreamParmUnion {
    pub capture: CaptureParm,
    pub output: OutputParm,
    pub raw_data: [u8; 200],
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct CaptureParm {
    pub capability: u32,
    pub capturemode: u32,
    pub timeperframe: Fract,
    pub extendedmode: u32,
    pub readbuffers: u32,
    pub reserved: [u32; 4],
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct OutputParm {
    pub capability: u32,
    pub outputmode: u32,
    pub timeperframe: Fract,
    pub extendedmode: u32,
    pub writebuffers: u32,
    pub reserved: [u32; 4],
}

/// `v4l2_event_subscription`
#[repr(C)]
pub struct EventSubscription {
    pub type_: EventType,
    pub id: u32,
    pub flags: u32,
    pub reserved: [u32; 5],
}

/// `v4l2_event`
#[repr(C)]
pub struct Event {
    pub type_: EventType,
    pub u: EventUnion,
    pub pending: u32,
    pub sequence: u32,
    pub timestamp: timespec,
    pub id: u32,
    pub reserved: [u32; 8],
}

#[repr(C)]
pub union EventUnion {
    pub src_change: EventSrcChange,
    pub data: [u8; 64],
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct EventSrcChange {
    pub changes: u32,
}

/// `v4l2_decoder_cmd`
#[repr(C)]
pub struct DecoderCmd {
    pub cmd: DecCmd,
    pub flags: u32,
    pub union: DecoderCmdUnion,
}

#[repr(C)]
pub union DecoderCmdUnion {
    pub stop: DecoderCmdStop,
    pub start: DecoderCmdStart,
    pub data: [u32; 16],
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct DecoderCmdStop {
    pub pts: u64,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct DecoderCmdStart {
    pub speed: i32,
    pub format: u32,
}

/// `v4l2_encoder_cmd`
#[repr(C)]
pub struct EncoderCmd {
    pub cmd: EncCmd,
    pub flags: u32,
    pub data: [u32; 8],
}

/// `v4l2_selection`
#[repr(C)]
pub struct Selection {
    pub type_: BufType,
    pub target: SelectionTarget,
    pub flags: u32,
    pub r: Rect,
    pub reserved: [u32; 9],
}

/// `v4l2_crop`
#[repr(C)]
pub struct Crop {
    pub type_: BufType,
    pub c: Rect,
}

ioctl_read!(querycap, 'V', 0, Capabilities);
ioctl_readwrite!(enum_fmt, 'V', 2, FmtDesc);
ioctl_readwrite!(g_fmt, 'V', 4, Format);
ioctl_readwrite!(s_fmt, 'V', 5, Format);
ioctl_readwrite!(reqbufs, 'V', 8, RequestBuffers);
ioctl_readwrite!(querybuf, 'V', 9, Buffer);
ioctl_readwrite!(qbuf, 'V', 15, Buffer);
ioctl_readwrite!(expbuf, 'V', 16, ExportBuffer);
ioctl_readwrite!(dqbuf, 'V', 17, Buffer);
ioctl_write_ptr!(streamon, 'V', 18, BufType);
ioctl_write_ptr!(streamoff, 'V', 19, BufType);
ioctl_readwrite!(g_parm, 'V', 21, StreamParm);
ioctl_readwrite!(s_parm, 'V', 22, StreamParm);
ioctl_readwrite!(queryctrl, 'V', 36, QueryCtrl);
ioctl_readwrite!(querymenu, 'V', 37, QueryMenu);
ioctl_readwrite!(g_crop, 'V', 59, Crop);
ioctl_write_ptr!(s_crop, 'V', 60, Crop);
ioctl_readwrite!(try_fmt, 'V', 64, Format);
ioctl_readwrite!(g_ext_ctrls, 'V', 71, ExtControls);
ioctl_readwrite!(s_ext_ctrls, 'V', 72, ExtControls);
ioctl_readwrite!(enum_framesizes, 'V', 74, FrmSizeEnum);
ioctl_readwrite!(encoder_cmd, 'V', 77, EncoderCmd);
ioctl_readwrite!(try_encoder_cmd, 'V', 78, EncoderCmd);
ioctl_read!(dqevent, 'V', 89, Event);
ioctl_write_ptr!(subscribe_event, 'V', 90, EventSubscription);
ioctl_write_ptr!(unsubscribe_event, 'V', 91, EventSubscription);
ioctl_readwrite!(g_selection, 'V', 94, Selection);
ioctl_readwrite!(s_selection, 'V', 95, Selection);
ioctl_readwrite!(decoder_cmd, 'V', 96, DecoderCmd);
ioctl_readwrite!(try_decoder_cmd, 'V', 97, DecoderCmd);
ioctl_readwrite!(query_ext_ctrl, 'V', 103, QueryExtCtrl);

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    // The kernel ABI fixes these sizes on every architecture; a drifting
    // struct here corrupts the ioctl argument.
    #[test]
    fn struct_sizes() {
        assert_eq!(mem::size_of::<Capabilities>(), 104);
        assert_eq!(mem::size_of::<FmtDesc>(), 64);
        assert_eq!(mem::size_of::<PixFormatMplane>(), 192);
        assert_eq!(mem::size_of::<EventSubscription>(), 32);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(mem::size_of::<Event>(), 136);
        assert_eq!(mem::size_of::<DecoderCmd>(), 72);
        assert_eq!(mem::size_of::<EncoderCmd>(), 40);
        assert_eq!(mem::size_of::<Selection>(), 64);
        assert_eq!(mem::size_of::<ExtControl>(), 20);
        assert_eq!(mem::size_of::<ExportBuffer>(), 64);
        assert_eq!(mem::size_of::<QueryExtCtrl>(), 232);
    }
}
