//! Library-surface tests that need no codec hardware.

use std::sync::mpsc;
use std::time::Duration;

use anyhow::Result;

use linuxcodec::decoder::{DecoderState, FeedStatus, VideoDecoder, FLUSH_BUFFER_ID};
use linuxcodec::encoder::{EncoderState, VideoEncoder};
use linuxcodec::{
    active_backend, allocation_size, CodecBackend, DeviceType, PixelFormat, PollThread, Size,
    VideoPixelFormat,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn fourcc_catalog_round_trips() -> Result<()> {
    init();

    for fourcc in [b"NV12", b"NM12", b"YU12", b"YV12", b"YUYV", b"P010"] {
        let fmt = PixelFormat::from_fourcc(*fourcc);
        assert_eq!(PixelFormat::from_v4l2_pix_fmt(fmt.as_u32()), fmt);
        assert_eq!(&fmt.as_fourcc(), fourcc);
    }

    Ok(())
}

#[test]
fn frame_layout_arithmetic() {
    init();

    let coded = Size::new(640, 480);
    assert_eq!(
        allocation_size(VideoPixelFormat::Nv12, coded),
        640 * 480 * 3 / 2
    );
    assert_eq!(allocation_size(VideoPixelFormat::Yuy2, coded), 640 * 480 * 2);
}

#[test]
fn engines_start_uninitialized() {
    init();

    let decoder = VideoDecoder::new();
    assert_eq!(decoder.state(), DecoderState::Uninitialized);

    let encoder = VideoEncoder::new();
    assert_eq!(encoder.state(), EncoderState::Uninitialized);
}

#[test]
fn decode_feed_stalls_without_buffers() -> Result<()> {
    init();

    // Without an initialized device there is no input pool; feeding must
    // report a stall instead of an error, even for the flush sentinel.
    let mut decoder = VideoDecoder::new();
    let status = decoder.decode_buffer(&[0, 0, 0, 1], FLUSH_BUFFER_ID, 0)?;
    assert_eq!(status, FeedStatus::Stalled);

    Ok(())
}

#[test]
fn poll_thread_runs_posted_tasks() -> Result<()> {
    init();

    let (tx, rx) = mpsc::channel();
    let mut thread = PollThread::new("smoke-poll");
    thread.start();
    thread.post(move || {
        tx.send(7u32).ok();
    });

    assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, 7);
    thread.stop();

    Ok(())
}

#[test]
fn backend_and_device_paths() {
    init();

    if std::env::var("USE_CODEC_INSTANCE").is_err() {
        assert_eq!(active_backend(), CodecBackend::V4l2);
    }

    assert_eq!(DeviceType::Decoder.candidate_paths(), ["/dev/video10"]);
    assert_eq!(DeviceType::Encoder.candidate_paths(), ["/dev/video11"]);
}
