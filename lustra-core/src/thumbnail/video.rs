//! Video derivative strategy: decode the first frame and write it as a
//! still image scaled to the target height.

#[cfg(feature = "ffmpeg")]
use std::path::Path;

use crate::error::Result;
#[cfg(feature = "ffmpeg")]
use crate::error::SyncError;

#[cfg(feature = "ffmpeg")]
fn ensure_ffmpeg_initialized() -> Result<()> {
    use once_cell::sync::OnceCell;

    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        ffmpeg_next::init()
            .map_err(|e| SyncError::Internal(format!("failed to initialize ffmpeg: {e}")))
    })
    .map(|_| ())
}

/// Extract the frame at timestamp zero of `input`, scale it so its height is
/// at most `target_height` (never upscaling), and save it to `output`.
///
/// Blocking: run on a blocking thread.
#[cfg(feature = "ffmpeg")]
pub(crate) fn extract_scaled_frame(input: &Path, output: &Path, target_height: u32) -> Result<()> {
    use ffmpeg_next as ffmpeg;
    use ffmpeg_next::codec::context::Context as CodecContext;
    use tracing::debug;

    ensure_ffmpeg_initialized()?;

    let mut input_ctx = ffmpeg::format::input(&input)?;

    let video_stream = input_ctx
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or_else(|| SyncError::InvalidMedia(format!("no video stream in {}", input.display())))?;
    let video_stream_index = video_stream.index();

    let codec_ctx = CodecContext::from_parameters(video_stream.parameters())?;
    let mut decoder = codec_ctx.decoder().video()?;

    let mut received_frame = None;
    for (stream, packet) in input_ctx.packets() {
        if stream.index() != video_stream_index {
            continue;
        }

        decoder.send_packet(&packet)?;

        let mut frame = ffmpeg::frame::Video::empty();
        match decoder.receive_frame(&mut frame) {
            Ok(()) => {
                received_frame = Some(frame);
                break;
            }
            Err(err) => {
                debug!("skipping packet during frame extraction: {err}");
                continue;
            }
        }
    }

    let frame = received_frame.ok_or_else(|| {
        SyncError::InvalidMedia(format!("unable to decode a frame from {}", input.display()))
    })?;

    // Scale down to the target height, preserving aspect ratio; a source
    // shorter than the target is kept at native size.
    let src_width = decoder.width().max(1);
    let src_height = decoder.height().max(1);
    let out_height = target_height.min(src_height).max(1);
    let out_width =
        ((u64::from(src_width) * u64::from(out_height)) / u64::from(src_height)).max(1) as u32;

    let mut scaler = ffmpeg::software::scaling::Context::get(
        decoder.format(),
        src_width,
        src_height,
        ffmpeg::format::Pixel::RGB24,
        out_width,
        out_height,
        ffmpeg::software::scaling::flag::Flags::BILINEAR,
    )?;

    let mut rgb_frame = ffmpeg::frame::Video::empty();
    scaler.run(&frame, &mut rgb_frame)?;

    let width = rgb_frame.width();
    let height = rgb_frame.height();
    let data = rgb_frame.data(0);
    let stride = rgb_frame.stride(0);

    let buffer = image::ImageBuffer::<image::Rgb<u8>, Vec<u8>>::from_fn(width, height, |x, y| {
        let offset = y as usize * stride + (x as usize * 3);
        image::Rgb([data[offset], data[offset + 1], data[offset + 2]])
    });

    buffer.save(output)?;
    Ok(())
}

#[cfg(not(feature = "ffmpeg"))]
pub(crate) fn extract_scaled_frame(
    _input: &std::path::Path,
    _output: &std::path::Path,
    _target_height: u32,
) -> Result<()> {
    Err(crate::error::SyncError::Internal(
        "FFmpeg support is required for video derivative generation".into(),
    ))
}
