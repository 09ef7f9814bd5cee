mod common;

use aerialbooth::{
    video::{assemble, ChannelOrder, FrameSequence, FrameSink, GifSink, VideoFormat},
    Error, Result,
};
use common::{gradient, write_image};
use std::path::Path;

#[derive(Default)]
struct RecordingSink {
    size: Option<(u32, u32)>,
    frames: Vec<Vec<u8>>,
    finished: bool,
    aborted: bool,
}

impl FrameSink for RecordingSink {
    fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Bgr
    }

    fn begin(&mut self, path: &Path, width: u32, height: u32) -> Result<()> {
        std::fs::write(path, b"")?;
        self.size = Some((width, height));
        Ok(())
    }

    fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        self.frames.push(data.to_vec());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted = true
    }
}

fn write_frames(dir: &Path, sizes: &[(u32, u32)]) {
    for (index, &(w, h)) in sizes.iter().enumerate() {
        write_image(dir.join(format!("generated_image_{index}.png")), &gradient(w, h, index as u8));
    }
}

#[test]
fn gif_from_generated_frames() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_frames(dir.path(), &[(32, 24); 4]);
    let frames = FrameSequence::detect(dir.path());
    assert_eq!(frames.count, 4);
    let output = dir.path().join("videos").join(VideoFormat::Gif.output_name("aerial", "panda"));
    let written = assemble(&frames, &mut GifSink::new(1.), &output)?;
    assert_eq!(written, 4);
    assert!(output.exists());
    assert!(!dir.path().join("videos/aerial_panda.gif.partial").exists());
    let decoder = gif::DecodeOptions::new().read_info(std::fs::File::open(&output)?)?;
    assert_eq!((decoder.width(), decoder.height()), (32, 24));
    Ok(())
}

#[test]
fn size_mismatch_leaves_no_video() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_frames(dir.path(), &[(32, 24), (32, 24), (24, 32)]);
    let output = dir.path().join("aerial_panda.gif");
    let err = assemble(&FrameSequence::new(dir.path(), 3), &mut GifSink::new(1.), &output).unwrap_err();
    match err {
        Error::DimensionMismatch { index, expected, actual } => {
            assert_eq!(index, 2);
            assert_eq!(expected, (32, 24));
            assert_eq!(actual, (24, 32));
        }
        err => panic!("unexpected error {err}"),
    }
    assert!(!output.exists());
    assert!(!dir.path().join("aerial_panda.gif.partial").exists());
    Ok(())
}

#[test]
fn mismatch_reports_the_frame_number() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    for (index, size) in [(2, (16, 16)), (3, (16, 16)), (4, (8, 16))] {
        write_image(dir.path().join(format!("generated_image_{index}.png")), &gradient(size.0, size.1, 0));
    }
    let frames = FrameSequence { start: 2, ..FrameSequence::new(dir.path(), 3) };
    let mut sink = RecordingSink::default();
    let err = assemble(&frames, &mut sink, dir.path().join("out.raw")).unwrap_err();
    match err {
        Error::DimensionMismatch { index, .. } => assert_eq!(index, 4),
        err => panic!("unexpected error {err}"),
    }
    assert_eq!(sink.frames.len(), 2);
    assert!(sink.aborted);
    Ok(())
}

#[test]
fn frames_follow_the_sink_channel_order() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    write_frames(dir.path(), &[(8, 8); 2]);
    let mut sink = RecordingSink::default();
    let output = dir.path().join("out.raw");
    assert_eq!(assemble(&FrameSequence::new(dir.path(), 2), &mut sink, &output)?, 2);
    assert!(sink.finished && !sink.aborted);
    assert_eq!(sink.size, Some((8, 8)));
    let original = gradient(8, 8, 1);
    let pixel = original.get_pixel(7, 3);
    let offset = (3 * 8 + 7) * 3;
    assert_eq!(&sink.frames[1][offset..offset + 3], &[pixel[2], pixel[1], pixel[0]]);
    assert!(output.exists());
    Ok(())
}

#[test]
fn missing_frame() {
    let dir = tempfile::tempdir().unwrap();
    write_frames(dir.path(), &[(8, 8)]);
    let mut sink = RecordingSink::default();
    let output = dir.path().join("out.raw");
    let err = assemble(&FrameSequence::new(dir.path(), 2), &mut sink, &output).unwrap_err();
    assert_eq!(err.kind(), "MissingAssetError");
    assert!(sink.aborted);
    assert!(!output.exists());
    assert!(!dir.path().join("out.raw.partial").exists());
}
