//! Assembly of numbered frames into a video file.
//!
//! The frames are streamed to a [`FrameSink`] in index order. Output goes to
//! `{output}.partial` and is only renamed once the sink has been finalized, a
//! failed assembly leaves no file behind.
use crate::error::{Error, Result};
use image::RgbImage;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// Byte order of the pixels a sink expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

impl ChannelOrder {
    fn pix_fmt(&self) -> &'static str {
        match self {
            Self::Rgb => "rgb24",
            Self::Bgr => "bgr24",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    #[default]
    Mp4,
    Gif,
}

impl VideoFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Gif => "gif",
        }
    }

    /// `{label}_{subject}.{ext}`, e.g. `aerial_panda.mp4`.
    pub fn output_name(&self, label: &str, subject: &str) -> String {
        format!("{label}_{subject}.{}", self.extension())
    }

    pub fn sink(&self, fps: f64) -> Box<dyn FrameSink> {
        match self {
            Self::Mp4 => Box::new(FfmpegSink::new(fps)),
            Self::Gif => Box::new(GifSink::new(fps)),
        }
    }
}

/// Frames `{dir}/{prefix}{i}.png` for `i` in `start..start + count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSequence {
    pub dir: PathBuf,
    pub prefix: String,
    pub start: usize,
    pub count: usize,
}

impl FrameSequence {
    pub const DEFAULT_PREFIX: &'static str = "generated_image_";

    pub fn new<P: Into<PathBuf>>(dir: P, count: usize) -> Self {
        Self { dir: dir.into(), prefix: Self::DEFAULT_PREFIX.to_string(), start: 0, count }
    }

    /// The sequence of all the consecutive frames present from index 0.
    pub fn detect<P: Into<PathBuf>>(dir: P) -> Self {
        let mut sequence = Self::new(dir, 0);
        while sequence.path(sequence.start + sequence.count).exists() {
            sequence.count += 1
        }
        sequence
    }

    pub fn path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}{index}.png", self.prefix))
    }

    pub fn paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        (self.start..self.start + self.count).map(|index| self.path(index))
    }
}

/// A video encoder fed with raw frames of a fixed size.
pub trait FrameSink {
    fn channel_order(&self) -> ChannelOrder;

    /// Starts a stream of `width` x `height` frames written to `path`.
    fn begin(&mut self, path: &Path, width: u32, height: u32) -> Result<()>;

    /// Packed pixels of one frame, in [`FrameSink::channel_order`].
    fn write_frame(&mut self, data: &[u8]) -> Result<()>;

    fn finish(&mut self) -> Result<()>;

    /// Stops the stream, the output may be left incomplete.
    fn abort(&mut self);
}

pub struct GifSink {
    delay: u16,
    encoder: Option<(gif::Encoder<File>, u16, u16)>,
}

impl GifSink {
    pub fn new(fps: f64) -> Self {
        // Gif delays are in hundredths of a second.
        let delay = (100. / fps.max(1e-2)).round().clamp(1., u16::MAX as f64) as u16;
        Self { delay, encoder: None }
    }
}

impl FrameSink for GifSink {
    fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::Rgb
    }

    fn begin(&mut self, path: &Path, width: u32, height: u32) -> Result<()> {
        let (Ok(w), Ok(h)) = (u16::try_from(width), u16::try_from(height)) else {
            return Err(Error::invalid(format!("{width}x{height} is too large for a gif")));
        };
        let file = File::create(path)?;
        let mut encoder = gif::Encoder::new(file, w, h, &[])?;
        encoder.set_repeat(gif::Repeat::Infinite)?;
        self.encoder = Some((encoder, w, h));
        Ok(())
    }

    fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        let (encoder, w, h) =
            self.encoder.as_mut().ok_or_else(|| Error::Encoder("gif stream not started".into()))?;
        let mut frame = gif::Frame::from_rgb_speed(*w, *h, data, 10);
        frame.delay = self.delay;
        encoder.write_frame(&frame)?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        match self.encoder.take() {
            // Dropping the encoder writes the trailer.
            Some((encoder, _, _)) => {
                drop(encoder);
                Ok(())
            }
            None => Err(Error::Encoder("gif stream not started".into())),
        }
    }

    fn abort(&mut self) {
        self.encoder = None
    }
}

/// Pipes raw frames into an `ffmpeg` process producing an mp4 file.
pub struct FfmpegSink {
    fps: f64,
    codec: String,
    order: ChannelOrder,
    program: PathBuf,
    child: Option<Child>,
}

impl FfmpegSink {
    pub fn new(fps: f64) -> Self {
        Self {
            fps,
            codec: "libx264".to_string(),
            order: ChannelOrder::Rgb,
            program: PathBuf::from("ffmpeg"),
            child: None,
        }
    }

    /// Uses `mpeg4` or any other codec known to the local ffmpeg build.
    pub fn with_codec(mut self, codec: &str) -> Self {
        self.codec = codec.to_string();
        self
    }

    pub fn with_channel_order(mut self, order: ChannelOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_program<P: Into<PathBuf>>(mut self, program: P) -> Self {
        self.program = program.into();
        self
    }
}

impl FrameSink for FfmpegSink {
    fn channel_order(&self) -> ChannelOrder {
        self.order
    }

    fn begin(&mut self, path: &Path, width: u32, height: u32) -> Result<()> {
        let mut command = Command::new(&self.program);
        command
            .args(["-y", "-loglevel", "error", "-f", "rawvideo", "-pix_fmt", self.order.pix_fmt()])
            .args(["-s".to_string(), format!("{width}x{height}"), "-r".to_string(), self.fps.to_string()])
            .args(["-i", "-", "-c:v", self.codec.as_str(), "-pix_fmt", "yuv420p", "-f", "mp4"])
            .arg(path)
            .stdin(Stdio::piped());
        debug!("Running {command:?}");
        let child = command
            .spawn()
            .map_err(|e| Error::Encoder(format!("cannot run {:?}: {e}", self.program)))?;
        self.child = Some(child);
        Ok(())
    }

    fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self
            .child
            .as_mut()
            .and_then(|child| child.stdin.as_mut())
            .ok_or_else(|| Error::Encoder("ffmpeg stream not started".into()))?;
        stdin.write_all(data).map_err(|e| Error::Encoder(format!("ffmpeg input: {e}")))
    }

    fn finish(&mut self) -> Result<()> {
        let mut child =
            self.child.take().ok_or_else(|| Error::Encoder("ffmpeg stream not started".into()))?;
        drop(child.stdin.take());
        let status = child.wait()?;
        if !status.success() {
            return Err(Error::Encoder(format!("ffmpeg exited with {status}")));
        }
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(mut child) = self.child.take() {
            drop(child.stdin.take());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn read_frame(path: &Path) -> Result<RgbImage> {
    crate::utils::ensure_exists(path)?;
    Ok(image::open(path)?.to_rgb8())
}

fn write_frames(frames: &FrameSequence, sink: &mut dyn FrameSink, partial: &Path) -> Result<usize> {
    let mut expected = None;
    let mut written = 0;
    for index in frames.start..frames.start + frames.count {
        let path = frames.path(index);
        let frame = read_frame(&path)?;
        let size = frame.dimensions();
        match expected {
            None => {
                info!("Video size {}x{} from {path:?}", size.0, size.1);
                sink.begin(partial, size.0, size.1)?;
                expected = Some(size)
            }
            Some(expected) if expected != size => {
                return Err(Error::DimensionMismatch { index, expected, actual: size })
            }
            Some(_) => {}
        }
        let mut data = frame.into_raw();
        if sink.channel_order() == ChannelOrder::Bgr {
            for pixel in data.chunks_exact_mut(3) {
                pixel.swap(0, 2)
            }
        }
        sink.write_frame(&data)?;
        debug!("Wrote frame {index} {path:?}");
        written += 1;
    }
    sink.finish()?;
    Ok(written)
}

/// Writes every frame of the sequence to `output`, returns the frame count.
pub fn assemble<P: AsRef<Path>>(
    frames: &FrameSequence,
    sink: &mut dyn FrameSink,
    output: P,
) -> Result<usize> {
    let output = output.as_ref();
    if frames.count == 0 {
        return Err(Error::invalid(format!("no frame to assemble into {output:?}")));
    }
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut partial = output.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    match write_frames(frames, sink, &partial) {
        Ok(written) => {
            std::fs::rename(&partial, output)?;
            info!("Video saved in {output:?} ({written} frames)");
            Ok(written)
        }
        Err(err) => {
            sink.abort();
            if partial.exists() {
                if let Err(e) = std::fs::remove_file(&partial) {
                    warn!("could not remove {partial:?}: {e}");
                }
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_names() {
        let frames = FrameSequence { start: 2, ..FrameSequence::new("res", 3) };
        let paths: Vec<_> = frames.paths().collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("res/generated_image_2.png"),
                PathBuf::from("res/generated_image_3.png"),
                PathBuf::from("res/generated_image_4.png"),
            ]
        );
        assert_eq!(VideoFormat::Mp4.output_name("aerial", "panda"), "aerial_panda.mp4");
    }

    #[test]
    fn gif_delay_from_fps() {
        assert_eq!(GifSink::new(1.).delay, 100);
        assert_eq!(GifSink::new(25.).delay, 4);
    }

    #[test]
    fn detect_counts_consecutive_frames() {
        let dir = tempfile::tempdir().unwrap();
        for index in [0, 1, 2, 4] {
            RgbImage::new(4, 4).save(dir.path().join(format!("generated_image_{index}.png"))).unwrap();
        }
        assert_eq!(FrameSequence::detect(dir.path()).count, 3);
    }
}
