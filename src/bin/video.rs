// Turns the frames written by the temporal preset into a video:
//   cargo run --release --features clap --bin aerialbooth-video -- \
//     --frames exp_outs/videos_temporal/panda/res --subject panda
use aerialbooth::video::{assemble, FrameSequence, VideoFormat};
use clap::Parser;
use log::info;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding `generated_image_{i}.png`.
    #[arg(long)]
    frames: PathBuf,

    /// The view the frames were rendered for.
    #[arg(long, default_value = "aerial")]
    label: String,

    #[arg(long)]
    subject: String,

    /// Number of frames, all the consecutive ones found by default.
    #[arg(long)]
    count: Option<usize>,

    #[arg(long, default_value_t = 1.)]
    fps: f64,

    #[arg(long, value_enum, default_value_t = VideoFormat::Mp4)]
    format: VideoFormat,

    #[arg(long, default_value = "frames_to_vids")]
    out_dir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "info")).init();
    let args = Args::parse();
    let frames = match args.count {
        Some(count) => FrameSequence::new(&args.frames, count),
        None => FrameSequence::detect(&args.frames),
    };
    let output = args.out_dir.join(&args.subject).join(args.format.output_name(&args.label, &args.subject));
    let mut sink = args.format.sink(args.fps);
    let written = assemble(&frames, sink.as_mut(), &output)?;
    info!("video saved in {output:?}, {written} frames");
    Ok(())
}
