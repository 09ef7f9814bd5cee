// Renders aerial, back, bottom and side views of the subject of each example.
//
// The pretrained networks are TorchScript exports of Stable Diffusion 2.1 put
// in data/ (see `BackendPaths::in_dir` for the file names), along with the
// CLIP vocabulary:
//
// mkdir -p data && cd data
// wget https://github.com/openai/CLIP/raw/main/clip/bpe_simple_vocab_16e6.txt.gz
// gunzip bpe_simple_vocab_16e6.txt.gz
//
// Run the built-in experiment list:
//   cargo run --release --features clap --bin aerialbooth -- --output-dir exp_outputs/sum_out
// Or the frames of a video, each output seeding the next frame:
//   cargo run --release --features clap --bin aerialbooth -- --preset temporal \
//     --frames videos/panda --prompt "A panda eating bamboo." --output-dir exp_outs/panda/res
use anyhow::Context;
use aerialbooth::{
    backend::TorchScriptBackend,
    config::{load_json, BackendPaths, PipelineConfig},
    driver::{frames_in, BatchDriver, BatchReport, Preset},
    utils::DeviceConfig,
    view::ViewMode,
    worklist::Worklist,
};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON pipeline configuration, missing fields take their default value.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding the vocabulary and the TorchScript modules.
    #[arg(long, default_value = "data")]
    models: PathBuf,

    /// JSON file listing the locations of the networks, overrides `--models`.
    #[arg(long, value_name = "FILE")]
    backend_config: Option<PathBuf>,

    /// JSON worklist, the built-in experiment list is used otherwise.
    #[arg(long, value_name = "FILE")]
    worklist: Option<PathBuf>,

    /// Source images of the built-in experiment list.
    #[arg(long, default_value = "dataset/synthetic_sdxl_images")]
    dataset_root: PathBuf,

    /// Homography guesses of the built-in experiment list.
    #[arg(long, default_value = "zero_outputs")]
    zero_root: PathBuf,

    #[arg(long, default_value = "exp_outputs/sum_out")]
    output_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = Preset::Noisy)]
    preset: Preset,

    /// Components to run on the CPU: all, clip, vae or unet.
    #[arg(long)]
    cpu: Vec<String>,

    /// The number of steps to run the diffusion for.
    #[arg(long)]
    n_steps: Option<usize>,

    /// The number of samples rendered per view.
    #[arg(long)]
    num_samples: Option<usize>,

    #[arg(long)]
    seed: Option<i64>,

    #[arg(long)]
    embedding_steps: Option<usize>,

    #[arg(long)]
    finetune_steps: Option<usize>,

    #[arg(long)]
    guidance_scale: Option<f64>,

    /// Frames of a video, sorted by name, processed with the temporal preset.
    #[arg(long)]
    frames: Option<PathBuf>,

    /// Prompt describing the frames of the video.
    #[arg(long)]
    prompt: Option<String>,

    #[arg(long, value_enum, default_value_t = ViewMode::Aerial)]
    view: ViewMode,

    /// Homography guesses of the frames, with the same file names.
    #[arg(long)]
    homography_dir: Option<PathBuf>,
}

impl Args {
    fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config: PipelineConfig = match &self.config {
            Some(path) => load_json(path).with_context(|| format!("reading {path:?}"))?,
            None => PipelineConfig::default(),
        };
        if let Some(n_steps) = self.n_steps {
            config.num_inference_steps = n_steps
        }
        if let Some(num_samples) = self.num_samples {
            config.sample_count = num_samples
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed)
        }
        if let Some(steps) = self.embedding_steps {
            config.text_embedding_optimization_steps = steps
        }
        if let Some(steps) = self.finetune_steps {
            config.model_fine_tuning_optimization_steps = steps
        }
        if let Some(guidance_scale) = self.guidance_scale {
            config.guidance_scale = guidance_scale
        }
        config.validate()?;
        Ok(config)
    }

    fn backend_paths(&self) -> anyhow::Result<BackendPaths> {
        match &self.backend_config {
            Some(path) => Ok(load_json(path).with_context(|| format!("reading {path:?}"))?),
            None => Ok(BackendPaths::in_dir(&self.models)),
        }
    }
}

fn report_failures(report: &BatchReport) -> bool {
    for (id, err) in report.failed.iter() {
        error!("{id}: {err}");
    }
    report.is_success()
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "info")).init();
    let args = Args::parse();
    tch::maybe_init_cuda();
    info!("Cuda available: {}", tch::Cuda::is_available());
    info!("Cudnn available: {}", tch::Cuda::cudnn_is_available());

    let config = args.pipeline_config()?;
    let devices = DeviceConfig::new(args.cpu.clone());
    let backend = TorchScriptBackend::load(&args.backend_paths()?, &devices)?;
    let mut driver = BatchDriver::new(backend, config, args.preset, &args.output_dir)?;

    let report = match (&args.frames, args.preset) {
        (Some(frames), _) => {
            let prompt = args.prompt.as_deref().context("--prompt is required with --frames")?;
            let frames = frames_in(frames)?;
            info!("Processing {} frames.", frames.len());
            driver.run_temporal(
                &frames,
                prompt,
                args.view,
                args.homography_dir.as_deref(),
                &args.output_dir,
            )
        }
        (None, Preset::Temporal) => anyhow::bail!("the temporal preset needs --frames"),
        _ => {
            let worklist = match &args.worklist {
                Some(path) => Worklist::load(path)?,
                None => Worklist::synthetic(&args.dataset_root, &args.zero_root),
            };
            driver.run(&worklist)
        }
    };
    if !report_failures(&report) {
        error!("{} of {} failed.", report.failed.len(), report.failed.len() + report.succeeded.len());
        std::process::exit(1)
    }
    Ok(())
}
