//! Sequential processing of a worklist, one example at a time.
//!
//! A failing example is logged and skipped, the remaining ones still run.
//! Outputs of an example are written to `{root}/{id}.partial` and only moved
//! to `{root}/{id}` once every view has been rendered.
use crate::backend::GenerativeBackend;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::image_io;
use crate::pipeline::{EditPipeline, PersonalizedState, RenderOptions};
use crate::view::ViewMode;
use crate::worklist::{Example, Homography, Worklist};
use image::RgbImage;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The variants of the experiment, from the optional stages they enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Personalize once, render every view from its noisy homography latent.
    #[default]
    Noisy,
    /// Personalize again for every view, homographies cropped from a sheet.
    PerView,
    /// As `Noisy` without classifier-free guidance.
    NoGuidance,
    /// Frames of a video, each output becomes the source of the next frame.
    /// Only [`BatchDriver::run_temporal`] accepts it.
    Temporal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stages {
    pub personalize_per_view: bool,
    pub guidance: bool,
}

impl Preset {
    pub fn stages(&self) -> Stages {
        let base = Stages { personalize_per_view: false, guidance: true };
        match self {
            Self::Noisy | Self::Temporal => base,
            Self::PerView => Stages { personalize_per_view: true, ..base },
            Self::NoGuidance => Stages { guidance: false, ..base },
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, id: String, result: Result<()>) {
        match result {
            Ok(()) => self.succeeded.push(id),
            Err(err) => {
                error!("{id} failed with {}: {err}", err.kind());
                self.failed.push((id, err))
            }
        }
    }
}

/// The image files of a directory, sorted by name.
pub fn frames_in<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    crate::utils::ensure_exists(dir)?;
    let mut frames = vec![];
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_lowercase().as_str(), "png" | "jpg" | "jpeg"))
            .unwrap_or(false);
        if is_image {
            frames.push(path)
        }
    }
    frames.sort();
    Ok(frames)
}

fn file_id(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

pub struct BatchDriver<B: GenerativeBackend> {
    pipeline: EditPipeline<B>,
    config: PipelineConfig,
    preset: Preset,
    output_root: PathBuf,
}

impl<B: GenerativeBackend> BatchDriver<B> {
    pub fn new<P: Into<PathBuf>>(
        backend: B,
        config: PipelineConfig,
        preset: Preset,
        output_root: P,
    ) -> Result<Self> {
        config.validate()?;
        let pipeline = EditPipeline::new(backend, &config);
        Ok(Self { pipeline, config, preset, output_root: output_root.into() })
    }

    pub fn pipeline(&self) -> &EditPipeline<B> {
        &self.pipeline
    }

    pub fn output_dir(&self, example_id: &str) -> PathBuf {
        self.output_root.join(example_id)
    }

    fn render_options(&self) -> RenderOptions {
        let mut options = RenderOptions::from(&self.config);
        if !self.preset.stages().guidance {
            options.guidance_scale = 1.0
        }
        options
    }

    fn personalize(&mut self, source: &RgbImage, prompt: &str) -> Result<PersonalizedState> {
        let source = image_io::preprocess(source)?;
        self.pipeline.personalize(
            &source,
            prompt,
            self.config.text_embedding_optimization_steps,
            self.config.model_fine_tuning_optimization_steps,
        )
    }

    pub fn run(&mut self, worklist: &Worklist) -> BatchReport {
        let mut report = BatchReport::default();
        for (index, example) in worklist.examples.iter().enumerate() {
            info!("Example {}/{}: {} \"{}\"", index + 1, worklist.len(), example.id, example.prompt);
            let result = self.run_example(example).map(|dir| info!("Outputs saved in {dir:?}"));
            report.record(example.id.clone(), result);
        }
        info!("{} examples succeeded, {} failed.", report.succeeded.len(), report.failed.len());
        report
    }

    /// Processes one example, returns its output directory.
    pub fn run_example(&mut self, example: &Example) -> Result<PathBuf> {
        if self.preset == Preset::Temporal {
            return Err(Error::invalid("the temporal preset processes video frames, not worklist examples"));
        }
        let staging = self.output_root.join(format!("{}.partial", example.id));
        let output_dir = self.output_dir(&example.id);
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        match self.process_example(example, &staging) {
            Ok(()) => {
                if output_dir.exists() {
                    std::fs::remove_dir_all(&output_dir)?;
                }
                std::fs::rename(&staging, &output_dir)?;
                Ok(output_dir)
            }
            Err(err) => {
                if staging.exists() {
                    if let Err(e) = std::fs::remove_dir_all(&staging) {
                        warn!("could not remove {staging:?}: {e}");
                    }
                }
                Err(err)
            }
        }
    }

    fn process_example(&mut self, example: &Example, staging: &Path) -> Result<()> {
        let source = image_io::load_rgb(&example.image, self.config.width, self.config.height)?;
        std::fs::create_dir_all(staging)?;
        if self.preset.stages().personalize_per_view {
            for &view in example.view_modes.iter() {
                let state = self.personalize(&source, &example.prompt)?;
                self.render_view(&state, example, view, &source, staging)?;
                self.pipeline.finish(state)?;
            }
        } else {
            let state = self.personalize(&source, &example.prompt)?;
            for &view in example.view_modes.iter() {
                self.render_view(&state, example, view, &source, staging)?;
            }
            self.pipeline.finish(state)?;
        }
        Ok(())
    }

    fn homography_for(&self, example: &Example, view: ViewMode, source: &RgbImage) -> Result<RgbImage> {
        let (width, height) = (self.config.width, self.config.height);
        match (&example.homography, example.homography.path(&example.id, view)) {
            (Homography::Sheet(_), Some(path)) => {
                crate::utils::ensure_exists(&path)?;
                let sheet = image::open(&path)?.to_rgb8();
                let mut cells = image_io::split_sheet(&sheet, 2, 3)?;
                let cell = cells.swap_remove(view.sheet_index());
                Ok(image_io::resize(cell, width, height))
            }
            (_, Some(path)) => image_io::load_rgb(path, width, height),
            (_, None) => Ok(source.clone()),
        }
    }

    fn render_view(
        &mut self,
        state: &PersonalizedState,
        example: &Example,
        view: ViewMode,
        source: &RgbImage,
        staging: &Path,
    ) -> Result<()> {
        let homography = self.homography_for(example, view, source)?;
        let homography = image_io::preprocess(&homography)?;
        let options = self.render_options();
        let view_prompt = view.prompt(&example.prompt);
        let samples = self.pipeline.render(state, &view_prompt, &homography, &options)?;
        for (index, image) in samples.enumerate() {
            let path = staging.join(view.sample_file_name(index + 1));
            image_io::save(&image?, &path)?;
            info!("Saved {path:?}");
        }
        Ok(())
    }

    /// Processes the frames of a video in order. The output of a frame is the
    /// source image of the next one, a failed frame leaves the chain as is.
    /// Frame `k` is rendered to `{out_dir}/generated_image_{k}.png`.
    pub fn run_temporal<P: AsRef<Path>>(
        &mut self,
        frames: &[PathBuf],
        prompt: &str,
        view: ViewMode,
        homography_dir: Option<&Path>,
        out_dir: P,
    ) -> BatchReport {
        let out_dir = out_dir.as_ref();
        let mut report = BatchReport::default();
        let mut previous_output: Option<RgbImage> = None;
        for (index, frame) in frames.iter().enumerate() {
            info!("Frame {}/{}: {frame:?}", index + 1, frames.len());
            let result = self.temporal_frame(
                frame,
                prompt,
                view,
                homography_dir,
                previous_output.as_ref(),
                &out_dir.join(format!("generated_image_{index}.png")),
            );
            let result = result.map(|image| previous_output = Some(image));
            report.record(file_id(frame), result);
        }
        report
    }

    fn temporal_frame(
        &mut self,
        frame: &Path,
        prompt: &str,
        view: ViewMode,
        homography_dir: Option<&Path>,
        previous_output: Option<&RgbImage>,
        output: &Path,
    ) -> Result<RgbImage> {
        let (width, height) = (self.config.width, self.config.height);
        let source = match previous_output {
            Some(previous) => previous.clone(),
            None => image_io::load_rgb(frame, width, height)?,
        };
        let homography = match (homography_dir, frame.file_name()) {
            (Some(dir), Some(name)) => image_io::load_rgb(dir.join(name), width, height)?,
            _ => source.clone(),
        };
        let homography = image_io::preprocess(&homography)?;
        let state = self.personalize(&source, prompt)?;
        let options = RenderOptions { sample_count: 1, ..self.render_options() };
        let image = {
            let mut samples =
                self.pipeline.render(&state, &view.prompt(prompt), &homography, &options)?;
            samples.next().ok_or_else(|| Error::Backend("no sample was rendered".to_string()))??
        };
        self.pipeline.finish(state)?;
        image_io::save(&image, output)?;
        info!("Saved {output:?}");
        Ok(image)
    }
}
