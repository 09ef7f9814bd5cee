//! # Novel view editing pipeline
//!
//! A source image and its prompt are first used to personalize the model, in
//! the manner of Imagic (https://arxiv.org/abs/2210.09276):
//! 1. the text embedding of the prompt is optimized so that the frozen model
//!    reconstructs the source image,
//! 2. the embedding is frozen and low-rank adapters attached to every attention
//!    projection are fine-tuned on the same objective.
//!
//! The personalized model then samples from the latent of a homography image,
//! a rough guess of the target view, conditioned on a view-prefixed prompt.
use crate::backend::{GenerativeBackend, LatentDistribution, LATENT_SCALE};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::image_io;
use crate::lora::LoraAdapters;
use crate::schedulers::ddim::{DDIMScheduler, DDIMSchedulerConfig};
use image::RgbImage;
use log::{debug, info, warn};
use tch::{nn, nn::OptimizerConfig, Device, Kind, Tensor};

/// Where the pipeline stands for the current example.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    EmbeddingOptimizing,
    AdapterFineTuning,
    Rendering,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOptions {
    pub embedding_learning_rate: f64,
    pub diffusion_model_learning_rate: f64,
    pub lora_rank: i64,
    pub train_seed: Option<i64>,
    pub log_every: usize,
}

impl From<&PipelineConfig> for TrainingOptions {
    fn from(c: &PipelineConfig) -> Self {
        Self {
            embedding_learning_rate: c.embedding_learning_rate,
            diffusion_model_learning_rate: c.diffusion_model_learning_rate,
            lora_rank: c.lora_rank,
            train_seed: c.train_seed,
            log_every: c.log_every,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    pub sample_count: usize,
    pub guidance_scale: f64,
    pub steps: usize,
    pub seed: Option<i64>,
    pub homography_noise_scale: f64,
}

impl From<&PipelineConfig> for RenderOptions {
    fn from(c: &PipelineConfig) -> Self {
        Self {
            sample_count: c.sample_count,
            guidance_scale: c.guidance_scale,
            steps: c.num_inference_steps,
            seed: c.seed,
            homography_noise_scale: c.homography_noise_scale,
        }
    }
}

/// The outcome of personalizing the model on one example.
#[derive(Debug)]
pub struct PersonalizedState {
    embeddings: Tensor,
    adapters: Option<LoraAdapters>,
    source_size: (i64, i64),
    embedding_loss: Option<f64>,
    adapter_loss: Option<f64>,
}

impl PersonalizedState {
    /// The optimized text embedding.
    pub fn embeddings(&self) -> &Tensor {
        &self.embeddings
    }

    /// The fine-tuned adapters, `None` when that stage was skipped.
    pub fn adapters(&self) -> Option<&LoraAdapters> {
        self.adapters.as_ref()
    }

    /// Height and width of the source image.
    pub fn source_size(&self) -> (i64, i64) {
        self.source_size
    }

    /// Loss at the last embedding optimization step.
    pub fn embedding_loss(&self) -> Option<f64> {
        self.embedding_loss
    }

    /// Loss at the last adapter fine-tuning step.
    pub fn adapter_loss(&self) -> Option<f64> {
        self.adapter_loss
    }
}

fn image_size(image: &Tensor) -> Result<(i64, i64)> {
    let size = image.size();
    let [batch, channels, height, width] = size.as_slice() else {
        return Err(Error::invalid(format!("expected a [1, 3, H, W] image, got {size:?}")));
    };
    if *batch != 1 || *channels != 3 {
        return Err(Error::invalid(format!("expected a [1, 3, H, W] image, got {size:?}")));
    }
    if height % 8 != 0 || width % 8 != 0 {
        return Err(Error::invalid(format!(
            "`height` and `width` have to be divisible by 8 but are {height} and {width}."
        )));
    }
    Ok((*height, *width))
}

pub struct EditPipeline<B: GenerativeBackend> {
    backend: B,
    scheduler: DDIMSchedulerConfig,
    training: TrainingOptions,
    stage: Stage,
}

impl<B: GenerativeBackend> EditPipeline<B> {
    pub fn new(backend: B, config: &PipelineConfig) -> Self {
        Self {
            backend,
            scheduler: config.scheduler,
            training: TrainingOptions::from(config),
            stage: Stage::Idle,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Optimizes the prompt embedding for `embedding_steps`, then fine-tunes
    /// fresh adapters for `adapter_steps`. A zero step count skips its stage.
    pub fn personalize(
        &mut self,
        source: &Tensor,
        prompt: &str,
        embedding_steps: usize,
        adapter_steps: usize,
    ) -> Result<PersonalizedState> {
        if prompt.trim().is_empty() {
            return Err(Error::invalid("the prompt is empty"));
        }
        let source_size = image_size(source)?;
        self.backend.detach_adapters()?;
        self.stage = Stage::Idle;
        match self.personalize_stages(source, prompt, embedding_steps, adapter_steps) {
            Ok((embeddings, embedding_loss, adapters, adapter_loss)) => Ok(PersonalizedState {
                embeddings,
                adapters,
                source_size,
                embedding_loss,
                adapter_loss,
            }),
            Err(err) => {
                self.stage = Stage::Idle;
                if let Err(e) = self.backend.detach_adapters() {
                    warn!("could not restore the pretrained weights: {e}");
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn personalize_stages(
        &mut self,
        source: &Tensor,
        prompt: &str,
        embedding_steps: usize,
        adapter_steps: usize,
    ) -> Result<(Tensor, Option<f64>, Option<LoraAdapters>, Option<f64>)> {
        let options = self.training.clone();
        // Rendering reseeds the global generator, training starts from a fresh
        // seed unless a fixed one is requested.
        tch::manual_seed(options.train_seed.unwrap_or_else(rand::random));
        // Only the forward noising is used here, the inference length is irrelevant.
        let scheduler = DDIMScheduler::new(1, self.scheduler)?;
        let latents = tch::no_grad(|| -> Result<Tensor> {
            Ok(self.backend.encode_image(source)?.sample() * LATENT_SCALE)
        })?;
        let init_embeddings = tch::no_grad(|| self.backend.encode_text(prompt))?;

        self.stage = Stage::EmbeddingOptimizing;
        let vs = nn::VarStore::new(self.backend.device());
        let embeddings = vs.root().var_copy("text_embeddings", &init_embeddings);
        let embedding_loss = if embedding_steps > 0 {
            info!("First optimizing the text embedding to better reconstruct the init image");
            let mut opt = nn::Adam::default().build(&vs, options.embedding_learning_rate)?;
            Some(self.fit(&scheduler, &latents, &embeddings, &mut opt, embedding_steps, "embedding")?)
        } else {
            debug!("Skipping the text embedding optimization.");
            None
        };
        let embeddings = embeddings.detach();

        if adapter_steps == 0 {
            debug!("Skipping the adapter fine-tuning.");
            return Ok((embeddings, embedding_loss, None, None));
        }
        self.stage = Stage::AdapterFineTuning;
        info!("Next fine tuning the attention adapters to better reconstruct the init image");
        let targets = self.backend.adapter_targets()?;
        let adapters = LoraAdapters::new(&targets, options.lora_rank, self.backend.device())?;
        self.backend.attach_adapters(&adapters)?;
        let mut opt =
            nn::Adam::default().build(adapters.var_store(), options.diffusion_model_learning_rate)?;
        let adapter_loss =
            self.fit(&scheduler, &latents, &embeddings, &mut opt, adapter_steps, "adapter")?;
        Ok((embeddings, embedding_loss, Some(adapters), Some(adapter_loss)))
    }

    // Noise prediction objective on randomly noised versions of the latents,
    // a fresh timestep and noise are drawn at every step.
    fn fit(
        &self,
        scheduler: &DDIMScheduler,
        latents: &Tensor,
        embeddings: &Tensor,
        opt: &mut nn::Optimizer,
        steps: usize,
        what: &str,
    ) -> Result<f64> {
        let train_timesteps = scheduler.train_timesteps() as i64;
        let log_every = self.training.log_every.max(1);
        let mut last_loss = f64::NAN;
        for step in 0..steps {
            let noise = latents.randn_like();
            let timestep = Tensor::randint(train_timesteps, [1], (Kind::Int64, Device::Cpu))
                .int64_value(&[0]) as usize;
            let noisy_latents = scheduler.add_noise(latents, &noise, timestep);
            let noise_pred = self.backend.predict_noise(&noisy_latents, timestep, embeddings)?;
            let loss = noise_pred.mse_loss(&noise, tch::Reduction::Mean);
            opt.zero_grad();
            self.backend.backward(&loss)?;
            opt.step();
            last_loss = loss.double_value(&[]);
            if !last_loss.is_finite() {
                return Err(Error::Backend(format!("{what} loss diverged at step {step}")));
            }
            debug!("{what} step {}/{steps} timestep {timestep} loss {last_loss:.5}", step + 1);
            if (step + 1) % log_every == 0 || step + 1 == steps {
                info!("{what} step {}/{steps}, loss {last_loss:.5}", step + 1);
            }
        }
        Ok(last_loss)
    }

    /// Prepares the sampling of `options.sample_count` renderings of the
    /// personalized subject, starting close to the homography image.
    pub fn render(
        &mut self,
        state: &PersonalizedState,
        view_prompt: &str,
        homography: &Tensor,
        options: &RenderOptions,
    ) -> Result<Samples<'_, B>> {
        if view_prompt.trim().is_empty() {
            return Err(Error::invalid("the view prompt is empty"));
        }
        if options.sample_count == 0 {
            return Err(Error::invalid("at least one sample has to be requested"));
        }
        let homography_size = image_size(homography)?;
        if homography_size != state.source_size {
            return Err(Error::invalid(format!(
                "the homography image is {homography_size:?} but the source image is {:?}",
                state.source_size
            )));
        }
        let scheduler = DDIMScheduler::new(options.steps, self.scheduler)?;
        match &state.adapters {
            Some(adapters) => self.backend.attach_adapters(adapters)?,
            None => self.backend.detach_adapters()?,
        }
        self.stage = Stage::Rendering;
        let guided = options.guidance_scale > 1.0;
        let (embeddings, posterior) = tch::no_grad(|| -> Result<(Tensor, LatentDistribution)> {
            let cond = self.backend.encode_text(view_prompt)?;
            let embeddings = if guided {
                let uncond = self.backend.encode_text("")?;
                Tensor::cat(&[uncond, cond], 0)
            } else {
                cond
            };
            Ok((embeddings, self.backend.encode_image(homography)?))
        })?;
        info!(
            "Rendering {} samples of \"{view_prompt}\" with {} steps, guidance {}.",
            options.sample_count, options.steps, options.guidance_scale
        );
        Ok(Samples {
            backend: &self.backend,
            scheduler,
            embeddings,
            posterior,
            guided,
            options: options.clone(),
            index: 0,
        })
    }

    /// Ends the current example, its adapters are detached and dropped.
    pub fn finish(&mut self, state: PersonalizedState) -> Result<()> {
        drop(state);
        self.backend.detach_adapters()?;
        self.stage = Stage::Done;
        Ok(())
    }
}

/// Lazily rendered samples, each one runs the whole denoising loop.
pub struct Samples<'a, B: GenerativeBackend> {
    backend: &'a B,
    scheduler: DDIMScheduler,
    embeddings: Tensor,
    posterior: LatentDistribution,
    guided: bool,
    options: RenderOptions,
    index: usize,
}

impl<'a, B: GenerativeBackend> Samples<'a, B> {
    fn sample(&self, index: usize) -> Result<RgbImage> {
        if let Some(seed) = self.options.seed {
            tch::manual_seed(seed.wrapping_add(index as i64))
        }
        let latents = self.posterior.sample() * LATENT_SCALE;
        let mut latents = &latents + latents.randn_like() * self.options.homography_noise_scale;
        let timesteps = self.scheduler.timesteps();
        for (timestep_index, &timestep) in timesteps.iter().enumerate() {
            debug!("Timestep {}/{}", timestep_index + 1, timesteps.len());
            let latent_model_input = if self.guided {
                Tensor::cat(&[&latents, &latents], 0)
            } else {
                latents.shallow_clone()
            };
            let latent_model_input = self.scheduler.scale_model_input(latent_model_input, timestep);
            let noise_pred =
                self.backend.predict_noise(&latent_model_input, timestep, &self.embeddings)?;
            let noise_pred = if self.guided {
                let noise_pred = noise_pred.chunk(2, 0);
                let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
                noise_pred_uncond
                    + (noise_pred_text - noise_pred_uncond) * self.options.guidance_scale
            } else {
                noise_pred
            };
            latents = self.scheduler.step(&noise_pred, timestep, &latents);
        }
        let image = self.backend.decode(&(latents / LATENT_SCALE))?;
        image_io::postprocess(&image)
    }
}

impl<'a, B: GenerativeBackend> Iterator for Samples<'a, B> {
    type Item = Result<RgbImage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.options.sample_count {
            return None;
        }
        let index = self.index;
        self.index += 1;
        debug!("Generating sample {}/{}.", index + 1, self.options.sample_count);
        Some(tch::no_grad(|| self.sample(index)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.options.sample_count - self.index;
        (remaining, Some(remaining))
    }
}

impl<'a, B: GenerativeBackend> ExactSizeIterator for Samples<'a, B> {}
