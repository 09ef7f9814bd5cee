//! Run configuration, every option has the default used by the experiments.
use crate::error::{Error, Result};
use crate::schedulers::ddim::DDIMSchedulerConfig;
use crate::transformers::clip::ClipVersion;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Reads a JSON document into some configuration type.
pub fn load_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let file = crate::utils::file_open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Adam step size while optimizing the text embedding.
    pub embedding_learning_rate: f64,
    /// Adam step size while fine-tuning the adapters.
    pub diffusion_model_learning_rate: f64,
    pub text_embedding_optimization_steps: usize,
    pub model_fine_tuning_optimization_steps: usize,
    /// Classifier-free guidance strength, 1.0 disables guidance.
    pub guidance_scale: f64,
    pub num_inference_steps: usize,
    /// Embedding blend factor, accepted but not used by the guidance formula.
    pub alpha: f64,
    /// Base seed for sampling, sample `i` of a render uses `seed + i`.
    pub seed: Option<i64>,
    /// Seed applied once before personalizing, training is unseeded otherwise.
    pub train_seed: Option<i64>,
    pub sample_count: usize,
    /// Standard deviation of the noise added to the homography latent.
    pub homography_noise_scale: f64,
    pub lora_rank: i64,
    pub width: u32,
    pub height: u32,
    /// Log the training loss at info level every so many steps.
    pub log_every: usize,
    pub scheduler: DDIMSchedulerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            embedding_learning_rate: 1e-3,
            diffusion_model_learning_rate: 2e-4,
            text_embedding_optimization_steps: 1000,
            model_fine_tuning_optimization_steps: 500,
            guidance_scale: 7.5,
            num_inference_steps: 50,
            alpha: 0.1,
            seed: Some(0),
            train_seed: None,
            sample_count: 5,
            homography_noise_scale: 0.1,
            lora_rank: 4,
            width: 512,
            height: 512,
            log_every: 100,
            scheduler: DDIMSchedulerConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.width % 8 != 0 || self.height % 8 != 0 {
            return Err(Error::invalid(format!(
                "`height` and `width` have to be divisible by 8 but are {} and {}",
                self.height, self.width
            )));
        }
        if self.sample_count == 0 {
            return Err(Error::invalid("sample_count must be at least 1"));
        }
        if self.num_inference_steps == 0
            || self.num_inference_steps > self.scheduler.train_timesteps
        {
            return Err(Error::invalid(format!(
                "num_inference_steps must be in 1..={}",
                self.scheduler.train_timesteps
            )));
        }
        if self.embedding_learning_rate <= 0. || self.diffusion_model_learning_rate <= 0. {
            return Err(Error::invalid("learning rates must be positive"));
        }
        if self.lora_rank <= 0 {
            return Err(Error::invalid("lora_rank must be positive"));
        }
        Ok(())
    }
}

/// Locations of the tokenizer vocabulary and of the TorchScript exports of
/// the pretrained networks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendPaths {
    pub vocab: PathBuf,
    pub text_encoder: PathBuf,
    pub vae_encoder: PathBuf,
    pub vae_decoder: PathBuf,
    pub unet: PathBuf,
    pub clip: ClipVersion,
}

impl Default for BackendPaths {
    fn default() -> Self {
        Self::in_dir("data")
    }
}

impl BackendPaths {
    /// The default file names inside some directory.
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            vocab: dir.join("bpe_simple_vocab_16e6.txt"),
            text_encoder: dir.join("text_encoder.pt"),
            vae_encoder: dir.join("vae_encoder.pt"),
            vae_decoder: dir.join("vae_decoder.pt"),
            unet: dir.join("unet.pt"),
            clip: ClipVersion::V2_1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"guidance_scale": 1.0, "seed": null, "scheduler": {"set_alpha_to_one": true}}"#,
        )
        .unwrap();
        assert_eq!(config.guidance_scale, 1.0);
        assert_eq!(config.seed, None);
        assert_eq!(config.text_embedding_optimization_steps, 1000);
        assert!(config.scheduler.set_alpha_to_one);
        assert_eq!(config.scheduler.train_timesteps, 1000);
        config.validate().unwrap();
    }

    #[test]
    fn validation() {
        let config = PipelineConfig { width: 500, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));
        let config = PipelineConfig { sample_count: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backend_paths() {
        let paths: BackendPaths = serde_json::from_str(r#"{"clip": "v1_5"}"#).unwrap();
        assert_eq!(paths.clip, ClipVersion::V1_5);
        assert_eq!(paths.unet, PathBuf::from("data/unet.pt"));
    }
}
