#![allow(dead_code)]
// A tiny stand-in for the pretrained networks, small enough to train in tests.
use aerialbooth::{
    backend::{AdapterTarget, GenerativeBackend, LatentDistribution},
    config::PipelineConfig,
    lora::{LoraAdapters, LoraLayer},
    Error, Result,
};
use image::{Rgb, RgbImage};
use std::cell::RefCell;
use std::path::Path;
use tch::{kind, Device, Kind, Tensor};

/// Prompts containing this marker fail to encode.
pub const FAIL_MARKER: &str = "[fail]";
pub const PROJECTION: &str = "toy.transformer_blocks.0.attn1.to_q.weight";
const EMBEDDING_DIM: i64 = 8;

pub struct ToyBackend {
    weight: Tensor,
    adapter: Option<LoraLayer>,
    // When set, the adapted projection fails both to run and to be restored.
    broken_adapters: bool,
    encoded_images: RefCell<Vec<Tensor>>,
    timesteps: RefCell<Vec<usize>>,
}

impl ToyBackend {
    pub fn new() -> Self {
        let weight = Tensor::eye(4, kind::FLOAT_CPU) * 0.5;
        Self {
            weight,
            adapter: None,
            broken_adapters: false,
            encoded_images: RefCell::new(vec![]),
            timesteps: RefCell::new(vec![]),
        }
    }

    pub fn with_broken_adapters() -> Self {
        Self { broken_adapters: true, ..Self::new() }
    }

    pub fn has_adapter(&self) -> bool {
        self.adapter.is_some()
    }

    /// The images given to the encoder so far, oldest first.
    pub fn take_encoded_images(&self) -> Vec<Tensor> {
        std::mem::take(&mut *self.encoded_images.borrow_mut())
    }

    /// The timesteps of the noise predictions so far, oldest first.
    pub fn take_timesteps(&self) -> Vec<usize> {
        std::mem::take(&mut *self.timesteps.borrow_mut())
    }
}

impl GenerativeBackend for ToyBackend {
    fn device(&self) -> Device {
        Device::Cpu
    }

    fn encode_text(&self, prompt: &str) -> Result<Tensor> {
        if prompt.contains(FAIL_MARKER) {
            return Err(Error::Backend(format!("cannot encode {prompt:?}")));
        }
        let seed = prompt.bytes().fold(7u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        let phase = (seed % 1000) as f64 / 100.;
        let embeddings = (Tensor::arange(77 * EMBEDDING_DIM, kind::FLOAT_CPU) * 0.1 + phase).sin();
        Ok(embeddings.view([1, 77, EMBEDDING_DIM]))
    }

    fn encode_image(&self, image: &Tensor) -> Result<LatentDistribution> {
        self.encoded_images.borrow_mut().push(image.detach().copy());
        let pooled = image.avg_pool2d([8, 8], [8, 8], [0, 0], false, true, None);
        let mean = Tensor::cat(&[&pooled, &pooled.narrow(1, 0, 1)], 1);
        let logvar = mean.zeros_like() - 10.;
        LatentDistribution::from_moments(&Tensor::cat(&[mean, logvar], 1))
    }

    fn predict_noise(&self, latents: &Tensor, timestep: usize, embeddings: &Tensor) -> Result<Tensor> {
        self.timesteps.borrow_mut().push(timestep);
        let weight = match &self.adapter {
            Some(_) if self.broken_adapters => {
                return Err(Error::Backend("the adapted projection cannot run".to_string()))
            }
            Some(layer) => &self.weight + layer.delta(),
            None => self.weight.shallow_clone(),
        };
        let xs = latents.permute([0, 2, 3, 1]).matmul(&weight.tr()).permute([0, 3, 1, 2]);
        let ones = Tensor::ones([77 * EMBEDDING_DIM, 1], kind::FLOAT_CPU);
        let cond = embeddings.flatten(1, -1).matmul(&ones) / (77 * EMBEDDING_DIM) as f64;
        Ok(xs + cond.view([-1, 1, 1, 1]) + timestep as f64 * 1e-5)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = latents.size4()?;
        Ok(latents.narrow(1, 0, 3).upsample_nearest2d([h * 8, w * 8], None, None).tanh())
    }

    fn adapter_targets(&self) -> Result<Vec<AdapterTarget>> {
        Ok(vec![AdapterTarget { name: PROJECTION.to_string(), in_features: 4, out_features: 4 }])
    }

    fn attach_adapters(&mut self, adapters: &LoraAdapters) -> Result<()> {
        let layer = adapters
            .get(PROJECTION)
            .ok_or_else(|| Error::Backend(format!("no adapter for {PROJECTION}")))?;
        self.adapter = Some(layer.shallow_clone());
        Ok(())
    }

    fn detach_adapters(&mut self) -> Result<()> {
        if self.adapter.take().is_some() && self.broken_adapters {
            return Err(Error::Backend("the pretrained weights cannot be restored".to_string()));
        }
        Ok(())
    }
}

/// A configuration fast enough for tests, 64x64 images and a few steps.
pub fn small_config() -> PipelineConfig {
    PipelineConfig {
        text_embedding_optimization_steps: 2,
        model_fine_tuning_optimization_steps: 2,
        num_inference_steps: 4,
        sample_count: 2,
        width: 64,
        height: 64,
        log_every: 1,
        ..PipelineConfig::default()
    }
}

pub fn gradient(width: u32, height: u32, tint: u8) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, tint])
    })
}

pub fn write_image<P: AsRef<Path>>(path: P, image: &RgbImage) {
    let path = path.as_ref();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    image.save(path).unwrap();
}

pub fn max_abs(tensor: &Tensor) -> f64 {
    tensor.abs().max().to_kind(Kind::Double).double_value(&[])
}
