//! Backend running TorchScript exports of Stable Diffusion.
//!
//! Four traced modules are expected:
//! - text encoder: `ids [1, 77] i64 -> hidden states [1, 77, D]`
//! - VAE encoder: `image [1, 3, H, W] -> moments [1, 8, H/8, W/8]`
//! - VAE decoder: `latents [1, 4, H/8, W/8] -> image [1, 3, H, W]`
//! - UNet: `(latents [B, 4, h, w], timestep [] f32, embeddings [B, 77, D]) -> noise [B, 4, h, w]`
//!
//! Traced modules cannot host extra layers, so adapters are applied to the
//! attention weights in place. Before each noise prediction the weights are
//! set to `base + up @ down`, after the backward pass the gradient of each
//! weight is pushed to its `up` and `down` factors.
use super::{is_attention_projection, AdapterTarget, GenerativeBackend, LatentDistribution};
use crate::config::BackendPaths;
use crate::error::{Error, Result};
use crate::lora::{LoraAdapters, LoraLayer};
use crate::transformers::clip;
use crate::utils::DeviceConfig;
use log::{debug, info};
use std::collections::HashMap;
use std::path::Path;
use tch::{CModule, Device, Kind, Tensor};

struct AdaptedWeight {
    weight: Tensor,
    base: Tensor,
    layer: LoraLayer,
}

impl AdaptedWeight {
    /// Keeps a copy of the pretrained value, `weight` then accumulates gradients.
    fn new(weight: Tensor, layer: &LoraLayer) -> Self {
        let base = tch::no_grad(|| weight.detach().copy());
        let _ = weight.set_requires_grad(true);
        Self { weight, base, layer: layer.shallow_clone() }
    }

    fn merge(&self) {
        tch::no_grad(|| {
            let delta = self.layer.delta().to_device(self.base.device()).to_kind(self.base.kind());
            let mut weight = self.weight.shallow_clone();
            weight.copy_(&(&self.base + delta));
        })
    }

    fn restore(&self) {
        tch::no_grad(|| {
            let mut weight = self.weight.shallow_clone();
            weight.copy_(&self.base);
        });
        let _ = self.weight.set_requires_grad(false);
    }
}

/// Pushes the gradient `G` accumulated on each adapted weight to its factors,
/// `G @ down.T` for `up` and `up.T @ G` for `down`, by backpropagating
/// `sum(delta * G)`. The weight gradients are cleared afterwards.
fn backpropagate_to_adapters(adapted: &[AdaptedWeight]) -> Result<()> {
    let mut surrogate: Option<Tensor> = None;
    for adapted in adapted.iter() {
        let grad = adapted.weight.grad();
        if !grad.defined() {
            continue;
        }
        let delta = adapted.layer.delta();
        let grad = grad.detach().to_device(delta.device()).to_kind(Kind::Float);
        let term = (delta * grad).sum(Kind::Float);
        surrogate = Some(match surrogate {
            None => term,
            Some(s) => s + term,
        });
    }
    if let Some(surrogate) = surrogate {
        surrogate.f_backward()?;
    }
    for adapted in adapted.iter() {
        let mut grad = adapted.weight.grad();
        if grad.defined() {
            let _ = grad.zero_();
        }
    }
    Ok(())
}

pub struct TorchScriptBackend {
    tokenizer: clip::Tokenizer,
    text_encoder: CModule,
    vae_encoder: CModule,
    vae_decoder: CModule,
    unet: CModule,
    clip_device: Device,
    vae_device: Device,
    unet_device: Device,
    adapted: Vec<AdaptedWeight>,
}

fn load_frozen(path: &Path, device: Device) -> Result<CModule> {
    crate::utils::ensure_exists(path)?;
    let mut module = CModule::load_on_device(path, device)?;
    module.set_eval();
    for (_name, parameter) in module.named_parameters()? {
        let _ = parameter.set_requires_grad(false);
    }
    Ok(module)
}

impl TorchScriptBackend {
    pub fn load(paths: &BackendPaths, devices: &DeviceConfig) -> Result<Self> {
        let clip_device = devices.get("clip");
        let vae_device = devices.get("vae");
        let unet_device = devices.get("unet");
        info!("Devices: clip {clip_device:?}, vae {vae_device:?}, unet {unet_device:?}.");
        let tokenizer = clip::Tokenizer::create(&paths.vocab, &clip::Config::for_version(paths.clip))?;
        info!("Building the text encoder.");
        let text_encoder = load_frozen(&paths.text_encoder, clip_device)?;
        info!("Building the autoencoder.");
        let vae_encoder = load_frozen(&paths.vae_encoder, vae_device)?;
        let vae_decoder = load_frozen(&paths.vae_decoder, vae_device)?;
        info!("Building the unet.");
        let unet = load_frozen(&paths.unet, unet_device)?;
        Ok(Self {
            tokenizer,
            text_encoder,
            vae_encoder,
            vae_decoder,
            unet,
            clip_device,
            vae_device,
            unet_device,
            adapted: vec![],
        })
    }

    fn unet_parameters(&self) -> Result<HashMap<String, Tensor>> {
        Ok(self.unet.named_parameters()?.into_iter().collect())
    }
}

impl GenerativeBackend for TorchScriptBackend {
    fn device(&self) -> Device {
        self.unet_device
    }

    fn encode_text(&self, prompt: &str) -> Result<Tensor> {
        let tokens = self.tokenizer.encode_tensor(prompt, self.clip_device)?;
        let embeddings = tch::no_grad(|| self.text_encoder.forward_ts(&[tokens]))?;
        Ok(embeddings.to(self.unet_device))
    }

    fn encode_image(&self, image: &Tensor) -> Result<LatentDistribution> {
        let image = image.to_device(self.vae_device);
        let moments = tch::no_grad(|| self.vae_encoder.forward_ts(&[image]))?;
        Ok(LatentDistribution::from_moments(&moments)?.to(self.unet_device))
    }

    fn predict_noise(
        &self,
        latents: &Tensor,
        timestep: usize,
        embeddings: &Tensor,
    ) -> Result<Tensor> {
        for adapted in self.adapted.iter() {
            adapted.merge()
        }
        let timestep = Tensor::from_slice(&[timestep as f32]).squeeze().to(self.unet_device);
        let latents = latents.to_device(self.unet_device);
        let embeddings = embeddings.to_device(self.unet_device);
        Ok(self.unet.forward_ts(&[&latents, &timestep, &embeddings])?)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = latents.to_device(self.vae_device);
        let image = tch::no_grad(|| self.vae_decoder.forward_ts(&[latents]))?;
        Ok(image.to(self.unet_device))
    }

    fn adapter_targets(&self) -> Result<Vec<AdapterTarget>> {
        let mut targets: Vec<AdapterTarget> = self
            .unet
            .named_parameters()?
            .into_iter()
            .filter(|(name, weight)| is_attention_projection(name) && weight.dim() == 2)
            .map(|(name, weight)| {
                let size = weight.size();
                AdapterTarget { name, in_features: size[1], out_features: size[0] }
            })
            .collect();
        targets.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("Found {} attention projections.", targets.len());
        Ok(targets)
    }

    fn attach_adapters(&mut self, adapters: &LoraAdapters) -> Result<()> {
        self.detach_adapters()?;
        let mut parameters = self.unet_parameters()?;
        for layer in adapters.layers() {
            let weight = parameters.remove(layer.name()).ok_or_else(|| {
                Error::Backend(format!("the unet has no parameter {}", layer.name()))
            })?;
            self.adapted.push(AdaptedWeight::new(weight, layer));
        }
        info!("Attached {} adapters to the unet.", self.adapted.len());
        Ok(())
    }

    fn detach_adapters(&mut self) -> Result<()> {
        for adapted in self.adapted.drain(..) {
            adapted.restore()
        }
        Ok(())
    }

    fn backward(&self, loss: &Tensor) -> Result<()> {
        loss.f_backward()?;
        if self.adapted.is_empty() {
            return Ok(());
        }
        backpropagate_to_adapters(&self.adapted)
    }
}

impl Drop for TorchScriptBackend {
    fn drop(&mut self) {
        let _ = self.detach_adapters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &Tensor, b: &Tensor) -> bool {
        a.allclose(b, 1e-4, 1e-5, false)
    }

    #[test]
    fn weight_gradients_reach_the_factors() -> Result<()> {
        tch::manual_seed(3);
        let target = AdapterTarget { name: "mid_block.attn1.to_k.weight".into(), in_features: 4, out_features: 3 };
        let adapters = LoraAdapters::new(&[target], 2, Device::Cpu)?;
        let layer = &adapters.layers()[0];
        tch::no_grad(|| {
            let mut up = layer.up().shallow_clone();
            up.copy_(&Tensor::randn([3, 2], tch::kind::FLOAT_CPU));
        });
        let weight = Tensor::randn([3, 4], tch::kind::FLOAT_CPU);
        let pretrained = weight.copy();
        let adapted = AdaptedWeight::new(weight, layer);
        adapted.merge();
        assert!(close(&adapted.weight, &(&pretrained + layer.delta().detach())));

        let xs = Tensor::randn([5, 4], tch::kind::FLOAT_CPU);
        let loss = xs.matmul(&adapted.weight.tr()).square().sum(Kind::Float);
        loss.f_backward()?;
        let weight_grad = adapted.weight.grad().copy();
        let adapted = [adapted];
        backpropagate_to_adapters(&adapted)?;

        let (up, down) = (layer.up().detach(), layer.down().detach());
        assert!(close(&layer.up().grad(), &weight_grad.matmul(&down.tr())));
        assert!(close(&layer.down().grad(), &up.tr().matmul(&weight_grad)));
        assert_eq!(adapted[0].weight.grad().abs().sum(Kind::Float).double_value(&[]), 0.);

        adapted[0].restore();
        assert!(adapted[0].weight.equal(&pretrained));
        assert!(!adapted[0].weight.requires_grad());
        Ok(())
    }

    #[test]
    fn nothing_to_push_without_a_backward_pass() -> Result<()> {
        let target = AdapterTarget { name: "mid_block.attn1.to_v.weight".into(), in_features: 2, out_features: 2 };
        let adapters = LoraAdapters::new(&[target], 1, Device::Cpu)?;
        let adapted = [AdaptedWeight::new(Tensor::ones([2, 2], tch::kind::FLOAT_CPU), &adapters.layers()[0])];
        backpropagate_to_adapters(&adapted)?;
        assert!(!adapters.layers()[0].up().grad().defined());
        Ok(())
    }
}
