//! # Generative backends
//!
//! The pretrained networks are opaque to the rest of the crate, the pipeline
//! only relies on the operations of [`GenerativeBackend`].

use crate::error::{Error, Result};
use crate::lora::LoraAdapters;
use tch::{Device, Tensor};

pub mod torchscript;

pub use torchscript::TorchScriptBackend;

/// Scaling applied to VAE latents before they reach the UNet.
pub const LATENT_SCALE: f64 = 0.18215;

/// A weight of the denoising network that can receive a low-rank adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterTarget {
    pub name: String,
    pub in_features: i64,
    pub out_features: i64,
}

/// Whether a parameter name designates one of the projections of an attention
/// block, both self (`attn1`) and cross (`attn2`) attention.
pub fn is_attention_projection(name: &str) -> bool {
    let in_attention = name.contains(".attn1.") || name.contains(".attn2.");
    let projection = ["to_q.weight", "to_k.weight", "to_v.weight", "to_out.0.weight"]
        .iter()
        .any(|suffix| name.ends_with(suffix));
    in_attention && projection
}

/// The posterior of the image encoder.
#[derive(Debug)]
pub struct LatentDistribution {
    mean: Tensor,
    std: Tensor,
}

impl LatentDistribution {
    /// Splits encoder moments, mean and log-variance stacked on the channel dim.
    pub fn from_moments(moments: &Tensor) -> Result<Self> {
        let size = moments.size();
        if size.len() != 4 || size[1] % 2 != 0 {
            return Err(Error::Backend(format!("unexpected encoder moments shape {size:?}")));
        }
        let parameters = moments.chunk(2, 1);
        let (mean, logvar) = (&parameters[0], &parameters[1]);
        let std = (logvar.clamp(-30., 20.) * 0.5).exp();
        Ok(Self { mean: mean.shallow_clone(), std })
    }

    pub fn sample(&self) -> Tensor {
        &self.mean + &self.std * Tensor::randn_like(&self.mean)
    }

    pub fn size(&self) -> Vec<i64> {
        self.mean.size()
    }

    pub fn to(&self, device: Device) -> Self {
        Self { mean: self.mean.to(device), std: self.std.to(device) }
    }
}

/// The operations the pipeline needs from a pretrained latent diffusion model.
///
/// All tensors returned are on [`GenerativeBackend::device`]. Encoders and the
/// decoder run without gradient tracking, `predict_noise` keeps the graph so
/// that losses can be backpropagated to the text embedding or the adapters.
pub trait GenerativeBackend {
    fn device(&self) -> Device;

    /// Text embedding of a prompt, `[1, seq_len, dim]`.
    fn encode_text(&self, prompt: &str) -> Result<Tensor>;

    /// Latent posterior of an image `[1, 3, H, W]` with values in `[-1, 1]`.
    /// Samples are unscaled, multiply them by [`LATENT_SCALE`].
    fn encode_image(&self, image: &Tensor) -> Result<LatentDistribution>;

    /// Noise residual predicted for scaled latents at some training timestep.
    fn predict_noise(&self, latents: &Tensor, timestep: usize, embeddings: &Tensor)
        -> Result<Tensor>;

    /// Image `[1, 3, H, W]` in `[-1, 1]` from unscaled latents.
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;

    /// The weights that `attach_adapters` can specialize.
    fn adapter_targets(&self) -> Result<Vec<AdapterTarget>>;

    /// Makes subsequent noise predictions go through the given adapters,
    /// replacing any adapters attached before.
    fn attach_adapters(&mut self, adapters: &LoraAdapters) -> Result<()>;

    /// Restores the pretrained network.
    fn detach_adapters(&mut self) -> Result<()>;

    /// Backpropagates a loss computed from `predict_noise` outputs.
    fn backward(&self, loss: &Tensor) -> Result<()> {
        loss.f_backward()?;
        Ok(())
    }
}
