//! LoRA (Low-Rank Adaptation) parameters
//!
//! Each adapted weight `W` of shape `[out, in]` gets a trainable pair
//! `down: [rank, in]` and `up: [out, rank]`, the effective weight being
//! `W + scale * up @ down`. `up` starts at zero so a fresh adapter set leaves
//! the network unchanged.
use crate::backend::AdapterTarget;
use crate::error::{Error, Result};
use log::info;
use tch::{nn, Device, Tensor};

#[derive(Debug)]
pub struct LoraLayer {
    name: String,
    down: Tensor,
    up: Tensor,
    scale: f64,
}

impl LoraLayer {
    /// Name of the adapted weight in the backend network.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rank(&self) -> i64 {
        self.down.size()[0]
    }

    /// The low-rank update to add to the adapted weight.
    pub fn delta(&self) -> Tensor {
        self.up.matmul(&self.down) * self.scale
    }

    pub fn up(&self) -> &Tensor {
        &self.up
    }

    pub fn down(&self) -> &Tensor {
        &self.down
    }

    /// A second handle on the same parameters, gradients flow to the originals.
    pub fn shallow_clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            down: self.down.shallow_clone(),
            up: self.up.shallow_clone(),
            scale: self.scale,
        }
    }
}

/// A fresh set of adapters, owned by a single example.
pub struct LoraAdapters {
    vs: nn::VarStore,
    layers: Vec<LoraLayer>,
}

impl std::fmt::Debug for LoraAdapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoraAdapters").field("layers", &self.layers.len()).finish()
    }
}

impl LoraAdapters {
    pub fn new(targets: &[AdapterTarget], rank: i64, device: Device) -> Result<Self> {
        if rank <= 0 {
            return Err(Error::invalid(format!("adapter rank must be positive, got {rank}")));
        }
        if targets.is_empty() {
            return Err(Error::Backend("the backend exposes no attention weights".to_string()));
        }
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let layers = targets
            .iter()
            .enumerate()
            .map(|(index, target)| {
                // Variable names cannot contain dots, the backend name is kept aside.
                let p = &root / format!("layer{index}");
                let down = p.var(
                    "down",
                    &[rank, target.in_features],
                    nn::Init::Randn { mean: 0., stdev: 1. / rank as f64 },
                );
                let up = p.var("up", &[target.out_features, rank], nn::Init::Const(0.));
                LoraLayer { name: target.name.clone(), down, up, scale: 1.0 }
            })
            .collect();
        let adapters = Self { vs, layers };
        info!(
            "Created {} adapters of rank {rank}, {} parameters.",
            adapters.layers.len(),
            adapters.num_parameters()
        );
        Ok(adapters)
    }

    pub fn layers(&self) -> &[LoraLayer] {
        &self.layers
    }

    pub fn get(&self, name: &str) -> Option<&LoraLayer> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn num_parameters(&self) -> i64 {
        self.vs.trainable_variables().iter().map(|t| t.numel() as i64).sum()
    }

    /// Saves the adapter weights, the layer order follows the backend targets.
    pub fn save<T: AsRef<std::path::Path>>(&self, path: T) -> Result<()> {
        self.vs.save(path)?;
        Ok(())
    }
}
