// A simple wrapper around File::open, a missing file is reported as such
// and any other failure keeps the problematic path in its message.
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tch::Device;

pub(crate) fn file_open<P: AsRef<Path>>(path: P) -> Result<std::fs::File> {
    let path = path.as_ref();
    std::fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::MissingAsset(path.to_path_buf()),
        _ => Error::Io(std::io::Error::new(e.kind(), format!("error opening {path:?}: {e}"))),
    })
}

pub(crate) fn ensure_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        Ok(())
    } else {
        Err(Error::MissingAsset(path.to_path_buf()))
    }
}

/// Explicit device selection, handed to the backend when it gets built.
///
/// Components listed in `cpu` (or all of them with `"all"`) run on the CPU,
/// the others go to the accelerator, optionally pinned to a CUDA ordinal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub cpu: Vec<String>,
    pub cuda_ordinal: Option<usize>,
}

impl DeviceConfig {
    pub fn new(cpu: Vec<String>) -> Self {
        Self { cpu, cuda_ordinal: None }
    }

    pub fn cpu_only() -> Self {
        Self::new(vec!["all".to_string()])
    }

    fn accelerator(&self) -> Device {
        match self.cuda_ordinal {
            Some(ordinal) if tch::Cuda::is_available() => Device::Cuda(ordinal),
            Some(_) => Device::Cpu,
            None if tch::utils::has_mps() => Device::Mps,
            None => Device::cuda_if_available(),
        }
    }

    pub fn get(&self, name: &str) -> Device {
        if self.cpu.iter().any(|c| c == "all" || c == name) {
            Device::Cpu
        } else {
            self.accelerator()
        }
    }
}
