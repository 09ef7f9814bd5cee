//! # Transformers
//!
//! Text processing feeding the conditioning of the diffusion model.

pub mod clip;
