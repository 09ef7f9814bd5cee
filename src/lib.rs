//! # Novel view synthesis by personalized diffusion
//!
//! Aerial, back, bottom and side renderings of the subject of a single image,
//! using Torch via [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! This library includes:
//! - An Imagic-style edit pipeline, optimizing a text embedding then low-rank
//!   adapters on the source image before sampling from a homography guess.
//! - A batch driver running worklists of examples with per-example failures
//!   isolated, and a temporal mode chaining video frames.
//! - Contact sheets of the outputs and a frame-to-video assembler.
//!
//! The pretrained networks are loaded from TorchScript exports of Stable
//! Diffusion, see [`backend::TorchScriptBackend`].

pub mod backend;
pub mod composite;
pub mod config;
pub mod driver;
pub mod error;
pub mod image_io;
pub mod lora;
pub mod pipeline;
pub mod schedulers;
pub mod transformers;
pub mod utils;
pub mod video;
pub mod view;
pub mod worklist;

pub use error::{Error, Result};
