//! Region-prompted multi-diffusion compositing on candle.
//!
//! Drives a flow-matching denoiser so that several prompts, each bound to a
//! mask, paint one canvas in a single few-step generation. Canvases larger
//! than the model's native size are covered with overlapping tiles.
//!
//! ## Architecture
//!
//! ```text
//! masks ──→ blur / strength / priority decay ──→ per-step quantized masks ──┐
//!                                                                           │
//! prompts ─→ text encoder ─→ background blend ─→ region embeddings ─────────┤
//!                                                                           ↓
//! background ─→ autoencoder ─→ noised background ─→ per step, per tile:
//!                                                    bootstrap → denoise → mask-weighted merge
//!                                                                           ↓
//!                                                   autoencoder decode → blend over background
//! ```
//!
//! ## Modules
//!
//! - [`pipeline`] — request validation, background resolution, end-to-end generation
//! - [`compositor`] — the per-step tiled, mask-weighted denoising loop
//! - [`mask`] — mask preprocessing and quantization
//! - [`prompt`] — background/foreground embedding blending
//! - [`bootstrap`] — early-step region isolation and recentering
//! - [`guidance`] — classifier-free guidance and rescale
//! - [`tiling`] — panorama tile layout and window weights
//! - [`scheduler`] — flash flow-matching noise schedule
//! - [`model`] — traits for the denoiser, autoencoder, text encoder and captioner
//! - [`manager`] — resident pipeline behind an async request queue

pub mod bootstrap;
pub mod compositor;
pub mod config;
pub mod convert;
pub mod guidance;
pub mod manager;
pub mod mask;
pub mod model;
pub mod noise;
pub mod pipeline;
pub mod prompt;
pub mod scheduler;
pub mod tiling;

mod error;
#[cfg(test)]
mod testing;

pub use error::{Error, Result};
