//! Contracts for the external models the compositor drives.
//!
//! The pipeline never looks inside these; it only relies on the shapes
//! documented on each method. Implementations report failures through
//! [`crate::Error`] (usually [`crate::Error::Candle`] or
//! [`crate::Error::Model`]) and the pipeline propagates them unchanged.
//!
//! ## Components
//!
//! - [`Denoiser`] — the diffusion transformer / U-Net
//! - [`Autoencoder`] — image ↔ latent
//! - [`TextEncoder`] — prompts → token and pooled embeddings
//! - [`Captioner`] — image → prompt, for backgrounds given without one

use candle_core::Tensor;
use image::DynamicImage;

use crate::{Error, Result};

/// Text conditioning for one denoiser batch.
#[derive(Debug, Clone)]
pub struct Conditioning {
    /// `[B, S, D]`
    pub token_embeds: Tensor,
    /// `[B, D_pooled]`
    pub pooled_embeds: Tensor,
}

impl Conditioning {
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.token_embeds.dim(0)?)
    }

    /// Stack `[uncond; cond]` along the batch for classifier-free guidance.
    pub fn with_unconditional(&self, unconditional: &Conditioning) -> Result<Conditioning> {
        Ok(Conditioning {
            token_embeds: Tensor::cat(&[&unconditional.token_embeds, &self.token_embeds], 0)?,
            pooled_embeds: Tensor::cat(&[&unconditional.pooled_embeds, &self.pooled_embeds], 0)?,
        })
    }
}

/// Noise-predicting diffusion model.
pub trait Denoiser {
    /// `latent`: `[B, C, h, w]`, `timestep`: `[B]`, conditioning batch `B`.
    ///
    /// Returns a prediction shaped like `latent`. With guidance the batch is
    /// doubled: first half unconditional, second half conditional.
    fn predict(&self, latent: &Tensor, timestep: &Tensor, conditioning: &Conditioning)
    -> Result<Tensor>;
}

/// Variational autoencoder between pixel space and latent space.
pub trait Autoencoder {
    /// `[B, 3, H, W]` in [0, 1] → `[B, C, H/f, W/f]`, scaling factor applied.
    fn encode(&self, image: &Tensor) -> Result<Tensor>;

    /// Inverse of [`Autoencoder::encode`]; output clipped to [0, 1].
    fn decode(&self, latent: &Tensor) -> Result<Tensor>;

    /// Latent channel count `C`.
    fn latent_channels(&self) -> usize;

    /// Spatial downscale factor `f`.
    fn downscale_factor(&self) -> usize {
        8
    }
}

/// Output of [`TextEncoder::encode`].
#[derive(Debug, Clone)]
pub struct TextEmbeddings {
    /// `[N, S, D]`
    pub token_embeds: Tensor,
    /// `[N, D_pooled]`
    pub pooled_embeds: Tensor,
    /// `[M, S, D]`
    pub negative_token_embeds: Tensor,
    /// `[M, D_pooled]`
    pub negative_pooled_embeds: Tensor,
}

impl TextEmbeddings {
    /// Check the encoder answered one row per prompt.
    pub(crate) fn check_rows(&self, prompts: usize, negative_prompts: usize) -> Result<()> {
        let rows = [
            ("token embeddings", self.token_embeds.dim(0)?, prompts),
            ("pooled embeddings", self.pooled_embeds.dim(0)?, prompts),
            (
                "negative token embeddings",
                self.negative_token_embeds.dim(0)?,
                negative_prompts,
            ),
            (
                "negative pooled embeddings",
                self.negative_pooled_embeds.dim(0)?,
                negative_prompts,
            ),
        ];
        for (what, got, expected) in rows {
            if got != expected {
                return Err(Error::shape(what, expected, got));
            }
        }
        Ok(())
    }
}

/// Prompt encoder.
pub trait TextEncoder {
    fn encode(&self, prompts: &[String], negative_prompts: &[String]) -> Result<TextEmbeddings>;
}

/// Image captioning model.
pub trait Captioner {
    fn caption(&self, image: &DynamicImage) -> Result<String>;
}
