//! Lightweight stand-ins for the external models.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::model::{Autoencoder, Captioner, Conditioning, Denoiser, TextEmbeddings, TextEncoder};
use crate::{Error, Result};

/// Pixelwise denoiser: `0.5 * latent + mean(pooled row)`.
#[derive(Debug, Default)]
pub struct MockDenoiser {
    calls: AtomicUsize,
    batches: Mutex<Vec<usize>>,
    interrupt: Option<(usize, Arc<AtomicBool>)>,
}

impl MockDenoiser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `flag` once `calls` predictions have been made.
    pub fn interrupt_after(mut self, calls: usize, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some((calls, flag));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

impl Denoiser for MockDenoiser {
    fn predict(&self, latent: &Tensor, timestep: &Tensor, conditioning: &Conditioning) -> Result<Tensor> {
        let (batch, _, _, _) = latent.dims4()?;
        if conditioning.batch_size()? != batch || timestep.dim(0)? != batch {
            return Err(Error::Model(format!(
                "batch {batch} does not match conditioning {} / timesteps {}",
                conditioning.batch_size()?,
                timestep.dim(0)?
            )));
        }
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.batches.lock().unwrap().push(batch);
        if let Some((after, flag)) = &self.interrupt {
            if calls >= *after {
                flag.store(true, Ordering::SeqCst);
            }
        }
        let bias = conditioning
            .pooled_embeds
            .mean_keepdim(1)?
            .reshape((batch, 1, 1, 1))?
            .to_dtype(latent.dtype())?;
        Ok((latent * 0.5)?.broadcast_add(&bias)?)
    }
}

/// 8× average-pool encoder with four latent channels (RGB + mean).
#[derive(Debug, Default)]
pub struct MockAutoencoder {
    encodes: AtomicUsize,
}

impl MockAutoencoder {
    pub fn encodes(&self) -> usize {
        self.encodes.load(Ordering::SeqCst)
    }
}

impl Autoencoder for MockAutoencoder {
    fn encode(&self, image: &Tensor) -> Result<Tensor> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        let pooled = image.avg_pool2d(8)?;
        let mean = pooled.mean_keepdim(1)?;
        Ok(Tensor::cat(&[&pooled, &mean], 1)?)
    }

    fn decode(&self, latent: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = latent.dims4()?;
        Ok(latent
            .narrow(1, 0, 3)?
            .upsample_nearest2d(h * 8, w * 8)?
            .clamp(0f32, 1f32)?)
    }

    fn latent_channels(&self) -> usize {
        4
    }
}

/// Encodes a prompt as rows filled with `len(prompt) / 100`.
#[derive(Debug, Default)]
pub struct MockTextEncoder {
    requests: Mutex<Vec<(Vec<String>, Vec<String>)>>,
}

impl MockTextEncoder {
    pub fn requests(&self) -> Vec<(Vec<String>, Vec<String>)> {
        self.requests.lock().unwrap().clone()
    }

    fn rows(prompts: &[String]) -> Result<(Tensor, Tensor)> {
        let values: Vec<f32> = prompts.iter().map(|p| p.len() as f32 / 100.0).collect();
        let token: Vec<f32> = values.iter().flat_map(|&v| [v; 8]).collect();
        let pooled: Vec<f32> = values.iter().flat_map(|&v| [v; 3]).collect();
        Ok((
            Tensor::from_vec(token, (prompts.len(), 2, 4), &Device::Cpu)?,
            Tensor::from_vec(pooled, (prompts.len(), 3), &Device::Cpu)?,
        ))
    }
}

impl TextEncoder for MockTextEncoder {
    fn encode(&self, prompts: &[String], negative_prompts: &[String]) -> Result<TextEmbeddings> {
        self.requests
            .lock()
            .unwrap()
            .push((prompts.to_vec(), negative_prompts.to_vec()));
        let (token_embeds, pooled_embeds) = Self::rows(prompts)?;
        let (negative_token_embeds, negative_pooled_embeds) = Self::rows(negative_prompts)?;
        Ok(TextEmbeddings {
            token_embeds,
            pooled_embeds,
            negative_token_embeds,
            negative_pooled_embeds,
        })
    }
}

#[derive(Debug)]
pub struct MockCaptioner {
    calls: Arc<AtomicUsize>,
    caption: String,
}

impl MockCaptioner {
    pub fn new(caption: &str) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: calls.clone(),
                caption: caption.to_string(),
            },
            calls,
        )
    }
}

impl Captioner for MockCaptioner {
    fn caption(&self, _image: &DynamicImage) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.caption.clone())
    }
}

/// Solid-colour RGB image.
pub fn solid_image(width: u32, height: u32, rgb: [u8; 3]) -> DynamicImage {
    DynamicImage::ImageRgb8(image::RgbImage::from_pixel(width, height, image::Rgb(rgb)))
}

/// Route `tracing` output through the test harness; `RUST_LOG` filters it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
