//! Region mask preprocessing.
//!
//! Turns user masks into a per-step coverage schedule:
//!
//! 1. resize to the pixel canvas (bilinear)
//! 2. decay a mask by `cover_alpha` wherever a higher-priority mask covers it
//! 3. Gaussian blur per region (kept as `masks_blurred` for final blending)
//! 4. scale by per-region strength
//! 5. downscale to latent size (nearest), then quantize against the
//!    schedule's noise levels
//!
//! Quantization is pixelwise, so quantizing after the nearest-neighbour
//! downscale gives the same result as quantizing first, at a fraction of the
//! memory.
//!
//! - [`blur`] — Gaussian low-pass and the final mask blend

pub mod blur;

use candle_core::{DType, Device, IndexOp, Tensor};
use image::DynamicImage;

use crate::config::MaskType;
use crate::convert::{self, Plane};
use crate::scheduler::NoiseSchedule;
use crate::{Error, Result};

/// Std substituted for non-positive blur stds once any region blurs.
const MIN_MASK_STD: f64 = 1e-5;

/// A user mask.
#[derive(Debug, Clone)]
pub enum MaskInput {
    /// Image mask read from its last channel (alpha for RGBA, luma for
    /// grayscale, blue for RGB). In boolean mode values below one half are
    /// selected; otherwise coverage is `1 - value`.
    Image(DynamicImage),
    /// Coverage in [0, 1], `[H, W]`, `[1, H, W]` or `[1, 1, H, W]`, used as-is.
    Alpha(Tensor),
}

/// One region's mask plus the knobs that shape it.
#[derive(Debug, Clone)]
pub struct MaskRegion {
    pub mask: MaskInput,
    pub strength: f64,
    pub std: f64,
    /// Higher priority is drawn on top and decays lower-priority masks.
    pub priority: usize,
}

/// Canvas geometry and quantization settings.
#[derive(Debug, Clone, Copy)]
pub struct MaskSettings {
    pub height: usize,
    pub width: usize,
    pub latent_height: usize,
    pub latent_width: usize,
    pub cover_alpha: f64,
    pub mask_type: MaskType,
    pub use_boolean_mask: bool,
}

/// Output of [`MaskPreprocessor::process`].
#[derive(Debug, Clone)]
pub struct PreparedMasks {
    /// `[P, T, 1, h, w]`, quantized per step.
    pub masks: Tensor,
    /// `[P, 1, H, W]`, blurred but neither strength-scaled nor quantized.
    pub masks_blurred: Tensor,
    /// Blur std actually applied per region.
    pub stds: Vec<f64>,
}

impl PreparedMasks {
    pub fn num_regions(&self) -> Result<usize> {
        Ok(self.masks.dim(0)?)
    }

    /// Canvas not claimed by any region: `clip(1 - Σ masks, 0, 1)`,
    /// `[T, 1, h, w]`.
    pub fn background(&self) -> Result<Tensor> {
        Ok(self.masks.sum(0)?.affine(-1.0, 1.0)?.clamp(0f32, 1f32)?)
    }

    /// Put `mask` (`[T, 1, h, w]`) in front as region 0.
    pub fn with_leading_region(mut self, mask: &Tensor) -> Result<Self> {
        let mask = mask.to_dtype(self.masks.dtype())?.unsqueeze(0)?;
        self.masks = Tensor::cat(&[&mask, &self.masks], 0)?;
        Ok(self)
    }
}

/// Mask preprocessor bound to one schedule and canvas.
pub struct MaskPreprocessor<'a> {
    schedule: &'a NoiseSchedule,
    settings: MaskSettings,
    device: Device,
    dtype: DType,
}

impl<'a> MaskPreprocessor<'a> {
    pub fn new(
        schedule: &'a NoiseSchedule,
        settings: MaskSettings,
        device: &Device,
        dtype: DType,
    ) -> Self {
        Self {
            schedule,
            settings,
            device: device.clone(),
            dtype,
        }
    }

    pub fn process(&self, regions: &[MaskRegion]) -> Result<PreparedMasks> {
        if regions.is_empty() {
            return Err(Error::Validation("mask preprocessing needs at least one mask".into()));
        }

        let masks = regions
            .iter()
            .map(|region| self.load(&region.mask))
            .collect::<Result<Vec<_>>>()?;
        let masks = self.decay_overlaps(masks, regions)?;

        let mut stds: Vec<f64> = regions.iter().map(|r| r.std).collect();
        let masks = if stds.iter().any(|&s| s > 0.0) {
            for (region, std) in stds.iter_mut().enumerate().filter(|(_, s)| **s <= 0.0) {
                tracing::warn!(region, std = *std, "non-positive mask std, using {MIN_MASK_STD}");
                *std = MIN_MASK_STD;
            }
            masks
                .iter()
                .zip(&stds)
                .map(|(mask, &std)| blur::gaussian_blur(mask, std))
                .collect::<Result<Vec<_>>>()?
        } else {
            masks
        };
        let masks_blurred = Tensor::cat(&masks, 0)?;

        let strengths: Vec<f32> = regions.iter().map(|r| r.strength as f32).collect();
        let strengths = Tensor::from_vec(strengths, (regions.len(), 1, 1, 1), &self.device)?;
        let scaled = masks_blurred.broadcast_mul(&strengths)?;

        let latent = scaled.upsample_nearest2d(self.settings.latent_height, self.settings.latent_width)?;
        let quantized = self.quantize(&latent)?.to_dtype(self.dtype)?;

        tracing::debug!(
            regions = regions.len(),
            steps = self.schedule.len(),
            mask_type = ?self.settings.mask_type,
            "masks prepared"
        );

        Ok(PreparedMasks {
            masks: quantized,
            masks_blurred,
            stds,
        })
    }

    /// Mask → `[1, 1, H, W]` F32 coverage at canvas resolution.
    fn load(&self, mask: &MaskInput) -> Result<Tensor> {
        let plane: Plane = match mask {
            MaskInput::Image(image) => {
                let mut plane = convert::last_channel_plane(image);
                let boolean = self.settings.use_boolean_mask;
                for value in plane.iter_mut() {
                    *value = if boolean {
                        if *value < 0.5 { 1.0 } else { 0.0 }
                    } else {
                        (1.0 - *value).clamp(0.0, 1.0)
                    };
                }
                plane
            }
            MaskInput::Alpha(tensor) => {
                let mut plane = convert::tensor_plane(tensor)?;
                for value in plane.iter_mut() {
                    *value = value.clamp(0.0, 1.0);
                }
                plane
            }
        };
        let plane = convert::resize_plane(&plane, self.settings.height, self.settings.width);
        Ok(convert::plane_to_tensor(&plane, &self.device)?.unsqueeze(0)?)
    }

    fn decay_overlaps(&self, masks: Vec<Tensor>, regions: &[MaskRegion]) -> Result<Vec<Tensor>> {
        let alpha = self.settings.cover_alpha;
        if alpha <= 0.0 {
            return Ok(masks);
        }
        masks
            .iter()
            .enumerate()
            .map(|(i, mask)| {
                let covering: Vec<&Tensor> = masks
                    .iter()
                    .zip(regions)
                    .filter(|(_, other)| other.priority > regions[i].priority)
                    .map(|(m, _)| m)
                    .collect();
                if covering.is_empty() {
                    return Ok(mask.clone());
                }
                let covered = Tensor::cat(&covering, 0)?.sum_keepdim(0)?.gt(0f64)?;
                Ok(covered.where_cond(&(mask * alpha)?, mask)?)
            })
            .collect()
    }

    /// `[P, 1, h, w]` → `[P, T, 1, h, w]`.
    fn quantize(&self, masks: &Tensor) -> Result<Tensor> {
        let levels = self.schedule.noise_levels();
        let next_levels = self.schedule.next_noise_levels();
        let last = levels.len() - 1;

        let steps = (0..levels.len())
            .map(|t| {
                let continuous = match self.settings.mask_type {
                    MaskType::Discrete => false,
                    MaskType::SemiContinuous => t == last,
                    MaskType::Continuous => true,
                };
                if continuous {
                    let span = levels[t] - next_levels[t];
                    Ok(((masks - next_levels[t])? / span)?.clamp(0f32, 1f32)?)
                } else {
                    Ok(masks.gt(levels[t])?.to_dtype(DType::F32)?)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&steps, 1)?)
    }
}

/// Fraction of pixels covered (> 0) by region `p` at step `t`.
pub fn coverage(masks: &Tensor, p: usize, t: usize) -> Result<f32> {
    let step = masks.i((p, t))?.to_dtype(DType::F32)?;
    Ok(step.gt(0f64)?.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()?)
}
