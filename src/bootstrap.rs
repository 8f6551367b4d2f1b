//! Early-step region isolation.
//!
//! For the first `bootstrap_steps` steps every region is denoised on its own
//! against a flat reference background, shifted so its mask sits in the
//! middle of the tile. Afterwards pixels that ended up indistinguishable from
//! the reference are dropped from the region's mask, so a region cannot leak
//! the background into the composite.

use candle_core::{D, DType, IndexOp, Tensor};

use crate::scheduler::NoiseSchedule;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootstrapMixer {
    steps: usize,
    mix_steps: f64,
    leak_sensitivity: f64,
}

impl BootstrapMixer {
    pub fn new(steps: usize, mix_steps: f64, leak_sensitivity: f64) -> Result<Self> {
        if steps > 0 && leak_sensitivity <= 0.0 {
            return Err(Error::Config(format!(
                "bootstrap leak sensitivity must be positive, got {leak_sensitivity}"
            )));
        }
        Ok(Self {
            steps,
            mix_steps,
            leak_sensitivity,
        })
    }

    /// No bootstrapping at all.
    pub fn disabled() -> Self {
        Self {
            steps: 0,
            mix_steps: 0.0,
            leak_sensitivity: 1.0,
        }
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn is_active(&self, step: usize) -> bool {
        step < self.steps
    }

    /// Share of the white latent in the reference at `step`.
    pub fn mix_ratio(&self, step: usize) -> f64 {
        (self.mix_steps - step as f64).clamp(0.0, 1.0)
    }

    /// `r * add_noise(white, noise, step) + (1 - r) * known_background`.
    pub fn reference(
        &self,
        schedule: &NoiseSchedule,
        step: usize,
        white: &Tensor,
        noise: &Tensor,
        known_background: &Tensor,
    ) -> Result<Tensor> {
        let ratio = self.mix_ratio(step);
        let white = schedule.add_noise(white, Some(noise), step)?;
        Ok((white * ratio)?.broadcast_add(&(known_background * (1.0 - ratio))?)?)
    }

    /// `(1 - mask) * reference + mask * latents`, one row per region.
    pub fn composite(&self, reference: &Tensor, masks: &Tensor, latents: &Tensor) -> Result<Tensor> {
        crate::mask::blur::blend(latents, reference, masks)
    }

    /// Scale each region's mask by how far its result moved from the
    /// reference: `clip(2 * sigmoid(leak / sensitivity) - 1, 0, 1)` with
    /// `leak = mean_c((denoised - reference)^2)`.
    pub fn suppress_leakage(&self, denoised: &Tensor, reference: &Tensor, masks: &Tensor) -> Result<Tensor> {
        let leak = denoised
            .broadcast_sub(reference)?
            .to_dtype(DType::F32)?
            .sqr()?
            .mean_keepdim(1)?;
        let score = candle_nn::ops::sigmoid(&(leak / self.leak_sensitivity)?)?
            .affine(2.0, -1.0)?
            .clamp(0f32, 1f32)?
            .to_dtype(masks.dtype())?;
        Ok(masks.broadcast_mul(&score)?)
    }
}

/// Per-region `(row, col)` shifts applied by [`center`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recentering {
    shifts: Vec<(i32, i32)>,
}

impl Recentering {
    pub fn shifts(&self) -> &[(i32, i32)] {
        &self.shifts
    }

    /// Undo [`center`]. `latents` may carry a doubled guidance batch.
    pub fn uncenter(&self, latents: &Tensor) -> Result<Tensor> {
        roll_rows(latents, &self.shifts, -1)
    }
}

/// Roll every region so the centre of its mask's bounding box lands on the
/// centre of the tile. Regions with an empty mask are left in place.
///
/// `latents`: `[P, C, h, w]`, `masks`: `[P, 1, h, w]`.
pub fn center(latents: &Tensor, masks: &Tensor) -> Result<(Tensor, Recentering)> {
    let (regions, _, height, width) = masks.dims4()?;
    let occupancy = masks.to_dtype(DType::F32)?.gt(0f64)?.to_dtype(DType::F32)?;
    let rows = occupancy.sum(D::Minus1)?.squeeze(1)?.to_vec2::<f32>()?;
    let cols = occupancy.sum(D::Minus2)?.squeeze(1)?.to_vec2::<f32>()?;

    let mut shifts = Vec::with_capacity(regions);
    for p in 0..regions {
        let shift = match (occupied_span(&rows[p]), occupied_span(&cols[p])) {
            (Some((top, bottom)), Some((left, right))) => {
                let row_center = (top + bottom + 1) / 2;
                let col_center = (left + right + 1) / 2;
                (
                    height as i32 / 2 - row_center as i32,
                    width as i32 / 2 - col_center as i32,
                )
            }
            _ => (0, 0),
        };
        shifts.push(shift);
    }

    let centered = roll_rows(latents, &shifts, 1)?;
    Ok((centered, Recentering { shifts }))
}

/// First and last index with nonzero occupancy.
fn occupied_span(line: &[f32]) -> Option<(usize, usize)> {
    let first = line.iter().position(|&v| v > 0.0)?;
    let last = line.iter().rposition(|&v| v > 0.0)?;
    Some((first, last))
}

/// Roll batch row `b` by `shifts[b % P] * sign`.
fn roll_rows(latents: &Tensor, shifts: &[(i32, i32)], sign: i32) -> Result<Tensor> {
    let batch = latents.dim(0)?;
    if shifts.is_empty() || batch % shifts.len() != 0 {
        return Err(Error::shape("recentered batch", shifts.len(), batch));
    }
    if shifts.iter().all(|&s| s == (0, 0)) {
        return Ok(latents.clone());
    }
    let rolled = (0..batch)
        .map(|b| {
            let (dy, dx) = shifts[b % shifts.len()];
            let row = latents.i(b..b + 1)?;
            Ok(row.roll(dy * sign, D::Minus2)?.roll(dx * sign, D::Minus1)?)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::cat(&rolled, 0)?)
}
