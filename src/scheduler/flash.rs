//! Few-step flow-matching schedule over a subset of a reference timeline.
//!
//! Coefficients for step `t` of the selected subset:
//! ```text
//! sigma[t]            reference[indices[t]]
//! sigma_next[t]       sigma[t + 1], 0 after the last step
//! noise_level[t]      sigma[t] / sqrt(sigma[t]^2 + 1)
//! next_noise_level[t] noise_level[t + 1], 0 after the last step
//! timestep[t]         sigma[t] * num_train_timesteps
//! ```
//!
//! The noise levels double as the quantization thresholds for region masks.
//! A schedule is a value: reconfiguring means building a new one.

use candle_core::{DType, Device, Tensor};

use super::SchedulerConfig;
use crate::{Error, Result};

/// Immutable per-generation noise schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    step_indices: Vec<usize>,
    reference_steps: usize,
    timesteps: Vec<f64>,
    sigmas: Vec<f64>,
    sigmas_next: Vec<f64>,
    noise_levels: Vec<f64>,
    next_noise_levels: Vec<f64>,
}

impl NoiseSchedule {
    /// Build a schedule from strictly increasing indices into a reference
    /// timeline of `reference_steps` entries.
    pub fn new(
        config: &SchedulerConfig,
        step_indices: &[usize],
        reference_steps: usize,
    ) -> Result<Self> {
        if step_indices.is_empty() {
            return Err(Error::Config("schedule needs at least one step".into()));
        }
        if let Some(pair) = step_indices.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(Error::Config(format!(
                "step indices must be strictly increasing, found {} then {}",
                pair[0], pair[1]
            )));
        }
        let last = step_indices[step_indices.len() - 1];
        if last >= reference_steps {
            return Err(Error::Config(format!(
                "step index {last} out of range for a {reference_steps}-step reference timeline"
            )));
        }

        let reference = config.reference_sigmas(reference_steps);
        let sigmas: Vec<f64> = step_indices.iter().map(|&i| reference[i]).collect();
        let noise_levels: Vec<f64> = sigmas.iter().map(|s| s / (s * s + 1.0).sqrt()).collect();
        let timesteps = sigmas
            .iter()
            .map(|s| s * config.num_train_timesteps as f64)
            .collect();

        Ok(Self {
            step_indices: step_indices.to_vec(),
            reference_steps,
            timesteps,
            sigmas_next: shift_left(&sigmas),
            next_noise_levels: shift_left(&noise_levels),
            sigmas,
            noise_levels,
        })
    }

    /// Use every step of an `num_steps`-long reference timeline.
    pub fn uniform(config: &SchedulerConfig, num_steps: usize) -> Result<Self> {
        let indices: Vec<usize> = (0..num_steps).collect();
        Self::new(config, &indices, num_steps)
    }

    /// Number of selected steps `T`.
    pub fn len(&self) -> usize {
        self.sigmas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sigmas.is_empty()
    }

    pub fn step_indices(&self) -> &[usize] {
        &self.step_indices
    }

    pub fn reference_steps(&self) -> usize {
        self.reference_steps
    }

    /// Model-facing timesteps (sigma × training timesteps).
    pub fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    pub fn sigmas_next(&self) -> &[f64] {
        &self.sigmas_next
    }

    pub fn noise_levels(&self) -> &[f64] {
        &self.noise_levels
    }

    pub fn next_noise_levels(&self) -> &[f64] {
        &self.next_noise_levels
    }

    /// Denoise-only step: `latent - noise_pred * sigma[idx]`.
    ///
    /// Computed in a wider dtype and narrowed back to the latent's dtype.
    pub fn step(&self, noise_pred: &Tensor, idx: usize, latent: &Tensor) -> Result<Tensor> {
        let sigma = *self.sigmas.get(idx).ok_or_else(|| {
            Error::Config(format!(
                "step index {idx} out of range for a {}-step schedule",
                self.len()
            ))
        })?;
        if noise_pred.dims() != latent.dims() {
            return Err(Error::shape(
                "noise prediction",
                latent.dims(),
                noise_pred.dims(),
            ));
        }

        let dtype = latent.dtype();
        let wide = wide_dtype(dtype, latent.device());
        let latent_wide = latent.to_dtype(wide)?;
        let pred_wide = noise_pred.to_dtype(wide)?;
        let prev_sample = (latent_wide - (pred_wide * sigma)?)?;
        Ok(prev_sample.to_dtype(dtype)?)
    }

    /// Noise-add step: `(1 - sigma[idx]) * latent + sigma[idx] * noise`.
    ///
    /// Identity for `idx >= len()`, which is how the loop finishes after the
    /// last step. Fresh noise is drawn when `noise` is `None`.
    pub fn add_noise(&self, latent: &Tensor, noise: Option<&Tensor>, idx: usize) -> Result<Tensor> {
        let Some(&sigma) = self.sigmas.get(idx) else {
            return Ok(latent.clone());
        };
        let noise = match noise {
            Some(noise) => noise.clone(),
            None => latent.randn_like(0.0, 1.0)?,
        };
        Ok(((latent * (1.0 - sigma))? + (noise * sigma)?)?)
    }
}

fn shift_left(values: &[f64]) -> Vec<f64> {
    values.iter().skip(1).copied().chain([0.0]).collect()
}

/// Intermediate dtype for the scheduler step.
fn wide_dtype(dtype: DType, device: &Device) -> DType {
    match dtype {
        DType::F16 | DType::BF16 => DType::F32,
        DType::F32 if !device.is_metal() => DType::F64,
        other => other,
    }
}
