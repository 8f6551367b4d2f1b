//! Classifier-free guidance and guidance rescale.

use candle_core::{DType, Tensor};

use crate::{Error, Result};

/// Floor on the guided prediction's std when rescaling.
const MIN_GUIDED_STD: f64 = 1e-6;

/// `uncond + scale * (cond - uncond)`.
pub fn apply_guidance(uncond: &Tensor, cond: &Tensor, scale: f64) -> Result<Tensor> {
    Ok((uncond + ((cond - uncond)? * scale)?)?)
}

/// Match the guided prediction's per-sample std to the conditional one, then
/// mix `rescale` of that with `1 - rescale` of the plain guided prediction.
pub fn rescale_noise_cfg(guided: &Tensor, cond: &Tensor, rescale: f64) -> Result<Tensor> {
    if guided.dims() != cond.dims() {
        return Err(Error::shape("guided prediction", cond.dims(), guided.dims()));
    }
    let dtype = guided.dtype();
    let guided32 = guided.to_dtype(DType::F32)?;
    let cond32 = cond.to_dtype(DType::F32)?;

    let std_cond = per_sample_std(&cond32)?;
    let std_guided = per_sample_std(&guided32)?.maximum(MIN_GUIDED_STD)?;
    let ratio = (std_cond / std_guided)?;
    let mut shape = vec![guided.dim(0)?];
    shape.resize(guided.rank(), 1);
    let ratio = ratio.reshape(shape)?;

    let rescaled = guided32.broadcast_mul(&ratio)?;
    let mixed = ((rescaled * rescale)? + (guided32 * (1.0 - rescale))?)?;
    Ok(mixed.to_dtype(dtype)?)
}

/// Std over every dim but the batch, `[B]`.
fn per_sample_std(x: &Tensor) -> Result<Tensor> {
    Ok(x.flatten_from(1)?.var_keepdim(1)?.sqrt()?.squeeze(1)?)
}

/// Guidance settings for one generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Guidance {
    pub scale: f64,
    pub rescale: f64,
}

impl Guidance {
    pub fn new(scale: f64, rescale: f64) -> Self {
        Self { scale, rescale }
    }

    /// Guidance is on for scales above 1.
    pub fn is_enabled(&self) -> bool {
        self.scale > 1.0
    }

    /// Collapse a denoiser output to one prediction per region.
    ///
    /// With guidance on, `prediction` is `[uncond; cond]` along the batch.
    pub fn combine(&self, prediction: &Tensor) -> Result<Tensor> {
        if !self.is_enabled() {
            return Ok(prediction.clone());
        }
        let batch = prediction.dim(0)?;
        if batch % 2 != 0 {
            return Err(Error::shape("guided batch", "even", batch));
        }
        let half = batch / 2;
        let uncond = prediction.narrow(0, 0, half)?;
        let cond = prediction.narrow(0, half, half)?;
        let guided = apply_guidance(&uncond, &cond, self.scale)?;
        if self.rescale > 0.0 {
            rescale_noise_cfg(&guided, &cond, self.rescale)
        } else {
            Ok(guided)
        }
    }
}
