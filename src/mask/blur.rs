//! Separable Gaussian low-pass and mask-weighted blending.

use candle_core::Tensor;

use crate::{Error, Result};

/// Normalised 1-D Gaussian taps covering ±3σ, at least one and at most
/// `max_radius` taps each side.
pub fn gaussian_kernel(std: f64, max_radius: usize) -> Vec<f32> {
    let radius = ((3.0 * std).ceil().max(1.0) as usize).min(max_radius.max(1));
    let denom = 2.0 * std * std;
    let taps: Vec<f64> = (0..=2 * radius)
        .map(|i| {
            let x = i as f64 - radius as f64;
            (-x * x / denom).exp()
        })
        .collect();
    let total: f64 = taps.iter().sum();
    taps.iter().map(|t| (t / total) as f32).collect()
}

/// Isotropic blur of a `[N, 1, H, W]` tensor with edge replication.
pub fn gaussian_blur(masks: &Tensor, std: f64) -> Result<Tensor> {
    let (_, channels, height, width) = masks.dims4()?;
    if channels != 1 {
        return Err(Error::shape("blur input channels", 1, channels));
    }
    // Taps past the mask extent only see replicated edge pixels.
    let taps = gaussian_kernel(std, height.max(width));
    let len = taps.len();
    let radius = (len - 1) / 2;

    let row_kernel = Tensor::from_vec(taps, (1, 1, 1, len), masks.device())?.to_dtype(masks.dtype())?;
    let col_kernel = row_kernel.reshape((1, 1, len, 1))?;

    let blurred = masks
        .pad_with_same(3, radius, radius)?
        .conv2d(&row_kernel, 0, 1, 1, 1)?
        .pad_with_same(2, radius, radius)?
        .conv2d(&col_kernel, 0, 1, 1, 1)?;
    Ok(blurred)
}

/// `mask * foreground + (1 - mask) * background`, broadcasting the mask.
pub fn blend(foreground: &Tensor, background: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let inverse = mask.affine(-1.0, 1.0)?;
    Ok((foreground.broadcast_mul(mask)? + background.broadcast_mul(&inverse)?)?)
}
