//! Conversions between `image` buffers and candle tensors.
//!
//! Tensor images are channels-first with values in [0, 1].

use candle_core::{DType, Device, Tensor};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageBuffer, Luma, RgbImage};

use crate::{Error, Result};

/// Single-channel float plane, the working format for mask resampling.
pub type Plane = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Resize to `height × width` (bicubic) and convert to `[1, 3, H, W]`.
pub fn image_to_tensor(
    image: &DynamicImage,
    height: usize,
    width: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let rgb = if image.height() as usize == height && image.width() as usize == width {
        image.to_rgb32f()
    } else {
        image
            .resize_exact(width as u32, height as u32, FilterType::CatmullRom)
            .to_rgb32f()
    };
    let hwc = Tensor::from_vec(rgb.into_raw(), (height, width, 3), device)?;
    Ok(hwc
        .permute((2, 0, 1))?
        .unsqueeze(0)?
        .clamp(0f32, 1f32)?
        .to_dtype(dtype)?)
}

/// `[3, H, W]` or `[1, 3, H, W]` in [0, 1] → 8-bit RGB.
pub fn tensor_to_rgb(image: &Tensor) -> Result<RgbImage> {
    let image = match image.rank() {
        4 => image.squeeze(0)?,
        3 => image.clone(),
        _ => return Err(Error::shape("image tensor rank", "3 or 4", image.dims())),
    };
    let (channels, height, width) = image.dims3()?;
    if channels != 3 {
        return Err(Error::shape("image channels", 3, channels));
    }
    let bytes = (image.to_dtype(DType::F32)?.clamp(0f32, 1f32)? * 255.0)?
        .round()?
        .permute((1, 2, 0))?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, bytes)
        .ok_or_else(|| Error::Shape(format!("cannot build {width}x{height} RGB image")))
}

/// The image's last stored channel as a float plane in [0, 1]: alpha when
/// present, luma for grayscale, blue for RGB.
pub fn last_channel_plane(image: &DynamicImage) -> Plane {
    let color = image.color();
    if color.has_alpha() {
        let rgba = image.to_rgba32f();
        Plane::from_fn(rgba.width(), rgba.height(), |x, y| Luma([rgba.get_pixel(x, y)[3]]))
    } else if color.has_color() {
        let rgb = image.to_rgb32f();
        Plane::from_fn(rgb.width(), rgb.height(), |x, y| Luma([rgb.get_pixel(x, y)[2]]))
    } else {
        image.to_luma32f()
    }
}

/// `[H, W]`, `[1, H, W]` or `[1, 1, H, W]` tensor → plane.
pub fn tensor_plane(tensor: &Tensor) -> Result<Plane> {
    let plane = match tensor.rank() {
        2 => tensor.clone(),
        3 => tensor.squeeze(0)?,
        4 => tensor.squeeze(0)?.squeeze(0)?,
        _ => return Err(Error::shape("mask tensor rank", "2, 3 or 4", tensor.dims())),
    };
    let (height, width) = plane.dims2()?;
    let data = plane.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    Plane::from_raw(width as u32, height as u32, data)
        .ok_or_else(|| Error::Shape(format!("cannot build {width}x{height} plane")))
}

/// Bilinear resize; values are kept in [0, 1]. No-op at the same size.
pub fn resize_plane(plane: &Plane, height: usize, width: usize) -> Plane {
    if plane.height() as usize == height && plane.width() as usize == width {
        return plane.clone();
    }
    imageops::resize(plane, width as u32, height as u32, FilterType::Triangle)
}

/// Plane → `[1, H, W]` tensor.
pub fn plane_to_tensor(plane: &Plane, device: &Device) -> Result<Tensor> {
    let (width, height) = plane.dimensions();
    Ok(Tensor::from_vec(
        plane.as_raw().clone(),
        (1, height as usize, width as usize),
        device,
    )?)
}
