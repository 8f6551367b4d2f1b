//! Overlapping tile layout for canvases larger than the model's native size.
//!
//! Tiles are `min(t, dim)` wide with a half-tile stride; the last tile on
//! each axis is snapped to the canvas edge. Overlaps are cross-faded with a
//! raised-cosine window, normalised so the weights of all tiles sum to one at
//! every latent pixel.

use std::f64::consts::PI;

use candle_core::{D, DType, Device, Tensor};

use crate::{Error, Result};

/// One window of the canvas, in latent pixels (end-exclusive).
#[derive(Debug, Clone)]
pub struct Tile {
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
    /// `[1, 1, th, tw]`
    pub weight: Tensor,
}

impl Tile {
    pub fn height(&self) -> usize {
        self.row_end - self.row_start
    }

    pub fn width(&self) -> usize {
        self.col_end - self.col_start
    }

    /// Crop the last two dims of `x` to this tile.
    pub fn slice(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x
            .narrow(D::Minus2, self.row_start, self.height())?
            .narrow(D::Minus1, self.col_start, self.width())?)
    }

    /// Zero-pad a tile-sized tensor back to a `height × width` canvas.
    pub fn pad_to_canvas(&self, x: &Tensor, height: usize, width: usize) -> Result<Tensor> {
        Ok(x
            .pad_with_zeros(D::Minus2, self.row_start, height - self.row_end)?
            .pad_with_zeros(D::Minus1, self.col_start, width - self.col_end)?)
    }
}

/// Tiles for one canvas.
#[derive(Debug, Clone)]
pub struct TileLayout {
    pub height: usize,
    pub width: usize,
    pub tiles: Vec<Tile>,
}

impl TileLayout {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn is_single(&self) -> bool {
        self.tiles.len() == 1
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PanoramaTiler {
    /// Tile edge in latent pixels.
    tile_size: usize,
}

impl PanoramaTiler {
    pub fn new(tile_size: usize) -> Result<Self> {
        if tile_size == 0 {
            return Err(Error::Config("tile size must be positive".into()));
        }
        Ok(Self { tile_size })
    }

    pub fn tile_size(&self) -> usize {
        self.tile_size
    }

    pub fn layout(&self, height: usize, width: usize, device: &Device, dtype: DType) -> Result<TileLayout> {
        if height == 0 || width == 0 {
            return Err(Error::shape("canvas", "non-empty", (height, width)));
        }
        let t = self.tile_size;
        if height <= t && width <= t {
            let weight = Tensor::ones((1, 1, height, width), dtype, device)?;
            return Ok(TileLayout {
                height,
                width,
                tiles: vec![Tile {
                    row_start: 0,
                    row_end: height,
                    col_start: 0,
                    col_end: width,
                    weight,
                }],
            });
        }

        let rows = axis_starts(height, t);
        let cols = axis_starts(width, t);
        let tile_h = t.min(height);
        let tile_w = t.min(width);
        let row_window = axis_window(tile_h, rows.len() > 1);
        let col_window = axis_window(tile_w, cols.len() > 1);

        // Sum of raw windows over all tiles, for normalisation.
        let mut total = vec![0f64; height * width];
        for &r in &rows {
            for &c in &cols {
                for (y, wy) in row_window.iter().enumerate() {
                    let line = (r + y) * width + c;
                    for (x, wx) in col_window.iter().enumerate() {
                        total[line + x] += wy * wx;
                    }
                }
            }
        }

        let mut tiles = Vec::with_capacity(rows.len() * cols.len());
        for &r in &rows {
            for &c in &cols {
                let mut weight = Vec::with_capacity(tile_h * tile_w);
                for (y, wy) in row_window.iter().enumerate() {
                    let line = (r + y) * width + c;
                    for (x, wx) in col_window.iter().enumerate() {
                        weight.push((wy * wx / total[line + x]) as f32);
                    }
                }
                let weight = Tensor::from_vec(weight, (1, 1, tile_h, tile_w), device)?.to_dtype(dtype)?;
                tiles.push(Tile {
                    row_start: r,
                    row_end: r + tile_h,
                    col_start: c,
                    col_end: c + tile_w,
                    weight,
                });
            }
        }

        tracing::debug!(
            height,
            width,
            tile_size = t,
            rows = rows.len(),
            cols = cols.len(),
            "panorama tiling"
        );

        Ok(TileLayout { height, width, tiles })
    }
}

/// Tile start offsets along one axis; the last tile ends at `dim`.
fn axis_starts(dim: usize, tile: usize) -> Vec<usize> {
    if dim <= tile {
        return vec![0];
    }
    let stride = (tile / 2).max(1);
    let mut starts = Vec::new();
    let mut start = 0;
    while start + tile < dim {
        starts.push(start);
        start += stride;
    }
    starts.push(dim - tile);
    starts
}

/// Raised-cosine window sampled at pixel centres, or flat for a lone tile.
fn axis_window(len: usize, overlapping: bool) -> Vec<f64> {
    if !overlapping {
        return vec![1.0; len];
    }
    (0..len)
        .map(|x| {
            let phase = (x as f64 + 0.5) / len as f64;
            0.5 - 0.5 * (2.0 * PI * phase).cos()
        })
        .collect()
}
