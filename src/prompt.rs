//! Region prompt embeddings.
//!
//! The text encoder answers one row per prompt. This module turns those rows
//! into exactly one conditioning row per region: foreground prompts are
//! optionally interpolated towards the background prompt, single negatives
//! and single prompts are broadcast, and a background region can be put in
//! front.

use candle_core::{DType, Tensor};

use crate::model::{Conditioning, TextEmbeddings};
use crate::{Error, Result};

/// Where the background prompt goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundMode {
    /// Every encoder row is a foreground prompt.
    None,
    /// Row 0 is the background prompt; it is interpolated into every
    /// foreground row and then dropped.
    Blend,
    /// Row 0 is the background prompt and stays as its own leading region.
    Region,
}

impl BackgroundMode {
    fn has_background_row(self) -> bool {
        !matches!(self, BackgroundMode::None)
    }
}

/// Conditioning for every region, conditional and unconditional.
#[derive(Debug, Clone)]
pub struct RegionEmbeddings {
    pub conditional: Conditioning,
    pub unconditional: Conditioning,
}

impl RegionEmbeddings {
    pub fn num_regions(&self) -> Result<usize> {
        self.conditional.batch_size()
    }

    /// Denoiser conditioning: `[uncond; cond]` with guidance, `cond` without.
    pub fn for_denoiser(&self, guidance: bool) -> Result<Conditioning> {
        if guidance {
            self.conditional.with_unconditional(&self.unconditional)
        } else {
            Ok(self.conditional.clone())
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptBlender {
    mode: BackgroundMode,
    /// One per foreground prompt.
    strengths: Vec<f64>,
    num_masks: usize,
}

impl PromptBlender {
    pub fn new(mode: BackgroundMode, strengths: Vec<f64>, num_masks: usize) -> Self {
        Self {
            mode,
            strengths,
            num_masks,
        }
    }

    pub fn num_prompts(&self) -> usize {
        self.strengths.len()
    }

    pub fn blend(&self, embeddings: &TextEmbeddings) -> Result<RegionEmbeddings> {
        let skip = usize::from(self.mode.has_background_row());
        let prompts = self.num_prompts();
        let got = embeddings.token_embeds.dim(0)?;
        if got != prompts + skip {
            return Err(Error::CountMismatch {
                what: "prompt embeddings",
                expected: prompts + skip,
                got,
            });
        }

        let positive = Conditioning {
            token_embeds: embeddings.token_embeds.clone(),
            pooled_embeds: embeddings.pooled_embeds.clone(),
        };
        let negative = Conditioning {
            token_embeds: embeddings.negative_token_embeds.clone(),
            pooled_embeds: embeddings.negative_pooled_embeds.clone(),
        };

        let conditional = self.resolve(&positive, skip, "prompts")?;
        let unconditional = self.resolve(&negative, skip, "negative prompts")?;

        tracing::debug!(
            mode = ?self.mode,
            prompts,
            regions = conditional.batch_size()?,
            "prompt embeddings blended"
        );

        Ok(RegionEmbeddings {
            conditional,
            unconditional,
        })
    }

    fn resolve(&self, rows: &Conditioning, skip: usize, what: &'static str) -> Result<Conditioning> {
        let prompts = self.num_prompts();
        let total = rows.batch_size()?;
        if total <= skip {
            return Err(Error::CountMismatch {
                what,
                expected: prompts + skip,
                got: total,
            });
        }
        let fg_rows = total - skip;

        let mut token = broadcast_rows(&rows.token_embeds.narrow(0, skip, fg_rows)?, prompts, what)?;
        let mut pooled = broadcast_rows(&rows.pooled_embeds.narrow(0, skip, fg_rows)?, prompts, what)?;

        if self.mode == BackgroundMode::Blend {
            let dtype = rows.token_embeds.dtype();
            let s = strength_column(&self.strengths, &rows.token_embeds)?;
            let wide = s.dtype();
            let bg_token = rows.token_embeds.narrow(0, 0, 1)?.to_dtype(wide)?;
            let bg_pooled = rows.pooled_embeds.narrow(0, 0, 1)?.to_dtype(wide)?;
            token = lerp(&bg_token, &token.to_dtype(wide)?, &s.reshape((prompts, 1, 1))?)?.to_dtype(dtype)?;
            pooled = lerp(&bg_pooled, &pooled.to_dtype(wide)?, &s.reshape((prompts, 1))?)?.to_dtype(dtype)?;
        }

        let mut token = broadcast_rows(&token, self.num_masks, what)?;
        let mut pooled = broadcast_rows(&pooled, self.num_masks, what)?;

        if self.mode == BackgroundMode::Region {
            token = Tensor::cat(&[&rows.token_embeds.narrow(0, 0, 1)?, &token], 0)?;
            pooled = Tensor::cat(&[&rows.pooled_embeds.narrow(0, 0, 1)?, &pooled], 0)?;
        }

        Ok(Conditioning {
            token_embeds: token,
            pooled_embeds: pooled,
        })
    }
}

/// `start + s * (end - start)`, broadcasting all three.
pub fn lerp(start: &Tensor, end: &Tensor, s: &Tensor) -> Result<Tensor> {
    Ok(start.broadcast_add(&end.broadcast_sub(start)?.broadcast_mul(s)?)?)
}

/// Repeat a single row `rows` times; a tensor that already has `rows` rows
/// passes through.
pub fn broadcast_rows(x: &Tensor, rows: usize, what: &'static str) -> Result<Tensor> {
    let got = x.dim(0)?;
    if got == rows {
        return Ok(x.clone());
    }
    if got == 1 {
        let mut repeats = vec![1usize; x.rank()];
        repeats[0] = rows;
        return Ok(x.repeat(repeats)?);
    }
    Err(Error::CountMismatch {
        what,
        expected: rows,
        got,
    })
}

/// `fg + suffix + background` for every foreground prompt.
pub fn with_suffix(prompts: &[String], suffix: &str, background: &str) -> Vec<String> {
    prompts
        .iter()
        .map(|p| format!("{p}{suffix}{background}"))
        .collect()
}

/// Strengths as a `[P]` tensor, at least F32 wide.
fn strength_column(strengths: &[f64], like: &Tensor) -> Result<Tensor> {
    let values: Vec<f32> = strengths.iter().map(|&s| s as f32).collect();
    let dtype = match like.dtype() {
        DType::F16 | DType::BF16 => DType::F32,
        other => other,
    };
    Ok(Tensor::from_vec(values, strengths.len(), like.device())?.to_dtype(dtype)?)
}
