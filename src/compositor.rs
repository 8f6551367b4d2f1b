//! The per-step, per-tile, per-region denoising loop.
//!
//! Every step the running latent is cut into tiles; each tile is denoised
//! once for all regions in a single batched call, the per-region results are
//! weighted by their masks and the tile window, and the weighted sums of all
//! tiles are merged back into one canvas latent. Pixels no region covers are
//! filled from the noised background when one is known.

use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{IndexOp, Tensor};

use crate::bootstrap::{self, BootstrapMixer};
use crate::guidance::Guidance;
use crate::mask::blur;
use crate::model::{Conditioning, Denoiser};
use crate::noise::NoiseGenerator;
use crate::prompt::RegionEmbeddings;
use crate::scheduler::NoiseSchedule;
use crate::tiling::{Tile, TileLayout};
use crate::{Error, Result};

/// Weighted latent sum and weight sum for one step.
#[derive(Debug)]
pub struct CompositeState {
    height: usize,
    width: usize,
    /// `[1, C, h, w]`
    value: Tensor,
    /// `[1, 1, h, w]`
    weight: Tensor,
}

impl CompositeState {
    /// Zeroed state shaped after `latent` (`[1, C, h, w]`).
    pub fn zeros_like(latent: &Tensor) -> Result<Self> {
        let (_, _, height, width) = latent.dims4()?;
        Ok(Self {
            height,
            width,
            value: latent.zeros_like()?,
            weight: Tensor::zeros((1, 1, height, width), latent.dtype(), latent.device())?,
        })
    }

    /// Add one tile's contribution. `weights`: `[P, 1, th, tw]`,
    /// `latents`: `[P, C, th, tw]`.
    pub fn accumulate(&mut self, tile: &Tile, weights: &Tensor, latents: &Tensor) -> Result<()> {
        let value = latents.broadcast_mul(weights)?.sum_keepdim(0)?;
        let weight = weights.sum_keepdim(0)?;
        self.value = (&self.value + tile.pad_to_canvas(&value, self.height, self.width)?)?;
        self.weight = (&self.weight + tile.pad_to_canvas(&weight, self.height, self.width)?)?;
        Ok(())
    }

    /// `value / weight` where covered, `value` elsewhere. Returns the merged
    /// latent and the weight map.
    pub fn merge(self) -> Result<(Tensor, Tensor)> {
        let ones = self.weight.ones_like()?;
        let divisor = self.weight.gt(0f64)?.where_cond(&self.weight, &ones)?;
        let merged = self.value.broadcast_div(&divisor)?;
        Ok((merged, self.weight))
    }
}

/// Everything one composite run consumes. Built once per generation.
pub struct CompositeJob<'a> {
    pub schedule: &'a NoiseSchedule,
    /// `[P, T, 1, h, w]`
    pub masks: &'a Tensor,
    pub embeddings: &'a RegionEmbeddings,
    pub layout: &'a TileLayout,
    /// Noised background latents, `T + 1` entries of `[1, C, h, w]`; the last
    /// one is the clean background.
    pub background: Option<&'a [Tensor]>,
    /// White latent at canvas size; needed while bootstrapping.
    pub white: Option<&'a Tensor>,
    /// `[1, C, h, w]`
    pub initial_latent: Tensor,
    /// Noise the initial latent was drawn with, reused for the bootstrap
    /// reference.
    pub initial_noise: &'a Tensor,
}

/// Result of [`Compositor::run`].
#[derive(Debug, Clone)]
pub struct CompositeOutput {
    pub latent: Tensor,
    pub steps_completed: usize,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Compositor {
    guidance: Guidance,
    bootstrap: BootstrapMixer,
}

impl Compositor {
    pub fn new(guidance: Guidance, bootstrap: BootstrapMixer) -> Self {
        Self { guidance, bootstrap }
    }

    pub fn run<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        job: CompositeJob<'_>,
        noise: &mut NoiseGenerator,
        interrupt: &AtomicBool,
    ) -> Result<CompositeOutput> {
        let schedule = job.schedule;
        let steps = schedule.len();
        let (regions, mask_steps, _, _, _) = job.masks.dims5()?;
        let embedded = job.embeddings.num_regions()?;
        if regions != embedded {
            return Err(Error::CountMismatch {
                what: "region embeddings",
                expected: regions,
                got: embedded,
            });
        }
        if mask_steps != steps {
            return Err(Error::shape("mask steps", steps, mask_steps));
        }
        if let Some(background) = job.background {
            if background.len() != steps + 1 {
                return Err(Error::shape("noised background latents", steps + 1, background.len()));
            }
        }
        if self.bootstrap.steps() > 0 && job.white.is_none() {
            return Err(Error::Validation("bootstrapping needs a white latent".into()));
        }

        let conditioning = job.embeddings.for_denoiser(self.guidance.is_enabled())?;
        let mut latent = job.initial_latent.clone();
        let mut steps_completed = 0;
        let mut interrupted = false;

        for i in 0..steps {
            if interrupt.load(Ordering::SeqCst) {
                tracing::info!(step = i, "generation interrupted");
                interrupted = true;
                break;
            }

            let step_masks = job.masks.i((.., i))?;
            let mut state = CompositeState::zeros_like(&latent)?;
            for tile in &job.layout.tiles {
                let (weights, denoised) = self.denoise_tile(
                    denoiser,
                    &job,
                    &conditioning,
                    tile,
                    i,
                    &latent,
                    &step_masks,
                    regions,
                )?;
                let weights = weights.broadcast_mul(&tile.weight)?;
                state.accumulate(tile, &weights, &denoised)?;
            }

            let (merged, weight) = state.merge()?;
            latent = merged;
            if let Some(background) = job.background {
                let uncovered = weight.affine(-1.0, 1.0)?.clamp(0f32, 1f32)?;
                latent = blur::blend(&background[i + 1], &latent, &uncovered)?;
            }

            if i + 1 < steps {
                let fresh = noise.randn(latent.dims(), latent.dtype(), latent.device())?;
                latent = schedule.add_noise(&latent, Some(&fresh), i + 1)?;
            }
            steps_completed += 1;

            tracing::debug!(
                step = i,
                timestep = schedule.timesteps()[i],
                tiles = job.layout.len(),
                bootstrap = self.bootstrap.is_active(i),
                "step composited"
            );
        }

        Ok(CompositeOutput {
            latent,
            steps_completed,
            interrupted,
        })
    }

    /// Denoise every region on one tile. Returns the region weights
    /// `[P, 1, th, tw]` and the denoised latents `[P, C, th, tw]`.
    #[allow(clippy::too_many_arguments)]
    fn denoise_tile<D: Denoiser + ?Sized>(
        &self,
        denoiser: &D,
        job: &CompositeJob<'_>,
        conditioning: &Conditioning,
        tile: &Tile,
        step: usize,
        latent: &Tensor,
        step_masks: &Tensor,
        regions: usize,
    ) -> Result<(Tensor, Tensor)> {
        let schedule = job.schedule;
        let masks = tile.slice(step_masks)?;
        let mut latents = tile.slice(latent)?.repeat((regions, 1, 1, 1))?;

        let bootstrapping = if self.bootstrap.is_active(step) {
            let known = match job.background {
                Some(background) => tile.slice(&background[step])?,
                None => latents.narrow(0, 0, 1)?,
            };
            let white = job
                .white
                .ok_or_else(|| Error::Validation("bootstrapping needs a white latent".into()))?;
            let reference = self.bootstrap.reference(
                schedule,
                step,
                &tile.slice(white)?,
                &tile.slice(job.initial_noise)?,
                &known,
            )?;
            let composed = self.bootstrap.composite(&reference, &masks, &latents)?;
            let (centered, recentering) = bootstrap::center(&composed, &masks)?;
            latents = centered;
            Some((reference, recentering))
        } else {
            None
        };

        let model_input = if self.guidance.is_enabled() {
            Tensor::cat(&[&latents, &latents], 0)?
        } else {
            latents.clone()
        };
        let batch = model_input.dim(0)?;
        let timestep = Tensor::full(schedule.timesteps()[step] as f32, batch, latent.device())?
            .to_dtype(latent.dtype())?;

        let prediction = denoiser.predict(&model_input, &timestep, conditioning)?;
        if prediction.dims() != model_input.dims() {
            return Err(Error::shape("denoiser output", model_input.dims(), prediction.dims()));
        }
        let prediction = self.guidance.combine(&prediction)?;
        let mut denoised = schedule.step(&prediction, step, &latents)?;

        let mut weights = masks;
        if let Some((reference, recentering)) = bootstrapping {
            denoised = recentering.uncenter(&denoised)?;
            weights = self.bootstrap.suppress_leakage(&denoised, &reference, &weights)?;
        }
        Ok((weights, denoised))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleIndices;
    use crate::scheduler::SchedulerConfig;
    use crate::testing::MockDenoiser;
    use crate::tiling::PanoramaTiler;
    use candle_core::{DType, Device};
    use std::sync::Arc;

    const C: usize = 4;
    const H: usize = 8;
    const W: usize = 16;

    fn schedule() -> NoiseSchedule {
        NoiseSchedule::new(
            &SchedulerConfig::default(),
            &ScheduleIndices::for_bootstrap_steps(0),
            50,
        )
        .unwrap()
    }

    /// One embedding row per region, pooled value `values[p]`.
    fn embeddings(values: &[f32]) -> RegionEmbeddings {
        let device = Device::Cpu;
        let rows = values.len();
        let token: Vec<f32> = values.iter().flat_map(|&v| [v; 6]).collect();
        let pooled: Vec<f32> = values.iter().flat_map(|&v| [v; 3]).collect();
        let cond = Conditioning {
            token_embeds: Tensor::from_vec(token, (rows, 2, 3), &device).unwrap(),
            pooled_embeds: Tensor::from_vec(pooled, (rows, 3), &device).unwrap(),
        };
        RegionEmbeddings {
            unconditional: Conditioning {
                token_embeds: cond.token_embeds.zeros_like().unwrap(),
                pooled_embeds: cond.pooled_embeds.zeros_like().unwrap(),
            },
            conditional: cond,
        }
    }

    /// `[P, T, 1, H, W]` from per-region `[H, W]` column ranges.
    fn column_masks(ranges: &[std::ops::Range<usize>], steps: usize) -> Tensor {
        let planes: Vec<Tensor> = ranges
            .iter()
            .map(|range| {
                let mut data = vec![0f32; H * W];
                for r in 0..H {
                    for c in range.clone() {
                        data[r * W + c] = 1.0;
                    }
                }
                Tensor::from_vec(data, (1, 1, 1, H, W), &Device::Cpu)
                    .unwrap()
                    .repeat((1, steps, 1, 1, 1))
                    .unwrap()
            })
            .collect();
        Tensor::cat(&planes, 0).unwrap()
    }

    fn initial() -> (Tensor, Tensor) {
        let noise = NoiseGenerator::new(Some(11)).randn((1, C, H, W), DType::F32, &Device::Cpu).unwrap();
        (noise.clone(), noise)
    }

    fn run(
        compositor: Compositor,
        masks: &Tensor,
        embeddings: &RegionEmbeddings,
        layout: &TileLayout,
        background: Option<&[Tensor]>,
        white: Option<&Tensor>,
    ) -> CompositeOutput {
        let schedule = schedule();
        let (latent, noise) = initial();
        let job = CompositeJob {
            schedule: &schedule,
            masks,
            embeddings,
            layout,
            background,
            white,
            initial_latent: latent,
            initial_noise: &noise,
        };
        let mut rng = NoiseGenerator::new(Some(3));
        compositor
            .run(&MockDenoiser::new(), job, &mut rng, &AtomicBool::new(false))
            .unwrap()
    }

    fn single_tile() -> TileLayout {
        PanoramaTiler::new(64).unwrap().layout(H, W, &Device::Cpu, DType::F32).unwrap()
    }

    fn plain() -> Compositor {
        Compositor::new(Guidance::new(0.0, 0.0), BootstrapMixer::disabled())
    }

    fn values(x: &Tensor) -> Vec<f32> {
        x.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn assert_close(a: &[f32], b: &[f32], tol: f32) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() <= tol, "element {i}: {x} vs {y}");
        }
    }

    #[test]
    fn full_mask_region_matches_plain_sampling() {
        let schedule = schedule();
        let masks = column_masks(&[0..W], schedule.len());
        let out = run(plain(), &masks, &embeddings(&[0.25]), &single_tile(), None, None);
        assert_eq!(out.steps_completed, schedule.len());
        assert!(!out.interrupted);

        // Hand-rolled loop with the same denoiser and noise stream.
        let denoiser = MockDenoiser::new();
        let cond = embeddings(&[0.25]).conditional;
        let (mut latent, _) = initial();
        let mut rng = NoiseGenerator::new(Some(3));
        for i in 0..schedule.len() {
            let t = Tensor::full(schedule.timesteps()[i] as f32, 1, &Device::Cpu).unwrap();
            let pred = denoiser.predict(&latent, &t, &cond).unwrap();
            latent = schedule.step(&pred, i, &latent).unwrap();
            if i + 1 < schedule.len() {
                let fresh = rng.randn((1, C, H, W), DType::F32, &Device::Cpu).unwrap();
                latent = schedule.add_noise(&latent, Some(&fresh), i + 1).unwrap();
            }
        }
        assert_close(&values(&out.latent), &values(&latent), 1e-5);
    }

    #[test]
    fn region_order_does_not_matter_without_decay() {
        let steps = schedule().len();
        let forward = run(
            plain(),
            &column_masks(&[0..10, 6..16], steps),
            &embeddings(&[0.1, 0.9]),
            &single_tile(),
            None,
            None,
        );
        let reversed = run(
            plain(),
            &column_masks(&[6..16, 0..10], steps),
            &embeddings(&[0.9, 0.1]),
            &single_tile(),
            None,
            None,
        );
        assert_close(&values(&forward.latent), &values(&reversed.latent), 1e-5);
    }

    #[test]
    fn disjoint_regions_match_independent_runs() {
        let steps = schedule().len();
        let joint = run(
            plain(),
            &column_masks(&[0..8, 8..16], steps),
            &embeddings(&[-0.5, 0.5]),
            &single_tile(),
            None,
            None,
        );
        let full = column_masks(&[0..W], steps);
        let left = run(plain(), &full, &embeddings(&[-0.5]), &single_tile(), None, None);
        let right = run(plain(), &full, &embeddings(&[0.5]), &single_tile(), None, None);

        let halves = |x: &Tensor, start| values(&x.narrow(3, start, 8).unwrap());
        assert_close(&halves(&joint.latent, 0), &halves(&left.latent, 0), 1e-5);
        assert_close(&halves(&joint.latent, 8), &halves(&right.latent, 8), 1e-5);
    }

    #[test]
    fn tiling_is_invisible_to_a_pixelwise_denoiser() {
        let steps = schedule().len();
        let masks = column_masks(&[0..10, 6..16], steps);
        let embeddings = embeddings(&[0.2, -0.4]);
        let whole = run(plain(), &masks, &embeddings, &single_tile(), None, None);
        let tiled_layout = PanoramaTiler::new(4).unwrap().layout(H, W, &Device::Cpu, DType::F32).unwrap();
        assert!(tiled_layout.len() > 1);
        let tiled = run(plain(), &masks, &embeddings, &tiled_layout, None, None);
        assert_close(&values(&whole.latent), &values(&tiled.latent), 1e-4);
    }

    #[test]
    fn uncovered_pixels_take_the_background() {
        let schedule = schedule();
        let steps = schedule.len();
        let masks = column_masks(&[0..8], steps);
        let clean = Tensor::full(3f32, (1, C, H, W), &Device::Cpu).unwrap();
        let noise = Tensor::zeros((1, C, H, W), DType::F32, &Device::Cpu).unwrap();
        let background: Vec<Tensor> = (0..=steps)
            .map(|i| schedule.add_noise(&clean, Some(&noise), i).unwrap())
            .collect();
        let out = run(plain(), &masks, &embeddings(&[0.0]), &single_tile(), Some(&background), None);
        let right = values(&out.latent.narrow(3, 8, 8).unwrap());
        assert!(right.iter().all(|&v| (v - 3.0).abs() < 1e-6), "{right:?}");
    }

    #[test]
    fn bootstrap_runs_with_white_reference() {
        let steps = schedule().len();
        let masks = column_masks(&[2..6, 10..14], steps);
        let white = Tensor::ones((1, C, H, W), DType::F32, &Device::Cpu).unwrap();
        let compositor = Compositor::new(Guidance::new(0.0, 0.0), BootstrapMixer::new(1, 1.0, 0.2).unwrap());
        let out = run(compositor, &masks, &embeddings(&[0.3, -0.3]), &single_tile(), None, Some(&white));
        assert_eq!(out.latent.dims(), &[1, C, H, W]);
        assert!(values(&out.latent).iter().all(|v| v.is_finite()));
    }

    /// Run the bootstrap branch of one tile at step 0 on a single region.
    fn bootstrap_tile(
        mask_cols: std::ops::Range<usize>,
        latent: &Tensor,
        white: &Tensor,
        noise: &Tensor,
        pooled: f32,
    ) -> (Tensor, Tensor) {
        let schedule = schedule();
        let masks = column_masks(&[mask_cols], schedule.len());
        let embeddings = embeddings(&[pooled]);
        let layout = single_tile();
        let job = CompositeJob {
            schedule: &schedule,
            masks: &masks,
            embeddings: &embeddings,
            layout: &layout,
            background: None,
            white: Some(white),
            initial_latent: latent.clone(),
            initial_noise: noise,
        };
        let compositor = Compositor::new(Guidance::new(0.0, 0.0), BootstrapMixer::new(1, 1.0, 0.2).unwrap());
        let conditioning = embeddings.for_denoiser(false).unwrap();
        let step_masks = masks.i((.., 0)).unwrap();
        compositor
            .denoise_tile(
                &MockDenoiser::new(),
                &job,
                &conditioning,
                &layout.tiles[0],
                0,
                latent,
                &step_masks,
                1,
            )
            .unwrap()
    }

    #[test]
    fn bootstrap_result_is_uncentered_before_merge() {
        let schedule = schedule();
        let (latent, noise) = initial();
        let white = Tensor::ones((1, C, H, W), DType::F32, &Device::Cpu).unwrap();
        let (_, denoised) = bootstrap_tile(2..6, &latent, &white, &noise, 0.3);

        // Same pixelwise denoise on the uncentered composite.
        let mixer = BootstrapMixer::new(1, 1.0, 0.2).unwrap();
        let mask = column_masks(&[2..6], schedule.len()).i((.., 0)).unwrap();
        let reference = mixer.reference(&schedule, 0, &white, &noise, &latent).unwrap();
        let composite = mixer.composite(&reference, &mask, &latent).unwrap();
        let (_, recentering) = bootstrap::center(&composite, &mask).unwrap();
        assert_eq!(recentering.shifts(), &[(0, 4)]);

        let timestep = Tensor::full(schedule.timesteps()[0] as f32, 1, &Device::Cpu).unwrap();
        let conditioning = embeddings(&[0.3]).for_denoiser(false).unwrap();
        let prediction = MockDenoiser::new().predict(&composite, &timestep, &conditioning).unwrap();
        let expected = schedule.step(&prediction, 0, &composite).unwrap();
        assert_close(&values(&denoised), &values(&expected), 1e-5);
    }

    #[test]
    fn bootstrap_drops_weight_where_result_matches_reference() {
        // Zero white and zero noise make the reference zero; with a zero
        // pooled bias the denoiser keeps zero pixels at zero.
        let zeros = Tensor::zeros((1, C, H, W), DType::F32, &Device::Cpu).unwrap();
        let mut data = vec![10f32; C * H * W];
        for (i, v) in data.iter_mut().enumerate() {
            if i % W < 4 {
                *v = 0.0;
            }
        }
        let latent = Tensor::from_vec(data, (1, C, H, W), &Device::Cpu).unwrap();
        let (weights, _) = bootstrap_tile(0..12, &latent, &zeros, &zeros, 0.0);

        assert_eq!(weights.dims(), &[1, 1, H, W]);
        let plane = weights.i((0, 0)).unwrap().to_vec2::<f32>().unwrap();
        for row in &plane {
            for (col, &w) in row.iter().enumerate() {
                match col {
                    0..4 => assert!(w.abs() < 1e-6, "column {col} leaks reference: {w}"),
                    4..12 => assert!(w > 0.99, "column {col} suppressed: {w}"),
                    _ => assert_eq!(w, 0.0, "column {col} is outside the mask"),
                }
            }
        }
    }

    #[test]
    fn bootstrap_without_white_is_rejected() {
        let schedule = schedule();
        let masks = column_masks(&[0..W], schedule.len());
        let embeddings = embeddings(&[0.3]);
        let layout = single_tile();
        let (latent, noise) = initial();
        let job = CompositeJob {
            schedule: &schedule,
            masks: &masks,
            embeddings: &embeddings,
            layout: &layout,
            background: None,
            white: None,
            initial_latent: latent,
            initial_noise: &noise,
        };
        let compositor = Compositor::new(Guidance::new(0.0, 0.0), BootstrapMixer::new(1, 1.0, 0.2).unwrap());
        let result = compositor.run(
            &MockDenoiser::new(),
            job,
            &mut NoiseGenerator::new(Some(0)),
            &AtomicBool::new(false),
        );
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn guidance_doubles_denoiser_batch() {
        let schedule = schedule();
        let masks = column_masks(&[0..8, 8..16], schedule.len());
        let embeddings = embeddings(&[0.3, 0.6]);
        let layout = single_tile();
        let (latent, noise) = initial();
        let denoiser = MockDenoiser::new();
        let job = CompositeJob {
            schedule: &schedule,
            masks: &masks,
            embeddings: &embeddings,
            layout: &layout,
            background: None,
            white: None,
            initial_latent: latent,
            initial_noise: &noise,
        };
        Compositor::new(Guidance::new(4.0, 0.7), BootstrapMixer::disabled())
            .run(&denoiser, job, &mut NoiseGenerator::new(Some(0)), &AtomicBool::new(false))
            .unwrap();
        assert_eq!(denoiser.batches(), vec![4; schedule.len()]);
    }

    #[test]
    fn interrupt_stops_after_current_step() {
        let schedule = schedule();
        let masks = column_masks(&[0..W], schedule.len());
        let embeddings = embeddings(&[0.1]);
        let layout = single_tile();
        let (latent, noise) = initial();
        let flag = Arc::new(AtomicBool::new(false));
        let denoiser = MockDenoiser::new().interrupt_after(2, flag.clone());
        let job = CompositeJob {
            schedule: &schedule,
            masks: &masks,
            embeddings: &embeddings,
            layout: &layout,
            background: None,
            white: None,
            initial_latent: latent,
            initial_noise: &noise,
        };
        let out = plain()
            .run(&denoiser, job, &mut NoiseGenerator::new(Some(0)), &flag)
            .unwrap();
        assert!(out.interrupted);
        assert_eq!(out.steps_completed, 2);
        assert_eq!(denoiser.calls(), 2);
    }

    #[test]
    fn merge_never_divides_by_zero() {
        let latent = Tensor::zeros((1, 2, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let state = CompositeState::zeros_like(&latent).unwrap();
        let (merged, weight) = state.merge().unwrap();
        assert!(values(&merged).iter().all(|&v| v == 0.0));
        assert!(values(&weight).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn mismatched_embeddings_are_rejected() {
        let schedule = schedule();
        let masks = column_masks(&[0..8, 8..16], schedule.len());
        let embeddings = embeddings(&[0.3]);
        let layout = single_tile();
        let (latent, noise) = initial();
        let job = CompositeJob {
            schedule: &schedule,
            masks: &masks,
            embeddings: &embeddings,
            layout: &layout,
            background: None,
            white: None,
            initial_latent: latent,
            initial_noise: &noise,
        };
        let result = plain().run(
            &MockDenoiser::new(),
            job,
            &mut NoiseGenerator::new(Some(0)),
            &AtomicBool::new(false),
        );
        assert!(matches!(result, Err(Error::CountMismatch { expected: 2, got: 1, .. })));
    }
}
