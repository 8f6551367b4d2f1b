//! Region-prompted generation.
//!
//! [`MultiDiffusionPipeline::generate`] takes a [`GenerationRequest`] of
//! prompt/mask pairs plus an optional background and runs:
//!
//! 1. request validation and per-region override resolution
//! 2. mask preprocessing ([`crate::mask`])
//! 3. background resolution (given image, caption, white, or generated as
//!    its own region)
//! 4. prompt encoding and blending ([`crate::prompt`])
//! 5. the composite denoising loop ([`crate::compositor`])
//! 6. decoding and blending the result over the background
//!
//! A request without prompts returns the background, or a plain sample of
//! the background prompt. Prompts always need region masks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, RgbImage};

use crate::bootstrap::BootstrapMixer;
use crate::compositor::{CompositeJob, CompositeOutput, Compositor};
use crate::config::{MaskType, OutputType, PerRegion, PipelineConfig};
use crate::convert;
use crate::guidance::Guidance;
use crate::mask::{MaskInput, MaskPreprocessor, MaskRegion, MaskSettings, blur};
use crate::model::{Autoencoder, Captioner, Denoiser, TextEncoder};
use crate::noise::NoiseGenerator;
use crate::prompt::{self, BackgroundMode, PromptBlender, RegionEmbeddings};
use crate::scheduler::NoiseSchedule;
use crate::tiling::PanoramaTiler;
use crate::{Error, Result};

/// Prompt used for the implicit white background.
pub const WHITE_BACKGROUND_PROMPT: &str = "simple white background image";

/// Timestep below which generation starts from the noised background rather
/// than pure noise.
const PURE_NOISE_TIMESTEP: f64 = 999.0;

/// One foreground region for [`GenerationRequest::from_regions`].
#[derive(Debug, Clone)]
pub struct RegionPrompt {
    pub prompt: String,
    pub negative_prompt: String,
    pub mask: MaskInput,
    /// Mask strength.
    pub strength: f64,
}

impl RegionPrompt {
    pub fn new(prompt: impl Into<String>, mask: MaskInput) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            mask,
            strength: 1.0,
        }
    }

    pub fn negative(mut self, negative_prompt: impl Into<String>) -> Self {
        self.negative_prompt = negative_prompt.into();
        self
    }

    pub fn strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }
}

/// Parameters for one generation. Unset options fall back to the pipeline's
/// [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompts: Vec<String>,
    /// One per prompt, or a single one shared by all prompts.
    pub negative_prompts: Vec<String>,
    pub masks: Vec<MaskInput>,
    /// Draw order per mask; defaults to the mask index.
    pub priorities: Option<Vec<usize>>,
    /// Appended with the background prompt to every foreground prompt.
    pub suffix: Option<String>,
    pub background: Option<DynamicImage>,
    pub background_prompt: Option<String>,
    pub background_negative_prompt: String,
    pub height: usize,
    pub width: usize,
    /// Use this many uniform steps instead of the configured schedule.
    pub num_inference_steps: Option<usize>,
    pub guidance_scale: Option<f64>,
    pub guidance_rescale: Option<f64>,
    pub prompt_strengths: PerRegion,
    pub mask_strengths: PerRegion,
    pub mask_stds: PerRegion,
    pub use_boolean_mask: bool,
    /// Blend the decoded image over the background through the blurred masks.
    pub do_blend: bool,
    /// Tile size in pixels.
    pub tile_size: Option<usize>,
    pub bootstrap_steps: Option<usize>,
    pub bootstrap_mix_steps: Option<f64>,
    pub bootstrap_leak_sensitivity: Option<f64>,
    pub mask_cover_alpha: Option<f64>,
    pub mask_type: Option<MaskType>,
    pub output_type: OutputType,
    pub seed: Option<u64>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompts: Vec::new(),
            negative_prompts: vec![String::new()],
            masks: Vec::new(),
            priorities: None,
            suffix: None,
            background: None,
            background_prompt: None,
            background_negative_prompt: String::new(),
            height: 1024,
            width: 1024,
            num_inference_steps: None,
            guidance_scale: None,
            guidance_rescale: None,
            prompt_strengths: PerRegion::Default,
            mask_strengths: PerRegion::Default,
            mask_stds: PerRegion::Default,
            use_boolean_mask: true,
            do_blend: true,
            tile_size: None,
            bootstrap_steps: None,
            bootstrap_mix_steps: None,
            bootstrap_leak_sensitivity: None,
            mask_cover_alpha: None,
            mask_type: None,
            output_type: OutputType::Image,
            seed: None,
        }
    }
}

impl GenerationRequest {
    /// Build a request from per-region tuples; region strengths become mask
    /// strengths.
    pub fn from_regions(regions: Vec<RegionPrompt>) -> Self {
        Self {
            prompts: regions.iter().map(|r| r.prompt.clone()).collect(),
            negative_prompts: regions.iter().map(|r| r.negative_prompt.clone()).collect(),
            mask_strengths: PerRegion::Each(regions.iter().map(|r| r.strength).collect()),
            masks: regions.into_iter().map(|r| r.mask).collect(),
            ..Self::default()
        }
    }

    pub fn with_size(mut self, height: usize, width: usize) -> Self {
        self.height = height;
        self.width = width;
        self
    }

    pub fn with_background(mut self, background: DynamicImage) -> Self {
        self.background = Some(background);
        self
    }

    pub fn with_background_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.background_prompt = Some(prompt.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_output(mut self, output_type: OutputType) -> Self {
        self.output_type = output_type;
        self
    }
}

/// Decoded or raw generation result.
#[derive(Debug, Clone)]
pub enum GenerationOutput {
    Image(RgbImage),
    /// `[3, H, W]` in [0, 1].
    Tensor(Tensor),
    /// `[1, C, h, w]`.
    Latent(Tensor),
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub output: GenerationOutput,
    pub steps_completed: usize,
    pub interrupted: bool,
}

/// Background resolved for one request.
struct KnownBackground {
    /// `[1, 3, H, W]` in [0, 1].
    image: Tensor,
    /// `[1, C, h, w]`
    latent: Tensor,
}

/// Region-prompted multi-diffusion over a denoiser, an autoencoder and a text
/// encoder.
pub struct MultiDiffusionPipeline<D, A, T> {
    denoiser: D,
    autoencoder: A,
    text_encoder: T,
    captioner: Option<Box<dyn Captioner + Send>>,
    config: PipelineConfig,
    schedule: NoiseSchedule,
    /// White latent at the largest size requested so far.
    white: Option<Tensor>,
    interrupt: Arc<AtomicBool>,
    device: Device,
    dtype: DType,
}

impl<D: Denoiser, A: Autoencoder, T: TextEncoder> MultiDiffusionPipeline<D, A, T> {
    pub fn new(
        denoiser: D,
        autoencoder: A,
        text_encoder: T,
        config: PipelineConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let schedule = NoiseSchedule::new(&config.scheduler, &config.t_index_list, config.reference_steps)?;
        tracing::info!(
            steps = schedule.len(),
            indices = ?schedule.step_indices(),
            device = ?device,
            dtype = ?dtype,
            "multi-diffusion pipeline ready"
        );
        Ok(Self {
            denoiser,
            autoencoder,
            text_encoder,
            captioner: None,
            config,
            schedule,
            white: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            device: device.clone(),
            dtype,
        })
    }

    /// Captioner used for backgrounds given without a prompt.
    pub fn with_captioner(mut self, captioner: impl Captioner + Send + 'static) -> Self {
        self.captioner = Some(Box::new(captioner));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn denoiser(&self) -> &D {
        &self.denoiser
    }

    pub fn autoencoder(&self) -> &A {
        &self.autoencoder
    }

    pub fn text_encoder(&self) -> &T {
        &self.text_encoder
    }

    /// Shared flag that stops a running generation after its current step.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    /// Replace the resident schedule with one over `step_indices` of a
    /// `reference_steps`-long timeline. On error the old schedule stays.
    pub fn prepare_schedule(&mut self, step_indices: &[usize], reference_steps: usize) -> Result<()> {
        let schedule = NoiseSchedule::new(&self.config.scheduler, step_indices, reference_steps)?;
        tracing::debug!(indices = ?step_indices, reference_steps, "schedule prepared");
        self.schedule = schedule;
        Ok(())
    }

    pub fn generate(&mut self, request: &GenerationRequest) -> Result<Generation> {
        self.interrupt.store(false, Ordering::SeqCst);
        let factor = self.autoencoder.downscale_factor();
        if factor == 0 {
            return Err(Error::Validation("autoencoder reports a zero downscale factor".into()));
        }
        let (height, width) = (request.height, request.width);
        if height == 0 || width == 0 || height % factor != 0 || width % factor != 0 {
            return Err(Error::Validation(format!(
                "canvas {height}x{width} must be a positive multiple of {factor}"
            )));
        }

        let schedule = match request.num_inference_steps {
            Some(steps) => NoiseSchedule::uniform(&self.config.scheduler, steps)?,
            None => self.schedule.clone(),
        };

        if request.prompts.is_empty() {
            return self.background_only(request, &schedule);
        }
        if request.masks.is_empty() {
            return Err(Error::Validation(format!(
                "{} prompts given without any region mask",
                request.prompts.len()
            )));
        }

        self.generate_regions(request, &schedule)
    }

    fn generate_regions(&mut self, request: &GenerationRequest, schedule: &NoiseSchedule) -> Result<Generation> {
        let num_masks = request.masks.len();
        let num_prompts = request.prompts.len();
        let num_negatives = request.negative_prompts.len();
        if num_prompts != num_masks && num_prompts != 1 {
            return Err(Error::CountMismatch {
                what: "prompts",
                expected: num_masks,
                got: num_prompts,
            });
        }
        if num_negatives != num_prompts && num_negatives != 1 {
            return Err(Error::CountMismatch {
                what: "negative prompts",
                expected: num_prompts,
                got: num_negatives,
            });
        }

        let config = &self.config;
        let mask_strengths = request
            .mask_strengths
            .resolve(config.mask_strength, num_masks, "mask strengths")?;
        let mask_stds = request.mask_stds.resolve(config.mask_std, num_masks, "mask stds")?;
        let prompt_strengths =
            request
                .prompt_strengths
                .resolve(config.prompt_strength, num_prompts, "prompt strengths")?;
        let priorities = match &request.priorities {
            Some(p) if p.len() == num_masks => p.clone(),
            Some(p) => {
                return Err(Error::CountMismatch {
                    what: "mask priorities",
                    expected: num_masks,
                    got: p.len(),
                });
            }
            None => (0..num_masks).collect(),
        };

        let regions: Vec<MaskRegion> = request
            .masks
            .iter()
            .zip(mask_strengths)
            .zip(mask_stds)
            .zip(priorities)
            .map(|(((mask, strength), std), priority)| MaskRegion {
                mask: mask.clone(),
                strength,
                std,
                priority,
            })
            .collect();

        let settings = self.mask_settings(request, request.mask_cover_alpha);
        let mut prepared = MaskPreprocessor::new(schedule, settings, &self.device, self.dtype).process(&regions)?;
        let background_mask = prepared.background()?;
        let uncovered = background_mask
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        let mut has_background = uncovered > 0.0;

        let mut prompts = request.prompts.clone();
        let mut negatives = request.negative_prompts.clone();
        let mut mode = BackgroundMode::None;
        let mut known = None;

        if has_background {
            let background_prompt = match (&request.background, &request.background_prompt) {
                (None, Some(prompt)) => {
                    prepared = prepared.with_leading_region(&background_mask)?;
                    mode = BackgroundMode::Region;
                    has_background = false;
                    prompt.clone()
                }
                (None, None) => {
                    known = Some(self.white_background(request.height, request.width)?);
                    mode = BackgroundMode::Blend;
                    WHITE_BACKGROUND_PROMPT.to_string()
                }
                (Some(image), prompt) => {
                    let prompt = match prompt {
                        Some(prompt) => prompt.clone(),
                        None => self.caption(image)?,
                    };
                    known = Some(self.encode_background(image, request.height, request.width)?);
                    mode = BackgroundMode::Blend;
                    prompt
                }
            };
            if let Some(suffix) = &request.suffix {
                prompts = prompt::with_suffix(&prompts, suffix, &background_prompt);
            }
            prompts.insert(0, background_prompt);
            negatives.insert(0, request.background_negative_prompt.clone());
        }

        tracing::info!(
            regions = num_masks,
            prompts = num_prompts,
            background = ?mode,
            height = request.height,
            width = request.width,
            steps = schedule.len(),
            "region generation"
        );

        let embeddings = self.encode(&prompts, &negatives, mode, prompt_strengths, num_masks)?;
        let bootstrap = BootstrapMixer::new(
            request.bootstrap_steps.unwrap_or(self.config.bootstrap_steps),
            request.bootstrap_mix_steps.unwrap_or(self.config.bootstrap_mix_steps),
            request
                .bootstrap_leak_sensitivity
                .unwrap_or(self.config.bootstrap_leak_sensitivity),
        )?;

        let known = if has_background { known } else { None };
        let output = self.denoise(
            request,
            schedule,
            &prepared.masks,
            &embeddings,
            known.as_ref().map(|k| &k.latent),
            bootstrap,
        )?;

        let blend = match &known {
            Some(background) if request.do_blend => Some((&background.image, &prepared.masks_blurred)),
            _ => None,
        };
        self.finish(output, request.output_type, blend)
    }

    /// Plain single-prompt sample: one full-canvas region, no blur, no
    /// bootstrap, no background.
    fn sample(
        &mut self,
        prompt: &str,
        negative_prompt: &str,
        request: &GenerationRequest,
        schedule: &NoiseSchedule,
    ) -> Result<Generation> {
        tracing::info!(
            height = request.height,
            width = request.width,
            steps = schedule.len(),
            "plain sample"
        );
        let full = Tensor::ones((request.height, request.width), DType::F32, &self.device)?;
        let region = MaskRegion {
            mask: MaskInput::Alpha(full),
            strength: 1.0,
            std: 0.0,
            priority: 0,
        };
        let settings = self.mask_settings(request, Some(0.0));
        let prepared = MaskPreprocessor::new(schedule, settings, &self.device, self.dtype).process(&[region])?;
        let embeddings = self.encode(
            &[prompt.to_string()],
            &[negative_prompt.to_string()],
            BackgroundMode::None,
            vec![1.0],
            1,
        )?;
        let output = self.denoise(
            request,
            schedule,
            &prepared.masks,
            &embeddings,
            None,
            BootstrapMixer::disabled(),
        )?;
        self.finish(output, request.output_type, None)
    }

    /// No foreground prompts: sample the background prompt, or hand back the
    /// background itself.
    fn background_only(&mut self, request: &GenerationRequest, schedule: &NoiseSchedule) -> Result<Generation> {
        match (&request.background, &request.background_prompt) {
            (None, Some(prompt)) => {
                let negative = request.background_negative_prompt.clone();
                self.sample(prompt, &negative, request, schedule)
            }
            (Some(image), _) => {
                let output = match request.output_type {
                    OutputType::Image => GenerationOutput::Image(
                        image
                            .resize_exact(
                                request.width as u32,
                                request.height as u32,
                                image::imageops::FilterType::CatmullRom,
                            )
                            .to_rgb8(),
                    ),
                    OutputType::Tensor => GenerationOutput::Tensor(
                        convert::image_to_tensor(image, request.height, request.width, &self.device, self.dtype)?
                            .squeeze(0)?,
                    ),
                    OutputType::Latent => GenerationOutput::Latent(
                        self.encode_background(image, request.height, request.width)?.latent,
                    ),
                };
                Ok(Generation {
                    output,
                    steps_completed: 0,
                    interrupted: false,
                })
            }
            (None, None) => Err(Error::Validation(
                "request has no prompts, no background and no background prompt".into(),
            )),
        }
    }

    fn mask_settings(&self, request: &GenerationRequest, cover_alpha: Option<f64>) -> MaskSettings {
        let factor = self.autoencoder.downscale_factor();
        MaskSettings {
            height: request.height,
            width: request.width,
            latent_height: request.height / factor,
            latent_width: request.width / factor,
            cover_alpha: cover_alpha.unwrap_or(self.config.mask_cover_alpha),
            mask_type: request.mask_type.unwrap_or(self.config.mask_type),
            use_boolean_mask: request.use_boolean_mask,
        }
    }

    fn encode(
        &self,
        prompts: &[String],
        negatives: &[String],
        mode: BackgroundMode,
        prompt_strengths: Vec<f64>,
        num_masks: usize,
    ) -> Result<RegionEmbeddings> {
        let embeddings = self.text_encoder.encode(prompts, negatives)?;
        embeddings.check_rows(prompts.len(), negatives.len())?;
        PromptBlender::new(mode, prompt_strengths, num_masks).blend(&embeddings)
    }

    /// Draw the initial latent, noise the background and run the compositor.
    fn denoise(
        &mut self,
        request: &GenerationRequest,
        schedule: &NoiseSchedule,
        masks: &Tensor,
        embeddings: &RegionEmbeddings,
        background: Option<&Tensor>,
        bootstrap: BootstrapMixer,
    ) -> Result<CompositeOutput> {
        let factor = self.autoencoder.downscale_factor();
        let (h, w) = (request.height / factor, request.width / factor);
        let channels = self.autoencoder.latent_channels();

        let mut rng = NoiseGenerator::new(request.seed);
        let noise = rng.randn((1, channels, h, w), self.dtype, &self.device)?;
        let initial_latent = match background {
            Some(background) if schedule.timesteps()[0] < PURE_NOISE_TIMESTEP => {
                schedule.add_noise(background, Some(&noise), 0)?
            }
            _ => noise.clone(),
        };
        let noised_background = background
            .map(|background| {
                (0..=schedule.len())
                    .map(|i| schedule.add_noise(background, Some(&noise), i))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;

        let white = if bootstrap.steps() > 0 {
            Some(self.white_latent(request.height, request.width)?)
        } else {
            None
        };

        let tile_size = request.tile_size.unwrap_or(self.config.tile_size);
        let layout = PanoramaTiler::new(tile_size.div_ceil(factor))?.layout(h, w, &self.device, self.dtype)?;

        let guidance = Guidance::new(
            request.guidance_scale.unwrap_or(self.config.guidance_scale),
            request.guidance_rescale.unwrap_or(self.config.guidance_rescale),
        );
        let job = CompositeJob {
            schedule,
            masks,
            embeddings,
            layout: &layout,
            background: noised_background.as_deref(),
            white: white.as_ref(),
            initial_latent,
            initial_noise: &noise,
        };
        let interrupt = self.interrupt.clone();
        let output = Compositor::new(guidance, bootstrap).run(&self.denoiser, job, &mut rng, &interrupt)?;
        tracing::info!(
            steps_completed = output.steps_completed,
            interrupted = output.interrupted,
            tiles = layout.len(),
            "denoising finished"
        );
        Ok(output)
    }

    /// Decode and, when a background is known, blend over it.
    fn finish(
        &self,
        output: CompositeOutput,
        output_type: OutputType,
        blend: Option<(&Tensor, &Tensor)>,
    ) -> Result<Generation> {
        let CompositeOutput {
            latent,
            steps_completed,
            interrupted,
        } = output;
        let output = match output_type {
            OutputType::Latent => GenerationOutput::Latent(latent),
            OutputType::Image | OutputType::Tensor => {
                let mut image = self.autoencoder.decode(&latent)?;
                let (_, channels, _, _) = image.dims4()?;
                if channels != 3 {
                    return Err(Error::shape("decoded image channels", 3, channels));
                }
                if let Some((background, masks_blurred)) = blend {
                    let foreground = masks_blurred.sum_keepdim(0)?.clamp(0f32, 1f32)?.to_dtype(image.dtype())?;
                    image = blur::blend(&image, &background.to_dtype(image.dtype())?, &foreground)?;
                }
                let image = image.squeeze(0)?;
                match output_type {
                    OutputType::Tensor => GenerationOutput::Tensor(image),
                    _ => GenerationOutput::Image(convert::tensor_to_rgb(&image)?),
                }
            }
        };
        Ok(Generation {
            output,
            steps_completed,
            interrupted,
        })
    }

    /// White latent for a `height × width` canvas, from the grow-only cache.
    fn white_latent(&mut self, height: usize, width: usize) -> Result<Tensor> {
        let factor = self.autoencoder.downscale_factor();
        let (h, w) = (height / factor, width / factor);
        let cached = match &self.white {
            Some(white) => {
                let (_, _, ch, cw) = white.dims4()?;
                (ch >= h && cw >= w).then(|| white.clone()).ok_or((ch, cw))
            }
            None => Err((0, 0)),
        };
        let white = match cached {
            Ok(white) => white,
            Err((ch, cw)) => {
                let (grown_h, grown_w) = (h.max(ch) * factor, w.max(cw) * factor);
                tracing::debug!(height = grown_h, width = grown_w, "encoding white latent");
                let ones = Tensor::ones((1, 3, grown_h, grown_w), self.dtype, &self.device)?;
                let white = self.autoencoder.encode(&ones)?;
                self.white = Some(white.clone());
                white
            }
        };
        Ok(white.narrow(2, 0, h)?.narrow(3, 0, w)?)
    }

    fn white_background(&mut self, height: usize, width: usize) -> Result<KnownBackground> {
        Ok(KnownBackground {
            image: Tensor::ones((1, 3, height, width), self.dtype, &self.device)?,
            latent: self.white_latent(height, width)?,
        })
    }

    fn encode_background(&self, image: &DynamicImage, height: usize, width: usize) -> Result<KnownBackground> {
        let image = convert::image_to_tensor(image, height, width, &self.device, self.dtype)?;
        let latent = self.autoencoder.encode(&image)?;
        Ok(KnownBackground { image, latent })
    }

    fn caption(&self, image: &DynamicImage) -> Result<String> {
        match &self.captioner {
            Some(captioner) => {
                let caption = captioner.caption(image)?;
                tracing::info!(caption = %caption, "background captioned");
                Ok(caption)
            }
            None => {
                tracing::warn!("background given without prompt and no captioner; using an empty prompt");
                Ok(String::new())
            }
        }
    }
}
