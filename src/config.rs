//! Pipeline configuration and per-request override types.
//!
//! Defaults follow the reference tuning for a 4–6 step flash flow-matching
//! model at 1024×1024.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::scheduler::SchedulerConfig;
use crate::{Error, Result};

/// How blurred masks are quantized against the schedule's noise levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaskType {
    /// `mask > noise_level[t]` at every step.
    #[default]
    Discrete,
    /// Discrete except the last step, which uses the continuous ramp.
    SemiContinuous,
    /// Linear ramp between adjacent noise levels at every step.
    Continuous,
}

impl FromStr for MaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "discrete" => Ok(Self::Discrete),
            "semi-continuous" => Ok(Self::SemiContinuous),
            "continuous" => Ok(Self::Continuous),
            other => Err(Error::UnsupportedMaskType(other.to_string())),
        }
    }
}

/// What a generation call hands back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    /// Decoded 8-bit RGB image.
    #[default]
    Image,
    /// Decoded image tensor `[3, H, W]` in [0, 1].
    Tensor,
    /// Final latent `[1, C, h, w]`, not decoded.
    Latent,
}

impl FromStr for OutputType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "image" | "pil" => Ok(Self::Image),
            "tensor" | "pt" => Ok(Self::Tensor),
            "latent" => Ok(Self::Latent),
            other => Err(Error::UnsupportedOutputType(other.to_string())),
        }
    }
}

/// A per-region numeric override: pipeline default, one value for all
/// regions, or one value per region.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerRegion {
    #[default]
    Default,
    Uniform(f64),
    Each(Vec<f64>),
}

impl PerRegion {
    /// Broadcast to exactly `count` values.
    pub fn resolve(&self, default: f64, count: usize, what: &'static str) -> Result<Vec<f64>> {
        match self {
            PerRegion::Default => Ok(vec![default; count]),
            PerRegion::Uniform(value) => Ok(vec![*value; count]),
            PerRegion::Each(values) if values.len() == count => Ok(values.clone()),
            PerRegion::Each(values) => Err(Error::CountMismatch {
                what,
                expected: count,
                got: values.len(),
            }),
        }
    }
}

impl From<f64> for PerRegion {
    fn from(value: f64) -> Self {
        PerRegion::Uniform(value)
    }
}

impl From<Vec<f64>> for PerRegion {
    fn from(values: Vec<f64>) -> Self {
        PerRegion::Each(values)
    }
}

/// Pipeline-wide defaults. Every field can be overridden per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Gaussian blur std applied to masks, in pixels.
    #[serde(default = "default_mask_std")]
    pub mask_std: f64,

    /// Global multiplier on masks before quantization. Extremely sensitive;
    /// useful range is roughly 0.98–1.
    #[serde(default = "default_one")]
    pub mask_strength: f64,

    /// Mix ratio between background and foreground prompt embeddings.
    #[serde(default = "default_one")]
    pub prompt_strength: f64,

    /// Steps during which regions are isolated against a flat background.
    #[serde(default = "default_bootstrap_steps")]
    pub bootstrap_steps: usize,

    /// Fractional number of steps the white latent dominates the bootstrap
    /// background (2.3 = white for two steps, then 30% white).
    #[serde(default = "default_one")]
    pub bootstrap_mix_steps: f64,

    /// Sigmoid scale for leakage suppression after bootstrap steps.
    #[serde(default = "default_bootstrap_leak_sensitivity")]
    pub bootstrap_leak_sensitivity: f64,

    /// Alpha applied to a mask where a later mask covers it. `0` disables.
    #[serde(default = "default_mask_cover_alpha")]
    pub mask_cover_alpha: f64,

    /// Step indices into the reference timeline.
    #[serde(default = "default_t_index_list")]
    pub t_index_list: Vec<usize>,

    /// Length of the reference timeline `t_index_list` points into.
    #[serde(default = "default_reference_steps")]
    pub reference_steps: usize,

    #[serde(default)]
    pub mask_type: MaskType,

    /// Classifier-free guidance scale; guidance is on above 1.
    #[serde(default)]
    pub guidance_scale: f64,

    /// Guidance rescale factor (0 disables).
    #[serde(default = "default_guidance_rescale")]
    pub guidance_rescale: f64,

    /// Panorama tile size in pixels.
    #[serde(default = "default_tile_size")]
    pub tile_size: usize,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mask_std: default_mask_std(),
            mask_strength: default_one(),
            prompt_strength: default_one(),
            bootstrap_steps: default_bootstrap_steps(),
            bootstrap_mix_steps: default_one(),
            bootstrap_leak_sensitivity: default_bootstrap_leak_sensitivity(),
            mask_cover_alpha: default_mask_cover_alpha(),
            t_index_list: default_t_index_list(),
            reference_steps: default_reference_steps(),
            mask_type: MaskType::default(),
            guidance_scale: 0.0,
            guidance_rescale: default_guidance_rescale(),
            tile_size: default_tile_size(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tile_size == 0 {
            return Err(Error::Config("tile_size must be positive".into()));
        }
        if self.bootstrap_leak_sensitivity <= 0.0 {
            return Err(Error::Config(format!(
                "bootstrap_leak_sensitivity must be positive, got {}",
                self.bootstrap_leak_sensitivity
            )));
        }
        if !(0.0..=1.0).contains(&self.mask_cover_alpha) {
            return Err(Error::Config(format!(
                "mask_cover_alpha must lie in [0, 1], got {}",
                self.mask_cover_alpha
            )));
        }
        Ok(())
    }
}

/// Recommended step-index lists on the 50-step reference timeline.
pub struct ScheduleIndices;

impl ScheduleIndices {
    /// Bootstrapping shapes the layout in the first steps, so more bootstrap
    /// steps want more early indices.
    pub fn for_bootstrap_steps(bootstrap_steps: usize) -> Vec<usize> {
        match bootstrap_steps {
            0 => vec![0, 12, 25, 37],
            1 => vec![0, 4, 12, 25, 37],
            _ => vec![0, 5, 16, 18, 20, 37],
        }
    }
}

fn default_mask_std() -> f64 {
    1.0
}

fn default_one() -> f64 {
    1.0
}

fn default_bootstrap_steps() -> usize {
    1
}

fn default_bootstrap_leak_sensitivity() -> f64 {
    0.2
}

fn default_mask_cover_alpha() -> f64 {
    0.3
}

fn default_t_index_list() -> Vec<usize> {
    ScheduleIndices::for_bootstrap_steps(default_bootstrap_steps())
}

fn default_reference_steps() -> usize {
    50
}

fn default_guidance_rescale() -> f64 {
    0.7
}

fn default_tile_size() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.t_index_list, vec![0, 4, 12, 25, 37]);
        assert_eq!(cfg.reference_steps, 50);
        assert_eq!(cfg.bootstrap_steps, 1);
        assert_eq!(cfg.mask_type, MaskType::Discrete);
        assert_eq!(cfg.tile_size, 1024);
        assert!((cfg.bootstrap_leak_sensitivity - 0.2).abs() < 1e-12);
        assert!((cfg.mask_cover_alpha - 0.3).abs() < 1e-12);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"mask_type": "semi-continuous", "tile_size": 512}"#).unwrap();
        assert_eq!(cfg.mask_type, MaskType::SemiContinuous);
        assert_eq!(cfg.tile_size, 512);
        assert_eq!(cfg.bootstrap_steps, 1);
        assert_eq!(cfg.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn test_mask_type_parse() {
        assert_eq!("continuous".parse::<MaskType>().unwrap(), MaskType::Continuous);
        assert!(matches!(
            "smooth".parse::<MaskType>(),
            Err(Error::UnsupportedMaskType(s)) if s == "smooth"
        ));
    }

    #[test]
    fn test_output_type_parse() {
        assert_eq!("pil".parse::<OutputType>().unwrap(), OutputType::Image);
        assert_eq!("latent".parse::<OutputType>().unwrap(), OutputType::Latent);
        assert!(matches!(
            "np".parse::<OutputType>(),
            Err(Error::UnsupportedOutputType(_))
        ));
    }

    #[test]
    fn test_per_region_resolve() {
        assert_eq!(PerRegion::Default.resolve(0.5, 3, "std").unwrap(), vec![0.5; 3]);
        assert_eq!(PerRegion::from(2.0).resolve(0.5, 2, "std").unwrap(), vec![2.0; 2]);
        assert_eq!(
            PerRegion::from(vec![1.0, 2.0]).resolve(0.5, 2, "std").unwrap(),
            vec![1.0, 2.0]
        );
        match PerRegion::from(vec![1.0, 2.0]).resolve(0.5, 3, "mask stds") {
            Err(Error::CountMismatch {
                what,
                expected,
                got,
            }) => {
                assert_eq!(what, "mask stds");
                assert_eq!(expected, 3);
                assert_eq!(got, 2);
            }
            other => panic!("expected count mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_from_json_file_validates() {
        let dir = tempfile::tempdir().unwrap();

        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"{"guidance_scale": 3.5, "t_index_list": [0, 12, 25, 37]}"#).unwrap();
        let cfg = PipelineConfig::from_json_file(&good).unwrap();
        assert_eq!(cfg.guidance_scale, 3.5);
        assert_eq!(cfg.t_index_list, ScheduleIndices::for_bootstrap_steps(0));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"{"mask_cover_alpha": 1.5}"#).unwrap();
        assert!(matches!(PipelineConfig::from_json_file(&bad), Err(Error::Config(_))));

        assert!(matches!(
            PipelineConfig::from_json_file(dir.path().join("missing.json")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_schedule_indices() {
        assert_eq!(ScheduleIndices::for_bootstrap_steps(0).len(), 4);
        assert_eq!(ScheduleIndices::for_bootstrap_steps(2), vec![0, 5, 16, 18, 20, 37]);
        assert_eq!(ScheduleIndices::for_bootstrap_steps(7).len(), 6);
    }
}
