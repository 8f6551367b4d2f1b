//! Flow-matching noise schedule for few-step compositing.
//!
//! The compositor does not drive a stateful scheduler. It needs, per selected
//! step, a fixed set of coefficients that every tile and region reads:
//!
//! - [`flash`] — [`NoiseSchedule`], the immutable per-generation schedule
//!   built from a subset of a reference timeline
//!
//! ## Flow-matching formulation
//!
//! The forward process interpolates: `x_t = (1 - σ) * x_0 + σ * ε`
//!
//! The model predicts velocity `v = ε - x_0`, so one denoise step is
//! `x_0 = x_t - σ * v`.
//!
//! The reference sigma ramp is shifted: `σ' = shift * σ / (1 + (shift - 1) * σ)`

pub mod flash;

pub use flash::NoiseSchedule;

/// Configuration of the reference timeline the step indices point into.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    /// Number of training timesteps (default: 1000).
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,

    /// Sigma schedule shift factor (default: 3.0).
    #[serde(default = "default_shift")]
    pub shift: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: default_num_train_timesteps(),
            shift: default_shift(),
        }
    }
}

impl SchedulerConfig {
    /// Apply the shift to a raw sigma value.
    ///
    /// `σ' = shift * σ / (1 + (shift - 1) * σ)`
    pub fn shift_sigma(&self, sigma: f64) -> f64 {
        self.shift * sigma / (1.0 + (self.shift - 1.0) * sigma)
    }

    /// Full reference timeline of `length` shifted sigmas, from 1.0 down to
    /// the shifted training minimum.
    pub fn reference_sigmas(&self, length: usize) -> Vec<f64> {
        let sigma_max = self.shift_sigma(1.0);
        let sigma_min = self.shift_sigma(1.0 / self.num_train_timesteps as f64);

        (0..length)
            .map(|i| {
                let t =
                    sigma_max - (sigma_max - sigma_min) * i as f64 / (length - 1).max(1) as f64;
                self.shift_sigma(t)
            })
            .collect()
    }
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_shift() -> f64 {
    3.0
}
