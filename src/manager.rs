//! Generation manager: keeps a pipeline resident and queues requests.
//!
//! The manager owns one [`MultiDiffusionPipeline`] on a dedicated blocking
//! thread. Callers submit [`GenerationRequest`]s which are processed in
//! order; [`GenerationManager::interrupt`] stops the one currently running
//! after its current step.
//!
//! # Example
//!
//! ```no_run
//! # use multidiffusion_rs::model::{Autoencoder, Denoiser, TextEncoder};
//! # async fn demo<D, A, T>(denoiser: D, autoencoder: A, text_encoder: T)
//! # where
//! #     D: Denoiser + Send + 'static,
//! #     A: Autoencoder + Send + 'static,
//! #     T: TextEncoder + Send + 'static,
//! # {
//! use candle_core::DType;
//! use multidiffusion_rs::config::PipelineConfig;
//! use multidiffusion_rs::manager::{GenerationManager, ManagerConfig, preferred_device};
//! use multidiffusion_rs::pipeline::{GenerationRequest, MultiDiffusionPipeline};
//!
//! let manager = GenerationManager::start(ManagerConfig::default(), move || {
//!     let device = preferred_device(0);
//!     MultiDiffusionPipeline::new(denoiser, autoencoder, text_encoder, PipelineConfig::default(), &device, DType::F32)
//! })
//! .await
//! .unwrap();
//! let image = manager
//!     .generate(GenerationRequest::default().with_background_prompt("a misty forest"))
//!     .await
//!     .unwrap();
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use candle_core::Device;
use tokio::sync::{mpsc, oneshot};

use crate::model::{Autoencoder, Denoiser, TextEncoder};
use crate::pipeline::{Generation, GenerationRequest, MultiDiffusionPipeline};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Requests that may wait behind the running one before `generate`
    /// starts waiting for room.
    pub queue_depth: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { queue_depth: 64 }
    }
}

/// A submitted generation request.
struct PendingRequest {
    request: GenerationRequest,
    reply: oneshot::Sender<Result<Generation>>,
}

/// Handle for submitting generation requests to a running manager.
#[derive(Clone)]
pub struct GenerationManager {
    tx: mpsc::Sender<PendingRequest>,
    interrupt: Arc<AtomicBool>,
}

impl GenerationManager {
    /// Build the pipeline with `load` on a blocking thread, then start the
    /// worker. Returns an error if loading fails.
    pub async fn start<D, A, T, F>(config: ManagerConfig, load: F) -> Result<Self>
    where
        D: Denoiser + Send + 'static,
        A: Autoencoder + Send + 'static,
        T: TextEncoder + Send + 'static,
        F: FnOnce() -> Result<MultiDiffusionPipeline<D, A, T>> + Send + 'static,
    {
        if config.queue_depth == 0 {
            return Err(Error::Config("manager queue_depth must be positive".into()));
        }
        let pipeline = tokio::task::spawn_blocking(load)
            .await
            .map_err(|join_error| Error::Manager(format!("pipeline load task panicked: {join_error}")))?
            .map_err(|e| Error::Manager(format!("pipeline load failed: {e}")))?;
        tracing::info!(device = ?pipeline.device(), queue_depth = config.queue_depth, "generation manager started");

        let interrupt = pipeline.interrupt_handle();
        let (tx, rx) = mpsc::channel::<PendingRequest>(config.queue_depth);
        tokio::task::spawn_blocking(move || run_manager(pipeline, rx));

        Ok(Self { tx, interrupt })
    }

    /// Submit a generation request and wait for the result.
    pub async fn generate(&self, request: GenerationRequest) -> Result<Generation> {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<Generation>>();
        self.tx
            .send(PendingRequest {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Manager("manager has shut down".into()))?;

        reply_rx
            .await
            .map_err(|_| Error::Manager("manager dropped reply channel".into()))?
    }

    /// Stop the running generation after its current step. Queued requests
    /// are unaffected.
    pub fn interrupt(&self) {
        tracing::info!("interrupt requested");
        self.interrupt.store(true, Ordering::SeqCst);
    }
}

/// The manager loop, run on a dedicated blocking thread. Exits once every
/// handle has been dropped.
fn run_manager<D, A, T>(mut pipeline: MultiDiffusionPipeline<D, A, T>, mut rx: mpsc::Receiver<PendingRequest>)
where
    D: Denoiser,
    A: Autoencoder,
    T: TextEncoder,
{
    while let Some(pending) = rx.blocking_recv() {
        let result = pipeline.generate(&pending.request);
        if let Err(error) = &result {
            tracing::warn!(%error, "generation failed");
        }
        // The caller may have given up waiting.
        let _ = pending.reply.send(result);
    }
    tracing::info!("generation manager shut down");
}

/// CUDA if available, then Metal, otherwise CPU.
pub fn preferred_device(ordinal: usize) -> Device {
    Device::cuda_if_available(ordinal)
        .ok()
        .filter(|d| !d.is_cpu())
        .or_else(|| Device::metal_if_available(ordinal).ok())
        .unwrap_or(Device::Cpu)
}
