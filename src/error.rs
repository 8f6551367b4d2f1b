//! Error types for multidiffusion-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Two user-supplied lists disagree in length outside the broadcast rules.
    #[error("{what}: got {got}, expected {expected} (or 1 to broadcast)")]
    CountMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// Request rejected before any compute ran.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Unknown mask quantization mode string.
    #[error("unsupported mask type '{0}' (expected discrete, semi-continuous or continuous)")]
    UnsupportedMaskType(String),

    /// Unknown output type string.
    #[error("unsupported output type '{0}' (expected image, tensor or latent)")]
    UnsupportedOutputType(String),

    /// A tensor crossed a component boundary with the wrong shape.
    #[error("shape: {0}")]
    Shape(String),

    /// Invalid configuration (schedule indices, config file contents).
    #[error("config: {0}")]
    Config(String),

    /// Failure inside an external collaborator (denoiser, autoencoder,
    /// text encoder, captioner). Propagated unchanged, never retried.
    #[error("model: {0}")]
    Model(String),

    /// Image conversion error.
    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Generation manager error (worker gone, reply dropped).
    #[error("manager: {0}")]
    Manager(String),
}

impl Error {
    pub(crate) fn shape(
        what: &str,
        expected: impl std::fmt::Debug,
        got: impl std::fmt::Debug,
    ) -> Self {
        Error::Shape(format!("{what}: expected {expected:?}, got {got:?}"))
    }
}
