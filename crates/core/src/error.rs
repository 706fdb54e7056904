use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong between a front-end and the loaded model.
///
/// Front-ends render each variant differently so an operator can tell a
/// model that is still loading apart from bad input or a crashed engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fatal at startup; the process must not accept traffic.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("model is not loaded")]
    ModelNotReady,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Queue bound reached while another generation is running.
    #[error("generation queue is full ({0} requests pending)")]
    QueueFull(usize),

    /// The inference engine failed. Never retried automatically.
    #[error("inference failed: {0}")]
    Inference(String),

    /// The image was generated but could not be persisted.
    #[error("failed to write {}: {message}", path.display())]
    Storage { path: PathBuf, message: String },

    /// Client side only: the server could not be reached at all.
    #[error("could not connect to {url}: {message}")]
    Connection { url: String, message: String },

    /// Client side only: the server answered with a failure status.
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },
}

impl Error {
    /// Short machine-readable kind, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ModelLoad(_) => "model_load_error",
            Error::ModelNotReady => "model_not_ready",
            Error::InvalidRequest(_) => "invalid_request_error",
            Error::QueueFull(_) => "queue_full",
            Error::Inference(_) => "inference_error",
            Error::Storage { .. } => "storage_error",
            Error::Connection { .. } => "connection_error",
            Error::Server { .. } => "server_error",
        }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Error::Storage {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
