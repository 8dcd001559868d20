// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 错误类型 (Error kinds of the capture/inference pipeline)

use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, LprError>;

#[derive(Error, Debug)]
pub enum LprError {
    /// DMA capture / device control call failed
    #[error("hardware I/O error: {0}")]
    HardwareIo(String),

    /// No free frame slot within the configured timeout
    #[error("no free frame slot after {waited_ms} ms")]
    SlotTimeout { waited_ms: u64 },

    /// A detector or OCR call failed (recoverable, output treated as empty)
    #[error("model inference failed: {0}")]
    ModelInference(String),

    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("display sink error: {0}")]
    Sink(String),

    #[error("display sink reached end of stream")]
    EndOfStream,

    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LprError {
    pub fn hardware<S: Into<String>>(msg: S) -> Self {
        Self::HardwareIo(msg.into())
    }

    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::ModelInference(msg.into())
    }

    pub fn model_load<S: Into<String>>(msg: S) -> Self {
        Self::ModelLoad(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigValidation(msg.into())
    }

    pub fn sink<S: Into<String>>(msg: S) -> Self {
        Self::Sink(msg.into())
    }

    /// Everything except a single failed model call ends the capture loop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ModelInference(_))
    }
}
