use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum MicrophoneError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("no recording in progress")]
    NotRecording,

    #[error("recording device error: {0}")]
    Device(String),
}

/// Audio capture device. Permission prompts live in the shell.
#[async_trait::async_trait]
pub trait Microphone: Send + Sync {
    /// Returns whether permission is granted.
    async fn request_permission(&self) -> bool;

    async fn start(&self) -> Result<(), MicrophoneError>;

    /// Finalizes the clip and returns its bytes.
    async fn stop(&self) -> Result<Bytes, MicrophoneError>;
}
