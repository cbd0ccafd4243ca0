//! Streaming completion backends.
//!
//! The rewriter consumes inference engines through [`CompletionBackend`]:
//! start a streaming completion, receive incremental text deltas, release
//! the stream by dropping it. The remote backend speaks the
//! OpenAI-compatible chat-completions wire format; the local backend runs a
//! TorchScript module in-process.

pub mod mock;
pub mod remote;

#[cfg(feature = "tch-backend")]
pub mod local;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;

/// Ordered incremental text fragments from one completion.
///
/// Dropping the stream is the release contract: it must be infallible, may
/// happen at any point mid-stream, and cancels whatever generation work is
/// still in flight on the backend side.
pub type CompletionStream = BoxStream<'static, Result<String, BackendError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Per-request sampling settings handed to the backend.
#[derive(Debug, Clone)]
pub struct SamplingParams {
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendDescriptor {
    pub kind: String,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid response fragment: {0}")]
    InvalidResponse(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn descriptor(&self) -> BackendDescriptor;

    /// Issue a streaming completion for the given conversation.
    ///
    /// An `Err` here means the stream could not be started at all; once a
    /// stream is returned, item-level errors are recoverable and callers
    /// may skip them. The backend may end the stream on its own when a stop
    /// sequence or token limit is reached.
    async fn stream_completion(
        &self,
        messages: Vec<ChatMessage>,
        params: SamplingParams,
    ) -> Result<CompletionStream, BackendError>;
}
