//! Scripted completion backend for exercising the rewriter without a model.
//!
//! Each scripted event is either a delta delivered after a configured delay
//! or a malformed fragment. The backend counts every item the caller
//! actually pulls from the stream, so tests can assert that a cutoff
//! stopped consumption.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};

use crate::backend::{
    BackendDescriptor, BackendError, ChatMessage, CompletionBackend, CompletionStream,
    SamplingParams,
};

#[derive(Debug, Clone)]
pub enum ScriptedEvent {
    Delta { delay: Duration, text: String },
    Malformed,
}

impl ScriptedEvent {
    pub fn delta(delay_ms: u64, text: impl Into<String>) -> Self {
        Self::Delta {
            delay: Duration::from_millis(delay_ms),
            text: text.into(),
        }
    }
}

pub struct ScriptedBackend {
    events: Vec<ScriptedEvent>,
    stall_after: bool,
    consumed: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new(events: Vec<ScriptedEvent>) -> Self {
        Self {
            events,
            stall_after: false,
            consumed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A backend that never emits anything.
    pub fn stalled() -> Self {
        Self {
            events: Vec::new(),
            stall_after: true,
            consumed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Keep the stream open (pending forever) after the scripted events
    /// instead of ending it.
    pub fn stall_after_events(mut self) -> Self {
        self.stall_after = true;
        self
    }

    /// Handle observing how many items the caller pulled off the stream.
    pub fn consumed(&self) -> Arc<AtomicUsize> {
        self.consumed.clone()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor {
            kind: "scripted".into(),
            model: "scripted".into(),
        }
    }

    async fn stream_completion(
        &self,
        _messages: Vec<ChatMessage>,
        _params: SamplingParams,
    ) -> Result<CompletionStream, BackendError> {
        let consumed = self.consumed.clone();
        let stall_after = self.stall_after;
        let events = self.events.clone().into_iter();

        let stream = stream::unfold((events, stall_after), |(mut events, stall)| async move {
            match events.next() {
                Some(ScriptedEvent::Delta { delay, text }) => {
                    tokio::time::sleep(delay).await;
                    Some((Ok(text), (events, stall)))
                }
                Some(ScriptedEvent::Malformed) => Some((
                    Err(BackendError::InvalidResponse("scripted fragment".into())),
                    (events, stall),
                )),
                None if stall => {
                    futures_util::future::pending::<()>().await;
                    unreachable!()
                }
                None => None,
            }
        })
        .inspect(move |_| {
            consumed.fetch_add(1, Ordering::SeqCst);
        })
        .boxed();

        Ok(stream)
    }
}
