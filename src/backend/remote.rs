//! OpenAI-compatible remote inference backend.
//!
//! Streams `chat/completions` responses as server-sent events and yields
//! the `choices[0].delta.content` fragments. The endpoint and credentials
//! are read once at startup from the environment.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::backend::{
    BackendDescriptor, BackendError, ChatMessage, CompletionBackend, CompletionStream,
    SamplingParams,
};
use crate::config::AppConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RemoteBackend {
    client: reqwest::Client,
    completions_url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: usize,
    temperature: f64,
    top_p: f64,
    stop: &'a [String],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

impl RemoteBackend {
    pub fn new(config: &AppConfig) -> Result<Self, BackendError> {
        let endpoint = config
            .endpoint_url
            .as_deref()
            .ok_or_else(|| BackendError::Unavailable("ENDPOINT_URL is not configured".into()))?;
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            completions_url: format!("{}/chat/completions", endpoint.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model_id.clone(),
        })
    }
}

#[async_trait]
impl CompletionBackend for RemoteBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor {
            kind: "remote".into(),
            model: self.model.clone(),
        }
    }

    async fn stream_completion(
        &self,
        messages: Vec<ChatMessage>,
        params: SamplingParams,
    ) -> Result<CompletionStream, BackendError> {
        let body = ChatCompletionBody {
            model: &self.model,
            messages: &messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stop: &params.stop,
            stream: true,
        };

        let mut request = self
            .client
            .post(&self.completions_url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Unavailable(format!(
                "backend returned {status}"
            )));
        }

        let deltas = response
            .bytes_stream()
            .eventsource()
            .take_while(|event| {
                let done = matches!(event, Ok(ev) if ev.data.trim() == "[DONE]");
                futures_util::future::ready(!done)
            })
            .filter_map(|event| {
                let item = match event {
                    Ok(ev) => parse_chunk(&ev.data),
                    Err(err) => Some(Err(BackendError::InvalidResponse(err.to_string()))),
                };
                futures_util::future::ready(item)
            })
            .boxed();

        Ok(deltas)
    }
}

/// Extract the text delta from one SSE payload. Chunks without text content
/// (role announcements, finish markers) contribute nothing and are skipped.
fn parse_chunk(data: &str) -> Option<Result<String, BackendError>> {
    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(err) => return Some(Err(BackendError::InvalidResponse(err.to_string()))),
    };
    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map(Ok)
}
