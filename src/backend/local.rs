//! In-process TorchScript inference backend.
//!
//! Loads a traced generation module and its tokenizer at startup, then
//! serves completions from a blocking thread: greedy autoregressive decode,
//! incremental detokenization, one channel send per decoded piece. The
//! receiver going away is the early-close signal; the decode loop stops at
//! its next send.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use parking_lot::Mutex;
use tch::{Device, Tensor, no_grad};
use tokenizers::Tokenizer;
use tokio::sync::mpsc;
use tokio::task;
use tracing::debug;

use crate::backend::{
    BackendDescriptor, BackendError, ChatMessage, CompletionBackend, CompletionStream,
    SamplingParams,
};
use crate::config::AppConfig;

const DELTA_CHANNEL_CAPACITY: usize = 32;

pub struct LocalBackend {
    engine: Arc<Engine>,
    model_name: String,
}

struct Engine {
    device: Device,
    eos_token_id: i64,
    module: Mutex<tch::CModule>,
    tokenizer: Tokenizer,
}

impl LocalBackend {
    /// Load the module and tokenizer described by the config. Failure here
    /// is fatal at startup; the service never runs without a usable engine.
    pub fn initialize(config: &AppConfig) -> Result<Self, BackendError> {
        let module_path = &config.module_path;
        if !module_path.exists() {
            return Err(BackendError::Unavailable(format!(
                "model artifact missing: {}",
                module_path.display()
            )));
        }

        let tokenizer_path = resolve_tokenizer(config)?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| BackendError::Unavailable(format!("tokenizer: {e}")))?;

        let mut module = tch::CModule::load_on_device(module_path, config.device)
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        module.set_eval();

        Ok(Self {
            engine: Arc::new(Engine {
                device: config.device,
                eos_token_id: config.eos_token_id,
                module: Mutex::new(module),
                tokenizer,
            }),
            model_name: config.model_id.clone(),
        })
    }
}

/// Prefer the configured tokenizer path; fall back to fetching
/// `tokenizer.json` from the Hub when a model repo is configured.
fn resolve_tokenizer(config: &AppConfig) -> Result<PathBuf, BackendError> {
    if config.tokenizer_path.exists() {
        return Ok(config.tokenizer_path.clone());
    }
    let repo = config.model_repo.as_ref().ok_or_else(|| {
        BackendError::Unavailable(format!(
            "tokenizer missing at {} and MODEL_REPO is not set",
            config.tokenizer_path.display()
        ))
    })?;
    debug!(%repo, "fetching tokenizer from the hub");
    let api = hf_hub::api::sync::Api::new()
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;
    api.model(repo.clone())
        .get("tokenizer.json")
        .map_err(|e| BackendError::Unavailable(e.to_string()))
}

#[async_trait]
impl CompletionBackend for LocalBackend {
    fn descriptor(&self) -> BackendDescriptor {
        BackendDescriptor {
            kind: "local".into(),
            model: self.model_name.clone(),
        }
    }

    async fn stream_completion(
        &self,
        messages: Vec<ChatMessage>,
        params: SamplingParams,
    ) -> Result<CompletionStream, BackendError> {
        // The traced module has no chat template; the conversation is
        // flattened into a single prompt in message order.
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let (tx, rx) = mpsc::channel::<Result<String, BackendError>>(DELTA_CHANNEL_CAPACITY);
        let engine = self.engine.clone();
        task::spawn_blocking(move || engine.stream_generate(&prompt, &params, tx));

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

impl Engine {
    fn stream_generate(
        &self,
        prompt: &str,
        params: &SamplingParams,
        tx: mpsc::Sender<Result<String, BackendError>>,
    ) {
        if let Err(err) = self.decode_loop(prompt, params, &tx) {
            let _ = tx.blocking_send(Err(err));
        }
    }

    fn decode_loop(
        &self,
        prompt: &str,
        params: &SamplingParams,
        tx: &mpsc::Sender<Result<String, BackendError>>,
    ) -> Result<(), BackendError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| BackendError::Inference(format!("tokenizer: {e}")))?;
        let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if input_ids.is_empty() {
            input_ids.push(0);
        }
        let prompt_token_len = input_ids.len();

        let mut decoded = String::new();
        let mut sent = 0usize;

        no_grad(|| {
            let module = self.module.lock();

            for _ in 0..params.max_tokens {
                let input_tensor = Tensor::from_slice(&input_ids)
                    .reshape([1, input_ids.len() as i64])
                    .to(self.device);

                let output = module
                    .forward_is(&[tch::IValue::Tensor(input_tensor)])
                    .map_err(|e| BackendError::Inference(e.to_string()))?;

                // Traced modules may return the logits directly or a
                // (logits, past) tuple.
                let logits = match output {
                    tch::IValue::Tensor(t) => t,
                    tch::IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                        tch::IValue::Tensor(t) => t.shallow_clone(),
                        _ => {
                            return Err(BackendError::Inference(
                                "expected tensor as first tuple element".into(),
                            ));
                        }
                    },
                    _ => {
                        return Err(BackendError::Inference(
                            "unexpected model output format".into(),
                        ));
                    }
                };

                let last_logits = logits.select(1, -1).squeeze();
                // Greedy decode; the sampling knobs are honored by the
                // remote backend only.
                let next_token_id = last_logits.argmax(0, false).int64_value(&[]);

                if next_token_id == self.eos_token_id {
                    break;
                }
                input_ids.push(next_token_id);

                let generated: Vec<u32> = input_ids[prompt_token_len..]
                    .iter()
                    .map(|&id| id as u32)
                    .collect();
                decoded = self
                    .tokenizer
                    .decode(&generated, true)
                    .map_err(|e| BackendError::Inference(format!("tokenizer: {e}")))?;

                if let Some(end) = stop_position(&decoded, &params.stop) {
                    if end > sent {
                        let _ = tx.blocking_send(Ok(decoded[sent..end].to_string()));
                    }
                    break;
                }

                if decoded.len() > sent {
                    let piece = decoded[sent..].to_string();
                    sent = decoded.len();
                    if tx.blocking_send(Ok(piece)).is_err() {
                        // Receiver dropped: the caller closed the stream.
                        break;
                    }
                }
            }

            Ok(())
        })
    }
}

/// Byte offset of the earliest stop-sequence match, if any. Matching runs
/// over the full accumulated text so sequences spanning token boundaries
/// are caught.
fn stop_position(text: &str, stop: &[String]) -> Option<usize> {
    stop.iter().filter_map(|s| text.find(s.as_str())).min()
}
