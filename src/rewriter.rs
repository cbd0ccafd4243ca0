//! Bounded streaming rewriter.
//!
//! Drives one streaming completion per request and decides, delta by delta,
//! whether to keep consuming: a hard cutoff at 90% of the caller's latency
//! budget aborts unconditionally, a soft cutoff at 75% (or after the third
//! line) stops once the current line is done. Decoding latency is
//! unpredictable per token, so elapsed time is rechecked after every
//! suspension, not once up front.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use crate::backend::{BackendError, ChatMessage, CompletionBackend, SamplingParams};

pub const MAX_QUERIES: usize = 3;
pub const DEFAULT_MAX_LATENCY_MS: f64 = 100.0;

const HARD_CUTOFF_FRACTION: f64 = 0.90;
const SOFT_CUTOFF_FRACTION: f64 = 0.75;
const MIN_COMPLETION_TOKENS: usize = 12;
const PROMPT_CHARS_PER_DROPPED_TOKEN: usize = 40;

const PREFIX: &str = "You are an assistant that rewrites user questions into concise search-engine queries.\n\
Write one to up to three MAXIMUM search queries. Have them be diverse from one another.\n\
<example>\n<question>\nWhat are some ways to do fast query reformulation</question>\n<search_queries>\n\
Fast query reformulation techniques\n\
Query expansion methods\n\
Query refinement strategies\n\
</search_queries>\n</example>\n<question>\n";
const SUFFIX: &str = "\n</question>\n<search_queries>\n";

const DEFAULT_STOP_SEQUENCES: [&str; 4] = ["\n\n", "</", "\n</", "</search_queries>"];

static SYSTEM_MESSAGE: Lazy<ChatMessage> = Lazy::new(|| ChatMessage::system(PREFIX));

#[derive(Debug, Deserialize)]
pub struct RewriteRequest {
    pub question: String,
    #[serde(default = "default_max_latency")]
    pub desired_max_latency: f64,
}

fn default_max_latency() -> f64 {
    DEFAULT_MAX_LATENCY_MS
}

#[derive(Debug, Clone, Serialize)]
pub struct RewriteResult {
    pub queries: Vec<String>,
    pub elapsed_time: f64,
}

/// Process-wide generation settings; fixed at startup, never mutated per
/// request.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationConfig {
    pub base_max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    #[serde(skip)]
    pub stop: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_max_tokens: 20,
            temperature: 0.5,
            top_p: 0.95,
            stop: DEFAULT_STOP_SEQUENCES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamExit {
    Natural,
    SoftCut,
    HardCut,
    Stalled,
}

pub struct QueryRewriter {
    backend: Arc<dyn CompletionBackend>,
    generation: GenerationConfig,
}

impl QueryRewriter {
    pub fn new(backend: Arc<dyn CompletionBackend>, generation: GenerationConfig) -> Self {
        Self {
            backend,
            generation,
        }
    }

    pub fn backend(&self) -> &Arc<dyn CompletionBackend> {
        &self.backend
    }

    pub fn generation(&self) -> &GenerationConfig {
        &self.generation
    }

    /// Reformulate a question into up to three search queries.
    ///
    /// Only a failure to start the stream is an error. Once streaming, any
    /// anomaly degrades to the fallback result `[question]`.
    pub async fn rewrite(
        &self,
        question: &str,
        desired_max_latency: f64,
    ) -> Result<RewriteResult, BackendError> {
        let desired = if desired_max_latency.is_finite() && desired_max_latency > 0.0 {
            desired_max_latency
        } else {
            DEFAULT_MAX_LATENCY_MS
        };

        let params = SamplingParams {
            max_tokens: completion_token_budget(question, self.generation.base_max_tokens),
            temperature: self.generation.temperature,
            top_p: self.generation.top_p,
            stop: self.generation.stop.clone(),
        };
        let messages = vec![
            SYSTEM_MESSAGE.clone(),
            ChatMessage::user(format!("{question}{SUFFIX}")),
        ];

        let start = Instant::now();
        let mut stream = self.backend.stream_completion(messages, params).await?;
        // Every wait, including the one for the first delta, is bounded by
        // the hard deadline. A silent backend cannot hold the request past
        // the budget.
        let hard_deadline =
            start + Duration::from_secs_f64(HARD_CUTOFF_FRACTION * desired / 1000.0);

        let mut text = String::new();
        let mut newline_count = 0usize;

        let exit = loop {
            let delta = match timeout_at(hard_deadline, stream.next()).await {
                Err(_) => break StreamExit::Stalled,
                Ok(None) => break StreamExit::Natural,
                Ok(Some(Err(err))) => {
                    debug!(%err, "skipping unusable fragment");
                    if elapsed_ms(start) > HARD_CUTOFF_FRACTION * desired {
                        break StreamExit::HardCut;
                    }
                    continue;
                }
                Ok(Some(Ok(delta))) => delta,
            };

            text.push_str(&delta);
            let elapsed = elapsed_ms(start);
            if elapsed > HARD_CUTOFF_FRACTION * desired {
                break StreamExit::HardCut;
            }
            if delta.contains('\n') {
                newline_count += 1;
                if elapsed > SOFT_CUTOFF_FRACTION * desired || newline_count >= MAX_QUERIES {
                    break StreamExit::SoftCut;
                }
            }
        };

        // Single release point for the generation resource, whatever the
        // exit path. Dropping cancels any in-flight backend work.
        drop(stream);
        debug!(?exit, newline_count, "stream finished");

        let queries = parse_queries(&text, question);
        Ok(RewriteResult {
            queries,
            elapsed_time: elapsed_ms(start),
        })
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Longer questions get a smaller completion budget: the model needs fewer
/// tokens to extrapolate already-detailed queries. A heuristic only; the
/// timing loop is the real backstop.
fn completion_token_budget(question: &str, base_max_tokens: usize) -> usize {
    let dropped = question.len() / PROMPT_CHARS_PER_DROPPED_TOKEN;
    base_max_tokens
        .saturating_sub(dropped)
        .clamp(MIN_COMPLETION_TOKENS.min(base_max_tokens), base_max_tokens)
}

/// Split the accumulated buffer into queries: one per line, whitespace and
/// leading bullet punctuation trimmed, empties dropped, capped at
/// [`MAX_QUERIES`]. An empty result falls back to the question verbatim.
fn parse_queries(text: &str, question: &str) -> Vec<String> {
    let queries: Vec<String> = text
        .lines()
        .map(|line| line.trim().trim_start_matches(['-', '*', '•']).trim_start())
        .filter(|line| !line.is_empty())
        .take(MAX_QUERIES)
        .map(str::to_string)
        .collect();
    if queries.is_empty() {
        vec![question.to_string()]
    } else {
        queries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{ScriptedBackend, ScriptedEvent};
    use std::sync::atomic::Ordering;

    fn rewriter(backend: ScriptedBackend) -> QueryRewriter {
        QueryRewriter::new(Arc::new(backend), GenerationConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn parses_queries_on_natural_end() {
        let backend = ScriptedBackend::new(vec![
            ScriptedEvent::delta(1, "Fast query reformulation techniques\n"),
            ScriptedEvent::delta(1, "Query expansion methods"),
        ]);
        let result = rewriter(backend)
            .rewrite("What are some ways to do fast query reformulation", 100.0)
            .await
            .unwrap();

        assert_eq!(
            result.queries,
            vec![
                "Fast query reformulation techniques",
                "Query expansion methods"
            ]
        );
        assert!(result.elapsed_time >= 0.0);
        assert!(result.elapsed_time < 150.0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_stream_falls_back_to_question() {
        let backend = ScriptedBackend::new(Vec::new());
        let result = rewriter(backend).rewrite("original question", 100.0).await.unwrap();

        assert_eq!(result.queries, vec!["original question"]);
    }

    #[tokio::test(start_paused = true)]
    async fn whitespace_only_output_falls_back_to_question() {
        let backend = ScriptedBackend::new(vec![ScriptedEvent::delta(1, "   \n")]);
        let result = rewriter(backend).rewrite("original question", 100.0).await.unwrap();

        assert_eq!(result.queries, vec!["original question"]);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_cutoff_stops_consuming_deltas() {
        let backend = ScriptedBackend::new(vec![
            ScriptedEvent::delta(40, "alpha "),
            ScriptedEvent::delta(40, "beta "),
            ScriptedEvent::delta(40, "gamma "),
            ScriptedEvent::delta(40, "never seen"),
        ]);
        let consumed = backend.consumed();
        let result = rewriter(backend).rewrite("question", 100.0).await.unwrap();

        // The third delta lands past 90% of budget; the fourth is never
        // pulled off the stream.
        assert_eq!(consumed.load(Ordering::SeqCst), 3);
        assert_eq!(result.queries, vec!["alpha beta gamma"]);
        assert!(result.elapsed_time >= 90.0);
    }

    #[tokio::test(start_paused = true)]
    async fn soft_cutoff_after_time_threshold_on_line_boundary() {
        let backend = ScriptedBackend::new(vec![
            ScriptedEvent::delta(40, "alpha\n"),
            ScriptedEvent::delta(40, "beta\n"),
            ScriptedEvent::delta(40, "gamma\n"),
        ]);
        let consumed = backend.consumed();
        let result = rewriter(backend).rewrite("question", 100.0).await.unwrap();

        // Second newline lands at ~80ms, past the 75% threshold.
        assert_eq!(consumed.load(Ordering::SeqCst), 2);
        assert_eq!(result.queries, vec!["alpha", "beta"]);
    }

    #[tokio::test(start_paused = true)]
    async fn third_newline_ends_stream_with_content_still_buffered() {
        let backend = ScriptedBackend::new(vec![
            ScriptedEvent::delta(1, "one\n"),
            ScriptedEvent::delta(1, "two\n"),
            ScriptedEvent::delta(1, "three\n"),
            ScriptedEvent::delta(1, "four\n"),
        ])
        .stall_after_events();
        let consumed = backend.consumed();
        let result = rewriter(backend).rewrite("question", 100.0).await.unwrap();

        assert_eq!(consumed.load(Ordering::SeqCst), 3);
        assert_eq!(result.queries, vec!["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_backend_falls_back_within_budget() {
        let backend = ScriptedBackend::stalled();
        let consumed = backend.consumed();
        let result = rewriter(backend).rewrite("original question", 100.0).await.unwrap();

        assert_eq!(consumed.load(Ordering::SeqCst), 0);
        assert_eq!(result.queries, vec!["original question"]);
        assert!(result.elapsed_time >= 90.0);
        assert!(result.elapsed_time < 150.0);
    }

    #[tokio::test(start_paused = true)]
    async fn stall_after_partial_output_keeps_partial_result() {
        let backend = ScriptedBackend::new(vec![ScriptedEvent::delta(10, "partial answer")])
            .stall_after_events();
        let result = rewriter(backend).rewrite("question", 100.0).await.unwrap();

        assert_eq!(result.queries, vec!["partial answer"]);
        assert!(result.elapsed_time >= 90.0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_fragments_are_skipped() {
        let backend = ScriptedBackend::new(vec![
            ScriptedEvent::Malformed,
            ScriptedEvent::delta(1, "usable query\n"),
        ]);
        let consumed = backend.consumed();
        let result = rewriter(backend).rewrite("question", 100.0).await.unwrap();

        assert_eq!(consumed.load(Ordering::SeqCst), 2);
        assert_eq!(result.queries, vec!["usable query"]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_delta_with_many_lines_is_capped() {
        let backend =
            ScriptedBackend::new(vec![ScriptedEvent::delta(1, "one\ntwo\nthree\nfour\n")]);
        let result = rewriter(backend).rewrite("question", 100.0).await.unwrap();

        assert_eq!(result.queries, vec!["one", "two", "three"]);
    }

    #[tokio::test(start_paused = true)]
    async fn nonsensical_latency_budget_uses_default() {
        let backend = ScriptedBackend::new(vec![ScriptedEvent::delta(1, "query\n")]);
        let result = rewriter(backend).rewrite("question", f64::NAN).await.unwrap();

        assert_eq!(result.queries, vec!["query"]);
    }

    #[test]
    fn token_budget_keeps_base_for_short_questions() {
        assert_eq!(completion_token_budget("short", 20), 20);
    }

    #[test]
    fn token_budget_shrinks_with_question_length() {
        let question = "q".repeat(80);
        assert_eq!(completion_token_budget(&question, 20), 18);
    }

    #[test]
    fn token_budget_clamps_at_floor() {
        let question = "q".repeat(4000);
        assert_eq!(completion_token_budget(&question, 20), 12);
    }

    #[test]
    fn parse_trims_bullets_and_whitespace() {
        let parsed = parse_queries(
            " - Fast query reformulation \n* Query expansion\n• Query refinement\n",
            "q",
        );
        assert_eq!(
            parsed,
            vec![
                "Fast query reformulation",
                "Query expansion",
                "Query refinement"
            ]
        );
    }

    #[test]
    fn parse_drops_empty_lines_and_caps_count() {
        let parsed = parse_queries("a\n\nb\nc\nd\n", "q");
        assert_eq!(parsed, vec!["a", "b", "c"]);
    }

    #[test]
    fn parse_is_idempotent_on_the_same_buffer() {
        let raw = "one\n two \n- three\n";
        assert_eq!(parse_queries(raw, "q"), parse_queries(raw, "q"));
    }

    #[test]
    fn parse_falls_back_to_question() {
        assert_eq!(parse_queries("  \n \n", "the question"), vec!["the question"]);
    }
}
