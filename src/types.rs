//! Core data model shared by every pipeline component: the input `Term`,
//! the per-stage LLM outputs, and the aggregate result/metrics types that
//! flow out of a batch.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One vocabulary term to push through the two-stage pipeline.
///
/// `position` is the 1-based ordinal within its batch and the primary key
/// the [`crate::collector::OrderedCollector`] uses to restore output order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    pub position: u32,
    pub term: String,
    pub kind: Option<String>,
}

impl Term {
    pub fn new(position: u32, term: impl Into<String>) -> Self {
        Self { position, term: term.into(), kind: None }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// Token/cost accounting returned alongside every LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub tokens_prompt: u32,
    pub tokens_completion: u32,
    pub tokens_total: u32,
    pub estimated_cost: f64,
}

/// A mnemonic triad: a metaphor, an imagined location, and an anchor detail
/// that ties the two together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MnemonicStructure {
    pub metaphor: String,
    pub location: String,
    pub anchor: String,
}

/// A contrast against a commonly confused term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub vs: String,
    pub nuance: String,
}

/// Stage 1 semantic analysis of one term. Cached and reused to key Stage 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage1Result {
    pub phonetic: String,
    pub part_of_speech: String,
    pub primary_meaning: String,
    pub secondary_meanings: Vec<String>,
    pub mnemonic: MnemonicStructure,
    pub comparison: Comparison,
    pub homonyms: Vec<String>,
    pub keywords: Vec<String>,
}

/// One rendered flashcard row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashcardRow {
    pub position: u32,
    pub term: String,
    pub row: u32,
    pub tab_name: String,
    pub primer: String,
    pub front: String,
    pub back: String,
    pub tags: Vec<String>,
    pub honorific_level: String,
}

/// Stage 2 output: the ordered set of flashcard rows rendered for a term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage2Result {
    pub rows: Vec<FlashcardRow>,
}

/// Outcome of processing a single `Term` end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub position: u32,
    pub term: String,
    pub ok: bool,
    pub flashcards: Option<Stage2Result>,
    pub error: Option<ResultError>,
    pub from_cache: bool,
    pub duration_ms: u64,
}

impl ProcessingResult {
    pub fn success(position: u32, term: impl Into<String>, flashcards: Stage2Result, from_cache: bool, duration: Duration) -> Self {
        Self {
            position,
            term: term.into(),
            ok: true,
            flashcards: Some(flashcards),
            error: None,
            from_cache,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn failure(position: u32, term: impl Into<String>, error: &PipelineError, duration: Duration) -> Self {
        Self {
            position,
            term: term.into(),
            ok: false,
            flashcards: None,
            error: Some(ResultError::from(error)),
            from_cache: false,
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// A synthetic entry for a position the collector never received,
    /// per spec's "missing positions become synthesized error entries"
    /// retrieval-time gap fill.
    pub fn missing(position: u32) -> Self {
        Self {
            position,
            term: String::new(),
            ok: false,
            flashcards: None,
            error: Some(ResultError {
                kind: "Internal".to_string(),
                message: "result not collected".to_string(),
            }),
            from_cache: false,
            duration_ms: 0,
        }
    }
}

/// A serializable snapshot of a `PipelineError`, suitable for embedding in
/// a `ProcessingResult` that may itself be serialized for the monitor or
/// a Tier-2 cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultError {
    pub kind: String,
    pub message: String,
}

impl From<&PipelineError> for ResultError {
    fn from(err: &PipelineError) -> Self {
        Self { kind: format!("{:?}", err.kind), message: err.message.clone() }
    }
}

/// Aggregate counters for one batch run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub rate_limit_waits: usize,
    pub breaker_rejections: usize,
    pub retries: usize,
    pub concurrency_high_water_mark: usize,
    pub tokens_total: u64,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// One stored cache entry, as written to Tier 2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub stage: Stage,
    pub payload: T,
    pub created_at_ms: u64,
    pub ttl_secs: u64,
    pub tokens_used: u32,
}

/// The pipeline's two independently rate-limited, independently cached
/// phases. Passed explicitly by the worker rather than inferred from a
/// model-name string (see DESIGN.md's Open Question #1 resolution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    One,
    Two,
}
