//! Per-term stage pipeline: cache lookup, rate-limited and breaker-guarded
//! LLM calls, and response parsing.
//!
//! Call composition mirrors the teacher's nested `execute(closure)` style
//! (`circuit_breaker.rs::execute`, `retry.rs::execute`) generalized off
//! `tower`: retry is outermost, wrapping a rate-limit acquire, wrapping a
//! breaker-guarded, timeout-bounded LLM call.

use crate::backoff::RetryBackoff;
use crate::cache::{Cache, CacheConfig};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use crate::circuit_breaker_registry::BreakerRegistry;
use crate::config::{BreakerMode, PipelineConfig};
use crate::error::{ErrorKind, PipelineError};
use crate::llm_client::LlmClient;
use crate::orchestrator::CancelSignal;
use crate::progress::ProgressTracker;
use crate::rate_limit::store::InMemoryTokenStore;
use crate::rate_limit::{Decision, RateLimiter, TokenBucketLimiter};
use crate::retry::RetryPolicy;
use crate::telemetry::{emit_best_effort, CacheTier, PipelineEvent, Stage as TelemetryStage, TelemetrySink};
use crate::timeout::TimeoutPolicy;
use crate::types::{FlashcardRow, ProcessingResult, Stage1Result, Stage2Result, Term};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct StageWorker<L, T> {
    llm: Arc<L>,
    cache: Arc<Cache>,
    stage1_limiter: Arc<dyn RateLimiter>,
    stage2_limiter: Arc<dyn RateLimiter>,
    breakers: BreakerRegistry,
    retry: RetryPolicy,
    stage1_timeout: TimeoutPolicy,
    stage2_timeout: TimeoutPolicy,
    telemetry: Arc<T>,
}

impl<L, T> std::fmt::Debug for StageWorker<L, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageWorker")
            .field("retry", &self.retry)
            .field("stage1_timeout", &self.stage1_timeout)
            .field("stage2_timeout", &self.stage2_timeout)
            .finish_non_exhaustive()
    }
}

impl<L, T> StageWorker<L, T>
where
    L: LlmClient,
    T: TelemetrySink,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<L>,
        cache: Arc<Cache>,
        stage1_limiter: Arc<dyn RateLimiter>,
        stage2_limiter: Arc<dyn RateLimiter>,
        breakers: BreakerRegistry,
        retry: RetryPolicy,
        stage1_timeout: TimeoutPolicy,
        stage2_timeout: TimeoutPolicy,
        telemetry: Arc<T>,
    ) -> Self {
        Self {
            llm,
            cache,
            stage1_limiter,
            stage2_limiter,
            breakers,
            retry,
            stage1_timeout,
            stage2_timeout,
            telemetry,
        }
    }

    /// Assembles a full worker from a [`PipelineConfig`], wiring its settings
    /// into the concrete cache, per-stage rate limiters, breaker registry,
    /// retry policy, and timeouts that [`StageWorker::new`] otherwise expects
    /// the caller to build by hand. `config.timeouts.batch_ms` is not used
    /// here: it governs a whole batch's wall-clock budget, not a single
    /// stage call, so it belongs to the orchestrator's `BatchOptions` (see
    /// [`PipelineConfig::batch_options`]) rather than this worker.
    pub fn from_config(config: &PipelineConfig, llm: Arc<L>, telemetry: Arc<T>) -> Result<Self, PipelineError> {
        let cache = Arc::new(Cache::new(CacheConfig {
            dir: config.cache.dir.clone(),
            ttl: Duration::from_secs(config.cache.ttl_seconds),
            tier1_max_entries: config.cache.max_entries,
            tier1_max_bytes: config.cache.max_bytes,
        }));

        let stage1_limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucketLimiter::new(
            InMemoryTokenStore::new(),
            "stage1",
            config.stage1_rate_per_minute / 60.0,
            config.rate_burst as f64,
        ));
        let stage2_limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucketLimiter::new(
            InMemoryTokenStore::new(),
            "stage2",
            config.stage2_rate_per_minute / 60.0,
            config.rate_burst as f64,
        ));

        let mut breaker_config =
            CircuitBreakerConfig::new(config.breaker.failure_threshold, config.breaker.recovery_timeout);
        if config.breaker.mode == BreakerMode::Adaptive {
            breaker_config = breaker_config.adaptive();
        }
        let breakers = BreakerRegistry::new(breaker_config);

        let retry = RetryPolicy::builder()
            .max_attempts(config.retry.max_attempts)
            .map_err(|e| PipelineError::internal(format!("invalid retry config: {e}")))?
            .backoff(
                RetryBackoff::exponential(Duration::from_millis(config.retry.base_delay_ms))
                    .with_max(Duration::from_millis(config.retry.max_delay_ms)),
            )
            .build();

        let stage1_timeout = TimeoutPolicy::new(Duration::from_millis(config.timeouts.stage1_ms))
            .map_err(|e| PipelineError::internal(format!("invalid stage1 timeout: {e}")))?;
        let stage2_timeout = TimeoutPolicy::new(Duration::from_millis(config.timeouts.stage2_ms))
            .map_err(|e| PipelineError::internal(format!("invalid stage2 timeout: {e}")))?;

        Ok(Self::new(
            llm,
            cache,
            stage1_limiter,
            stage2_limiter,
            breakers,
            retry,
            stage1_timeout,
            stage2_timeout,
            telemetry,
        ))
    }

    /// Emits `BreakerOpened`/`BreakerClosed` when a call observably flips
    /// the breaker's state; most calls see no transition and emit nothing.
    /// `failure_count` comes from a propagated `BreakerOpen` error when one
    /// is available, since `CircuitBreakerPolicy` doesn't otherwise expose
    /// its internal failure counter.
    async fn emit_breaker_transition(
        &self,
        service: &str,
        before: CircuitState,
        after: CircuitState,
        last_error: Option<&PipelineError>,
    ) {
        if before == after {
            return;
        }
        let event = match after {
            CircuitState::Open => {
                let failure_count = match last_error.map(|e| &e.kind) {
                    Some(ErrorKind::BreakerOpen { failure_count, .. }) => *failure_count,
                    _ => 0,
                };
                PipelineEvent::BreakerOpened { service: service.to_string(), failure_count }
            }
            CircuitState::Closed => PipelineEvent::BreakerClosed { service: service.to_string() },
            CircuitState::HalfOpen => PipelineEvent::BreakerHalfOpen { service: service.to_string() },
        };
        emit_best_effort(self.telemetry.as_ref(), event).await;
    }

    /// Processes one term end to end. Never propagates an error: any
    /// give-up failure is converted into a failed `ProcessingResult` so
    /// the orchestrator's batch continues.
    pub async fn process_term(
        &self,
        term: Term,
        cancel: CancelSignal,
        progress: &ProgressTracker,
    ) -> ProcessingResult {
        let start = Instant::now();
        progress.start_item(term.position).await;

        let outcome = self.run(&term, &cancel).await;
        let result = match outcome {
            Ok((flashcards, from_cache)) => {
                progress.complete_item(term.position, true, from_cache).await;
                ProcessingResult::success(term.position, term.term.clone(), flashcards, from_cache, start.elapsed())
            }
            Err(err) => {
                progress.complete_item(term.position, false, false).await;
                ProcessingResult::failure(term.position, term.term.clone(), &err, start.elapsed())
            }
        };

        emit_best_effort(
            self.telemetry.as_ref(),
            PipelineEvent::ItemCompleted { term: result.term.clone(), success: result.ok, duration: start.elapsed() },
        )
        .await;
        result
    }

    async fn run(&self, term: &Term, cancel: &CancelSignal) -> Result<(Stage2Result, bool), PipelineError> {
        let (stage1, hit1) = self.stage1(term, cancel).await?;
        let cache_key = crate::cache::stage2_cache_key(&term.term, &stage1)?;
        let (stage2, hit2) = self.stage2(term, &stage1, &cache_key, cancel).await?;
        Ok((stage2, hit1 && hit2))
    }

    async fn stage1(&self, term: &Term, cancel: &CancelSignal) -> Result<(Stage1Result, bool), PipelineError> {
        if let Some(cached) = self.cache.get_stage1(&term.term, term.kind.as_deref()).await {
            emit_best_effort(
                self.telemetry.as_ref(),
                PipelineEvent::CacheHit { stage: TelemetryStage::One, tier: CacheTier::Memory },
            )
            .await;
            return Ok((cached, true));
        }
        emit_best_effort(self.telemetry.as_ref(), PipelineEvent::CacheMiss { stage: TelemetryStage::One }).await;
        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled());
        }

        let breaker = self.breakers.get_or_create("llm");
        let before = breaker.state();
        let outcome = self
            .retry
            .execute(|| async {
                acquire(self.stage1_limiter.as_ref(), TelemetryStage::One, self.telemetry.as_ref(), cancel).await?;
                let call = breaker.execute(|| self.stage1_timeout.execute(|| self.llm.process_stage1(term))).await;
                notify_limiter(self.stage1_limiter.as_ref(), &call);
                call
            })
            .await;
        self.emit_breaker_transition("llm", before, breaker.state(), outcome.as_ref().err()).await;
        let (result, usage) = outcome?;

        self.cache.save_stage1(&term.term, term.kind.as_deref(), result.clone(), usage.tokens_total).await;
        Ok((result, false))
    }

    async fn stage2(
        &self,
        term: &Term,
        stage1: &Stage1Result,
        cache_key: &str,
        cancel: &CancelSignal,
    ) -> Result<(Stage2Result, bool), PipelineError> {
        if let Some(cached) = self.cache.get_stage2(cache_key).await {
            emit_best_effort(
                self.telemetry.as_ref(),
                PipelineEvent::CacheHit { stage: TelemetryStage::Two, tier: CacheTier::Memory },
            )
            .await;
            return Ok((cached, true));
        }
        emit_best_effort(self.telemetry.as_ref(), PipelineEvent::CacheMiss { stage: TelemetryStage::Two }).await;
        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled());
        }

        let breaker = self.breakers.get_or_create("llm");
        let before = breaker.state();
        let outcome = self
            .retry
            .execute(|| async {
                acquire(self.stage2_limiter.as_ref(), TelemetryStage::Two, self.telemetry.as_ref(), cancel).await?;
                let call =
                    breaker.execute(|| self.stage2_timeout.execute(|| self.llm.process_stage2(term, stage1))).await;
                notify_limiter(self.stage2_limiter.as_ref(), &call);
                call
            })
            .await;
        self.emit_breaker_transition("llm", before, breaker.state(), outcome.as_ref().err()).await;
        let (content, usage) = outcome?;

        let result = parse_stage2_content(&content, term.position, &term.term)?;
        self.cache.save_stage2(cache_key, result.clone(), usage.tokens_total).await;
        Ok((result, false))
    }
}

/// Blocks until the limiter admits one permit for `stage`, or returns
/// `Cancelled` if the batch is cancelled while waiting.
async fn acquire<T: TelemetrySink + ?Sized>(
    limiter: &dyn RateLimiter,
    stage: TelemetryStage,
    telemetry: &T,
    cancel: &CancelSignal,
) -> Result<(), PipelineError> {
    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled());
        }
        let decision = limiter
            .acquire(1)
            .await
            .map_err(|e| PipelineError::internal(format!("rate limiter failure: {e}")))?;

        match decision {
            Decision::Allowed { .. } => return Ok(()),
            Decision::Denied { wait, .. } => {
                emit_best_effort(telemetry, PipelineEvent::RateLimited { stage, wait }).await;
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => return Err(PipelineError::cancelled()),
                }
            }
        }
    }
}

/// Reports an LLM call's outcome back to its rate limiter: a clean result
/// clears any decayed-rate bookkeeping, a rate-limit error pauses and
/// decays admissions for this bucket.
fn notify_limiter<T>(limiter: &dyn RateLimiter, outcome: &Result<T, PipelineError>) {
    match outcome {
        Ok(_) => limiter.on_success(),
        Err(err) => {
            if let ErrorKind::RateLimit { retry_after } = err.kind {
                limiter.on_rate_limit(retry_after);
            }
        }
    }
}

/// Extracts a Stage 1 JSON object, stripping a fenced code block if present.
pub(crate) fn parse_stage1_content(content: &str) -> Result<Stage1Result, PipelineError> {
    let json_text = extract_fenced_block(content).unwrap_or_else(|| content.trim());
    serde_json::from_str(json_text).map_err(|e| PipelineError::validation(format!("invalid stage 1 JSON: {e}")))
}

fn extract_fenced_block(content: &str) -> Option<&str> {
    let trimmed = content.trim();
    let start = trimmed.find("```")?;
    let after_open = &trimmed[start + 3..];
    let after_open = after_open.strip_prefix("json").unwrap_or(after_open);
    let after_open = after_open.trim_start_matches('\n');
    let end = after_open.find("```")?;
    Some(after_open[..end].trim())
}

/// Parses Stage 2 TSV content, with or without a header row. Columns:
/// `position term term_number tab_name primer front back tags [honorific_level]`.
/// `position`/`term` are taken from the caller, not the echoed columns.
pub(crate) fn parse_stage2_content(
    content: &str,
    position: u32,
    term: &str,
) -> Result<Stage2Result, PipelineError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::validation("stage 2 response was empty"));
    }

    let mut lines: Vec<&str> = trimmed.lines().collect();
    if lines.first().map(|l| l.starts_with("position\tterm")).unwrap_or(false) {
        lines.remove(0);
    }

    let mut rows = Vec::new();
    for (idx, line) in lines.into_iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 8 {
            return Err(PipelineError::validation(format!(
                "stage 2 row {idx} has {} fields, expected at least 8",
                parts.len()
            )));
        }

        rows.push(FlashcardRow {
            position,
            term: term.to_string(),
            row: parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(idx as u32 + 1),
            tab_name: parts.get(3).copied().unwrap_or("").to_string(),
            primer: parts.get(4).copied().unwrap_or("").to_string(),
            front: parts.get(5).copied().unwrap_or("").to_string(),
            back: parts.get(6).copied().unwrap_or("").to_string(),
            tags: parts
                .get(7)
                .map(|s| s.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect())
                .unwrap_or_default(),
            honorific_level: parts.get(8).copied().unwrap_or("").to_string(),
        });
    }

    if rows.is_empty() {
        return Err(PipelineError::validation("stage 2 response contained no flashcard rows"));
    }

    Ok(Stage2Result { rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, TimeoutSettings};
    use crate::telemetry::NullSink;

    struct UnusedLlm;

    #[async_trait::async_trait]
    impl LlmClient for UnusedLlm {
        async fn process_stage1(&self, _term: &Term) -> Result<(Stage1Result, crate::types::Usage), PipelineError> {
            unreachable!("from_config tests never drive a real call")
        }

        async fn process_stage2(
            &self,
            _term: &Term,
            _stage1: &Stage1Result,
        ) -> Result<(String, crate::types::Usage), PipelineError> {
            unreachable!("from_config tests never drive a real call")
        }
    }

    #[test]
    fn from_config_wires_a_runnable_worker() {
        let config = PipelineConfig::default();
        let worker = StageWorker::from_config(&config, Arc::new(UnusedLlm), Arc::new(NullSink));
        assert!(worker.is_ok());
    }

    #[test]
    fn from_config_rejects_a_zero_stage_timeout() {
        let config = PipelineConfig::builder()
            .timeouts(TimeoutSettings { stage1_ms: 0, stage2_ms: 60_000, batch_ms: 600_000 })
            .build();
        let err = StageWorker::from_config(&config, Arc::new(UnusedLlm), Arc::new(NullSink)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[test]
    fn parses_fenced_stage1_json() {
        let content = "Here you go:\n```json\n{\"phonetic\":\"x\",\"part_of_speech\":\"noun\",\"primary_meaning\":\"y\",\"secondary_meanings\":[],\"mnemonic\":{\"metaphor\":\"m\",\"location\":\"l\",\"anchor\":\"a\"},\"comparison\":{\"vs\":\"v\",\"nuance\":\"n\"},\"homonyms\":[],\"keywords\":[]}\n```";
        let result = parse_stage1_content(content).unwrap();
        assert_eq!(result.phonetic, "x");
    }

    #[test]
    fn parses_bare_stage1_json() {
        let content = "{\"phonetic\":\"x\",\"part_of_speech\":\"noun\",\"primary_meaning\":\"y\",\"secondary_meanings\":[],\"mnemonic\":{\"metaphor\":\"m\",\"location\":\"l\",\"anchor\":\"a\"},\"comparison\":{\"vs\":\"v\",\"nuance\":\"n\"},\"homonyms\":[],\"keywords\":[]}";
        assert!(parse_stage1_content(content).is_ok());
    }

    #[test]
    fn malformed_stage1_json_is_a_validation_error() {
        let err = parse_stage1_content("not json").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn parses_stage2_tsv_with_header() {
        let content = "position\tterm\tterm_number\ttab_name\tprimer\tfront\tback\ttags\thonorific_level\n1\tephemeral\t1\tVocab\tprimer text\tfront\tback\ta,b\tplain";
        let result = parse_stage2_content(content, 1, "ephemeral").unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].tags, vec!["a", "b"]);
    }

    #[test]
    fn parses_stage2_tsv_without_header() {
        let content = "1\tephemeral\t1\tVocab\tprimer\tfront\tback\ttag";
        let result = parse_stage2_content(content, 1, "ephemeral").unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].front, "front");
    }

    #[test]
    fn stage2_short_row_is_a_validation_error() {
        let err = parse_stage2_content("a\tb\tc", 1, "term").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn stage2_empty_content_is_a_validation_error() {
        assert!(parse_stage2_content("", 1, "term").is_err());
    }
}
