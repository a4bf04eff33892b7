use async_trait::async_trait;
use flashpipe::telemetry::{MemorySink, PipelineEvent};
use flashpipe::{
    BatchOptions, CancelSignal, Comparison, LlmClient, MnemonicStructure, PipelineConfig, PipelineError,
    PipelineOrchestrator, RetrySettings, Stage1Result, StageWorker, Term, Usage,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct ScriptedLlm {
    stage1_failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn process_stage1(&self, term: &Term) -> Result<(Stage1Result, Usage), PipelineError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.stage1_failures {
            return Err(PipelineError::server_api(503, "transient"));
        }
        Ok((
            Stage1Result {
                phonetic: "fx".into(),
                part_of_speech: "noun".into(),
                primary_meaning: term.term.clone(),
                secondary_meanings: vec![],
                mnemonic: MnemonicStructure { metaphor: "m".into(), location: "l".into(), anchor: "a".into() },
                comparison: Comparison { vs: "v".into(), nuance: "n".into() },
                homonyms: vec![],
                keywords: vec![],
            },
            Usage::default(),
        ))
    }

    async fn process_stage2(
        &self,
        term: &Term,
        _stage1: &Stage1Result,
    ) -> Result<(String, Usage), PipelineError> {
        Ok((format!("{}\t{}\t1\tVocab\tprimer\tfront\tback\ttag", term.position, term.term), Usage::default()))
    }
}

fn make_worker(
    llm: ScriptedLlm,
    telemetry: Arc<MemorySink>,
) -> Arc<StageWorker<ScriptedLlm, MemorySink>> {
    let config = PipelineConfig::builder()
        .stage_rates(60_000.0, 60_000.0)
        .rate_burst(1_000)
        .retry(RetrySettings { max_attempts: 3, base_delay_ms: 1, max_delay_ms: 10 })
        .build();
    Arc::new(StageWorker::from_config(&config, Arc::new(llm), telemetry).expect("valid test config"))
}

#[tokio::test]
async fn batch_recovers_from_transient_failures_and_preserves_order() {
    let telemetry = Arc::new(MemorySink::new());
    let llm = ScriptedLlm { stage1_failures: 2, calls: AtomicUsize::new(0) };
    let worker = make_worker(llm, telemetry.clone());
    let orchestrator = PipelineOrchestrator::new(
        worker,
        Arc::new(flashpipe::NullRecorder),
        telemetry.clone(),
    );

    let terms = vec![Term::new(1, "alpha"), Term::new(2, "beta"), Term::new(3, "gamma")];
    let results = orchestrator
        .process_batch(terms, BatchOptions { max_concurrent: 2, ..Default::default() }, CancelSignal::new())
        .await;

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.ok));

    let events = telemetry.events();
    assert!(events.iter().any(|e| matches!(e, PipelineEvent::BatchCompleted { .. })));
    assert!(events.iter().any(|e| matches!(e, PipelineEvent::ItemCompleted { .. })));
}

#[tokio::test]
async fn batch_options_from_config_drive_a_real_run() {
    let telemetry = Arc::new(MemorySink::new());
    let llm = ScriptedLlm { stage1_failures: 0, calls: AtomicUsize::new(0) };
    let worker = make_worker(llm, telemetry.clone());
    let orchestrator = PipelineOrchestrator::new(worker, Arc::new(flashpipe::NullRecorder), telemetry);

    let config = PipelineConfig::builder().max_concurrent(2).build();
    let terms = vec![Term::new(1, "alpha"), Term::new(2, "beta")];
    let results = orchestrator
        .process_batch(terms, config.batch_options("config-driven-batch"), CancelSignal::new())
        .await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.ok));
}

#[tokio::test]
async fn cancelling_mid_batch_fails_unstarted_terms() {
    let telemetry = Arc::new(MemorySink::new());
    let llm = ScriptedLlm { stage1_failures: 0, calls: AtomicUsize::new(0) };
    let worker = make_worker(llm, telemetry.clone());
    let orchestrator = PipelineOrchestrator::new(worker, Arc::new(flashpipe::NullRecorder), telemetry);

    let cancel = CancelSignal::new();
    cancel.cancel();
    let terms = vec![Term::new(1, "alpha"), Term::new(2, "beta")];

    let results = orchestrator
        .process_batch(terms, BatchOptions { max_concurrent: 1, ..Default::default() }, cancel)
        .await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| !r.ok));
}
