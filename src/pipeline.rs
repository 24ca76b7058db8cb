//! Batch driver: reads documents, runs them through normalize → segment →
//! tokenize, and commits the results.
//!
//! Ownership model:
//! - The driver owns every document's lifecycle through a [`DocumentTracker`];
//!   no other component changes a document's state.
//! - Within a batch each stage runs over all live documents in parallel before
//!   the next stage starts. A failure is scoped to its document.
//! - Commit writes the shard payload first and the manifest entry second, so a
//!   crash in between only causes the document to be reprocessed.
//! - Tokenizer capabilities run on a helper thread per document. The driver
//!   stops waiting once the stage budget is spent, so a stalled capability
//!   fails its document instead of holding up the batch.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::{PipelineConfig, RunMode};
use crate::data::{Content, ManifestEntry, QuarantineEntry, Record, Stage};
use crate::errors::{ErrorKind, PipelineError};
use crate::metrics::CorpusStats;
use crate::normalize::Normalizer;
use crate::segment::Segmenter;
use crate::source::{ReaderRegistry, ReaderSpec, RecordStream, StreamItem};
use crate::store::{CorpusStore, DocumentInfo};
use crate::tokenize::{Tokenizer, TokenizerDescriptor, TokenizerRegistry};
use crate::types::{Checksum, EngineName, SourceId, SplitName, TransformName};

/// Engine name reported when a document's language has no configured engine.
const UNCONFIGURED_ENGINE: &str = "unconfigured";

/// Driver step a document is in (or failed in).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStage {
    /// Pulling the raw record from the source.
    Reading,
    /// Decoding and normalizing.
    Normalizing,
    /// Splitting into segments.
    Segmenting,
    /// Running the language's tokenizer.
    Tokenizing,
    /// Writing the shard payload and manifest entry.
    Committing,
}

impl DocumentStage {
    /// Record stage this step produces.
    pub fn output_stage(self) -> Stage {
        match self {
            Self::Reading => Stage::Raw,
            Self::Normalizing => Stage::Normalized,
            Self::Segmenting => Stage::Segmented,
            Self::Tokenizing | Self::Committing => Stage::Tokenized,
        }
    }
}

impl fmt::Display for DocumentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reading => "reading",
            Self::Normalizing => "normalizing",
            Self::Segmenting => "segmenting",
            Self::Tokenizing => "tokenizing",
            Self::Committing => "committing",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of one source document within a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum DocumentState {
    /// Not yet pulled from the source.
    Pending,
    /// Read and being triaged.
    Reading,
    /// In the normalize stage.
    Normalizing,
    /// In the segment stage.
    Segmenting,
    /// In the tokenize stage.
    Tokenizing,
    /// Output and manifest entry are durable.
    Committed,
    /// Already committed under the same configuration, or a repeated source id.
    Skipped,
    /// Language not selected for this run.
    Ignored,
    /// Quarantined after an error.
    Failed {
        /// Step the document failed in.
        stage: DocumentStage,
        /// Error classification.
        kind: ErrorKind,
    },
}

impl DocumentState {
    /// True for states a document never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Committed | Self::Skipped | Self::Ignored | Self::Failed { .. }
        )
    }

    /// True when the driver may move a document from `self` to `next`.
    pub fn can_advance_to(&self, next: &DocumentState) -> bool {
        use DocumentState::*;
        match (self, next) {
            (Pending, Reading) => true,
            (Reading, Normalizing | Skipped | Ignored) => true,
            (Normalizing, Segmenting) => true,
            (Segmenting, Tokenizing) => true,
            (Tokenizing, Committed) => true,
            (current, Failed { .. }) => !current.is_terminal() && *current != Pending,
            _ => false,
        }
    }
}

/// Current state of one document, changed only by the driver.
#[derive(Clone, Debug)]
pub struct DocumentTracker {
    source_id: SourceId,
    state: DocumentState,
}

impl DocumentTracker {
    fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            state: DocumentState::Pending,
        }
    }

    /// Tracked document.
    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DocumentState {
        self.state
    }

    fn advance(&mut self, next: DocumentState) {
        debug_assert!(
            self.state.can_advance_to(&next),
            "invalid document transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!(source_id = %self.source_id, from = ?self.state, to = ?next, "document transition");
        self.state = next;
    }
}

/// Cooperative cancellation flag checked before each batch is dispatched.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; every clone observes it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once any clone has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Outcome of one run.
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    /// Checksum the run committed under.
    pub config_checksum: Checksum,
    /// Documents committed by this run.
    pub committed: usize,
    /// Documents already committed under this configuration, or repeated ids.
    pub skipped: usize,
    /// Documents in languages not selected for the run.
    pub ignored: usize,
    /// Failed documents by the step they failed in and the error kind.
    pub failed: BTreeMap<(DocumentStage, ErrorKind), usize>,
    /// Quarantine entries written during this run.
    pub quarantined: Vec<QuarantineEntry>,
    /// Statistics over documents committed by this run.
    pub stats: CorpusStats,
    /// The same statistics per input split (empty for unsplit input).
    pub split_stats: BTreeMap<SplitName, CorpusStats>,
    /// True when the run stopped early on a cancellation request.
    pub cancelled: bool,
    /// Reader offset of the first document not dispatched.
    pub next_offset: usize,
}

impl RunReport {
    /// Failed documents across every step and kind.
    pub fn failed_total(&self) -> usize {
        self.failed.values().sum()
    }

    /// Failed documents for one step and kind.
    pub fn failures(&self, stage: DocumentStage, kind: ErrorKind) -> usize {
        self.failed.get(&(stage, kind)).copied().unwrap_or(0)
    }

    /// Documents that reached a terminal state.
    pub fn processed(&self) -> usize {
        self.committed + self.skipped + self.ignored + self.failed_total()
    }
}

/// Result of running one document through every transformation.
#[derive(Clone, Debug, PartialEq)]
pub struct Transformed {
    /// Decoded, normalized document.
    pub normalized: Record,
    /// One tokenized record per segment, in segment order.
    pub tokenized: Vec<Record>,
}

struct InFlight {
    tracker: DocumentTracker,
    raw: Record,
    normalized: Option<Record>,
    segments: Vec<Record>,
    tokenized: Vec<Record>,
    token_count: usize,
    failure: Option<(DocumentStage, PipelineError)>,
}

impl InFlight {
    fn live(&self) -> bool {
        self.failure.is_none()
    }

    fn fail(&mut self, stage: DocumentStage, err: PipelineError) {
        self.tracker.advance(DocumentState::Failed {
            stage,
            kind: err.kind(),
        });
        self.failure = Some((stage, err));
    }
}

/// Wall-clock budget for one stage of one document.
#[derive(Clone, Copy, Debug)]
struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    fn check(&self, source_id: &SourceId, stage: DocumentStage) -> Result<(), PipelineError> {
        if self.started.elapsed() > self.budget {
            return Err(self.exceeded(source_id, stage));
        }
        Ok(())
    }

    fn exceeded(&self, source_id: &SourceId, stage: DocumentStage) -> PipelineError {
        PipelineError::StageTimeout {
            source_id: source_id.clone(),
            stage: stage.output_stage(),
            budget_ms: self.budget.as_millis(),
            elapsed_ms: self.started.elapsed().as_millis(),
        }
    }
}

/// One document's segments and the capability that tokenizes them.
struct TokenizeJob {
    source_id: SourceId,
    engine: EngineName,
    step: TransformName,
    tokenizer: Arc<dyn Tokenizer>,
    segments: Vec<Record>,
    deadline: Deadline,
}

impl TokenizeJob {
    /// Tokenize every segment in order, checking the deadline before each one.
    fn run(self) -> Result<Vec<Record>, PipelineError> {
        let mut tokenized = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            self.deadline
                .check(&self.source_id, DocumentStage::Tokenizing)?;
            let text = segment.text().unwrap_or_default();
            let tokens = panic::catch_unwind(AssertUnwindSafe(|| self.tokenizer.tokenize(text)))
                .map_err(|_| PipelineError::Tokenizer {
                    engine: self.engine.clone(),
                    reason: format!("tokenizer panicked on segment '{}'", segment.id()),
                })??;
            if tokens.is_empty() && !text.trim().is_empty() {
                return Err(PipelineError::Tokenizer {
                    engine: self.engine.clone(),
                    reason: format!("empty output for non-empty segment '{}'", segment.id()),
                });
            }
            tokenized.push(segment.derive(
                segment.position(),
                Content::Tokens(tokens),
                [self.step.clone()],
            ));
        }
        self.deadline
            .check(&self.source_id, DocumentStage::Tokenizing)?;
        Ok(tokenized)
    }
}

/// Configured pipeline ready to run against a corpus store.
pub struct Pipeline {
    config: PipelineConfig,
    readers: ReaderRegistry,
    tokenizers: Arc<TokenizerRegistry>,
    normalizer: Normalizer,
    segmenter: Segmenter,
    config_checksum: Checksum,
    pool: rayon::ThreadPool,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("config_checksum", &self.config_checksum)
            .finish()
    }
}

impl Pipeline {
    /// Pipeline with the built-in source readers.
    pub fn new(config: PipelineConfig, tokenizers: TokenizerRegistry) -> Result<Self, PipelineError> {
        Self::with_readers(config, ReaderRegistry::builtin(), tokenizers)
    }

    /// Validate the configuration and freeze the registries.
    ///
    /// Fails before any document is read when the configuration is invalid,
    /// the format tag is unknown, or a configured `(lang, engine)` pair has no
    /// registered tokenizer.
    pub fn with_readers(
        config: PipelineConfig,
        readers: ReaderRegistry,
        tokenizers: TokenizerRegistry,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        if !readers.contains(&config.format) {
            return Err(PipelineError::format(
                config.input.display(),
                format!("unrecognized source format '{}'", config.format),
            ));
        }
        let mut descriptors: Vec<&TokenizerDescriptor> = Vec::with_capacity(config.engines.len());
        for (lang, engine) in &config.engines {
            descriptors.push(&tokenizers.entry(lang, engine)?.descriptor);
        }
        let config_checksum = config.output_checksum(descriptors)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .build()
            .map_err(|err| PipelineError::Configuration(format!("cannot build worker pool: {err}")))?;
        Ok(Self {
            normalizer: Normalizer::new(config.normalizer.clone()),
            segmenter: Segmenter::new(config.segmentation),
            config,
            readers,
            tokenizers: tokenizers.freeze(),
            config_checksum,
            pool,
        })
    }

    /// Run configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Checksum of every setting that affects committed output.
    pub fn config_checksum(&self) -> &str {
        &self.config_checksum
    }

    /// Frozen tokenizer registry.
    pub fn tokenizers(&self) -> &Arc<TokenizerRegistry> {
        &self.tokenizers
    }

    /// Open the store named by the configuration.
    pub fn open_store(&self) -> Result<CorpusStore, PipelineError> {
        CorpusStore::open(&self.config.store_dir, self.config.shard_count)
    }

    /// Open the configured store and run to completion or cancellation.
    pub fn execute(&self, cancel: &CancellationToken) -> Result<RunReport, PipelineError> {
        let mut store = self.open_store()?;
        self.run(&mut store, cancel)
    }

    /// Process the configured input into `store`.
    ///
    /// Returns `Err` only for run-scoped failures (reader open, store I/O on
    /// the manifest or quarantine logs); document failures are reported.
    pub fn run(
        &self,
        store: &mut CorpusStore,
        cancel: &CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        if self.config.mode == RunMode::Restart {
            store.clear()?;
        }
        store.write_config_snapshot(&self.config, &self.config_checksum)?;

        let mut stream = self.open_input()?;
        info!(
            input = %self.config.input.display(),
            splits = self.config.splits.len(),
            format = %self.config.format,
            offset = self.config.start_offset,
            config_checksum = %self.config_checksum,
            "starting corpus run"
        );

        let store: &CorpusStore = store;
        let mut report = RunReport {
            config_checksum: self.config_checksum.clone(),
            next_offset: stream.position(),
            ..RunReport::default()
        };
        let mut seen = HashSet::new();
        loop {
            if cancel.is_cancelled() {
                info!(next_offset = report.next_offset, "run cancelled before next batch");
                report.cancelled = true;
                break;
            }
            let first_offset = stream.position();
            let batch: Vec<StreamItem> = stream.by_ref().take(self.config.batch_size).collect();
            if batch.is_empty() {
                break;
            }
            debug!(offset = first_offset, documents = batch.len(), "dispatching batch");
            self.process_batch(batch, first_offset, store, &mut seen, &mut report)?;
            report.next_offset = stream.position();
        }

        info!(
            committed = report.committed,
            skipped = report.skipped,
            ignored = report.ignored,
            failed = report.failed_total(),
            cancelled = report.cancelled,
            next_offset = report.next_offset,
            "corpus run finished"
        );
        Ok(report)
    }

    fn open_input(&self) -> Result<RecordStream, PipelineError> {
        let spec = ReaderSpec::from_config(&self.config);
        if self.config.splits.is_empty() {
            return self
                .readers
                .open(&self.config.format, &spec, self.config.start_offset);
        }
        let splits: Vec<(SplitName, ReaderSpec)> = self
            .config
            .splits
            .iter()
            .map(|(name, path)| (name.clone(), spec.with_path(path)))
            .collect();
        self.readers
            .open_splits(&self.config.format, &splits, self.config.start_offset)
    }

    /// Run one raw record through every transformation without committing.
    pub fn transform(&self, raw: &Record) -> Result<Transformed, PipelineError> {
        let mut doc = InFlight {
            tracker: DocumentTracker::new(raw.source_id().clone()),
            raw: raw.clone(),
            normalized: None,
            segments: Vec::new(),
            tokenized: Vec::new(),
            token_count: 0,
            failure: None,
        };
        doc.tracker.advance(DocumentState::Reading);
        self.normalize_stage(&mut doc);
        self.segment_stage(&mut doc);
        self.tokenize_stage(&mut doc);
        if let Some((_, err)) = doc.failure {
            return Err(err);
        }
        let normalized = doc.normalized.ok_or_else(|| {
            PipelineError::Configuration("document produced no normalized record".into())
        })?;
        Ok(Transformed {
            normalized,
            tokenized: doc.tokenized,
        })
    }

    fn process_batch(
        &self,
        batch: Vec<StreamItem>,
        first_offset: usize,
        store: &CorpusStore,
        seen: &mut HashSet<SourceId>,
        report: &mut RunReport,
    ) -> Result<(), PipelineError> {
        let mut docs = Vec::with_capacity(batch.len());
        for (idx, item) in batch.into_iter().enumerate() {
            match item {
                Ok(record) => {
                    let mut tracker = DocumentTracker::new(record.source_id().clone());
                    tracker.advance(DocumentState::Reading);
                    if let Some(state) = self.triage(&record, store, seen)? {
                        tracker.advance(state);
                        match state {
                            DocumentState::Ignored => report.ignored += 1,
                            _ => report.skipped += 1,
                        }
                        continue;
                    }
                    docs.push(InFlight {
                        tracker,
                        raw: record,
                        normalized: None,
                        segments: Vec::new(),
                        tokenized: Vec::new(),
                        token_count: 0,
                        failure: None,
                    });
                }
                Err(err) => {
                    let origin = match &err {
                        PipelineError::Format { origin, .. } => origin.clone(),
                        _ => format!("{}@{}", self.config.input.display(), first_offset + idx),
                    };
                    let mut tracker = DocumentTracker::new(origin);
                    tracker.advance(DocumentState::Reading);
                    tracker.advance(DocumentState::Failed {
                        stage: DocumentStage::Reading,
                        kind: err.kind(),
                    });
                    self.record_failure(store, report, &tracker, DocumentStage::Reading, &err)?;
                }
            }
        }

        self.pool.install(|| {
            docs.par_iter_mut()
                .for_each(|doc| self.normalize_stage(doc));
            docs.par_iter_mut()
                .for_each(|doc| self.segment_stage(doc));
            docs.par_iter_mut()
                .for_each(|doc| self.tokenize_stage(doc));
            docs.par_iter_mut()
                .for_each(|doc| self.commit_stage(doc, store));
        });

        for doc in docs {
            match &doc.failure {
                Some((stage, err)) => {
                    self.record_failure(store, report, &doc.tracker, *stage, err)?;
                }
                None => {
                    let chars = doc
                        .normalized
                        .as_ref()
                        .and_then(Record::text)
                        .map(|text| text.chars().count())
                        .unwrap_or(0);
                    report.committed += 1;
                    report.stats.record_document(
                        doc.raw.lang(),
                        chars,
                        doc.tokenized.len(),
                        doc.token_count,
                    );
                    if let Some(split) = doc.raw.split() {
                        report
                            .split_stats
                            .entry(split.to_string())
                            .or_default()
                            .record_document(
                                doc.raw.lang(),
                                chars,
                                doc.tokenized.len(),
                                doc.token_count,
                            );
                    }
                }
            }
        }
        Ok(())
    }

    /// Terminal state for documents that are not processed, or `None` to process.
    fn triage(
        &self,
        record: &Record,
        store: &CorpusStore,
        seen: &mut HashSet<SourceId>,
    ) -> Result<Option<DocumentState>, PipelineError> {
        let source_id = record.source_id();
        if !seen.insert(source_id.clone()) {
            debug!(source_id = %source_id, "skipping repeated source id");
            return Ok(Some(DocumentState::Skipped));
        }
        if !self.config.accepts(record.lang()) {
            trace!(source_id = %source_id, lang = %record.lang(), "ignoring unselected language");
            return Ok(Some(DocumentState::Ignored));
        }
        if store
            .manifest_entry(source_id)?
            .is_some_and(|entry| entry.satisfies(&self.config_checksum))
        {
            trace!(source_id = %source_id, "already committed under this configuration");
            return Ok(Some(DocumentState::Skipped));
        }
        Ok(None)
    }

    fn normalize_stage(&self, doc: &mut InFlight) {
        if !doc.live() {
            return;
        }
        doc.tracker.advance(DocumentState::Normalizing);
        let result = self.timed(doc.tracker.source_id(), DocumentStage::Normalizing, || {
            self.normalizer.normalize(&doc.raw)
        });
        match result {
            Ok(normalized) => doc.normalized = Some(normalized),
            Err(err) => doc.fail(DocumentStage::Normalizing, err),
        }
    }

    fn segment_stage(&self, doc: &mut InFlight) {
        if !doc.live() {
            return;
        }
        doc.tracker.advance(DocumentState::Segmenting);
        let Some(normalized) = doc.normalized.as_ref() else {
            return;
        };
        let result = self.timed(doc.tracker.source_id(), DocumentStage::Segmenting, || {
            self.segmenter.segment(normalized)
        });
        match result {
            Ok(segments) => doc.segments = segments,
            Err(err) => doc.fail(DocumentStage::Segmenting, err),
        }
    }

    fn tokenize_stage(&self, doc: &mut InFlight) {
        if !doc.live() {
            return;
        }
        doc.tracker.advance(DocumentState::Tokenizing);
        match self.tokenize_watched(&doc.raw, &doc.segments) {
            Ok(tokenized) => {
                doc.token_count = tokenized
                    .iter()
                    .filter_map(Record::tokens)
                    .map(<[_]>::len)
                    .sum();
                doc.tokenized = tokenized;
            }
            Err(err) => doc.fail(DocumentStage::Tokenizing, err),
        }
    }

    /// Tokenize on a helper thread and stop waiting once the budget is spent.
    ///
    /// An overrunning capability is abandoned: its thread runs until the call
    /// returns, stops before the next segment, and its output is dropped.
    fn tokenize_watched(
        &self,
        raw: &Record,
        segments: &[Record],
    ) -> Result<Vec<Record>, PipelineError> {
        let lang = raw.lang();
        let engine = self
            .config
            .engines
            .get(lang)
            .ok_or_else(|| PipelineError::UnknownEngine {
                lang: lang.to_string(),
                engine: UNCONFIGURED_ENGINE.to_string(),
            })?;
        let entry = self.tokenizers.entry(lang, engine)?;
        let deadline = self.deadline();
        let job = TokenizeJob {
            source_id: raw.source_id().clone(),
            engine: engine.clone(),
            step: entry.descriptor.provenance_step(),
            tokenizer: Arc::clone(&entry.tokenizer),
            segments: segments.to_vec(),
            deadline,
        };

        let (sender, receiver) = mpsc::channel();
        thread::Builder::new()
            .name(format!("tokenize-{engine}"))
            .spawn(move || {
                // The receiver is gone when the driver gave up on this job.
                let _ = sender.send(job.run());
            })
            .map_err(|err| PipelineError::Tokenizer {
                engine: engine.clone(),
                reason: format!("cannot start tokenizer thread: {err}"),
            })?;

        match receiver.recv_timeout(deadline.remaining()) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    source_id = %raw.source_id(),
                    engine = %engine,
                    budget_ms = self.config.stage_timeout_ms,
                    "abandoning tokenizer past its stage budget"
                );
                Err(deadline.exceeded(raw.source_id(), DocumentStage::Tokenizing))
            }
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::Tokenizer {
                engine: engine.clone(),
                reason: "tokenizer thread exited without a result".into(),
            }),
        }
    }

    fn commit_stage(&self, doc: &mut InFlight, store: &CorpusStore) {
        if !doc.live() {
            return;
        }
        let source_id = doc.tracker.source_id().clone();
        let records = doc
            .tokenized
            .iter()
            .filter_map(Record::to_tokenized)
            .collect();
        let info = DocumentInfo {
            split: doc.raw.split().map(str::to_string),
            metadata: doc.raw.metadata().clone(),
        };
        let result = store.write_document(&source_id, &info, records).and_then(|checksum| {
            store.append_manifest(ManifestEntry {
                source_id: source_id.clone(),
                split: info.split.clone(),
                stage_completed: Stage::Tokenized,
                config_checksum: self.config_checksum.clone(),
                checksum_of_output: checksum,
                segments: doc.tokenized.len(),
                timestamp: Utc::now(),
            })
        });
        match result {
            Ok(()) => doc.tracker.advance(DocumentState::Committed),
            Err(err) => doc.fail(
                DocumentStage::Committing,
                PipelineError::Commit {
                    source_id,
                    reason: err.to_string(),
                },
            ),
        }
    }

    fn deadline(&self) -> Deadline {
        Deadline::start(Duration::from_millis(self.config.stage_timeout_ms))
    }

    /// Run a built-in stage and fail with `StageTimeout` when it went over budget.
    ///
    /// Normalizing and segmenting are linear in the document, so their budget
    /// is checked when they return; output over budget is discarded.
    fn timed<T>(
        &self,
        source_id: &SourceId,
        stage: DocumentStage,
        f: impl FnOnce() -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let deadline = self.deadline();
        let output = f()?;
        deadline.check(source_id, stage)?;
        Ok(output)
    }

    fn record_failure(
        &self,
        store: &CorpusStore,
        report: &mut RunReport,
        tracker: &DocumentTracker,
        stage: DocumentStage,
        err: &PipelineError,
    ) -> Result<(), PipelineError> {
        warn!(
            source_id = %tracker.source_id(),
            stage = %stage,
            kind = %err.kind(),
            error = %err,
            "document failed"
        );
        let entry = QuarantineEntry {
            source_id: tracker.source_id().clone(),
            stage: stage.to_string(),
            kind: err.kind(),
            reason: err.to_string(),
            timestamp: Utc::now(),
        };
        store.append_quarantine(&entry)?;
        *report.failed.entry((stage, err.kind())).or_default() += 1;
        report.quarantined.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Lang;
    use crate::tokenize::FnTokenizer;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn config(input: &Path, store_dir: &Path) -> PipelineConfig {
        let mut config = PipelineConfig {
            input: input.to_path_buf(),
            default_lang: Lang::En,
            store_dir: store_dir.to_path_buf(),
            shard_count: 2,
            batch_size: 2,
            workers: 2,
            ..PipelineConfig::default()
        };
        config.engines.insert(Lang::En, "whitespace".into());
        config
    }

    fn pipeline(config: PipelineConfig) -> Pipeline {
        let registry = TokenizerRegistry::from_engines(&config.engines).unwrap();
        Pipeline::new(config, registry).unwrap()
    }

    #[test]
    fn state_transitions_follow_the_lifecycle() {
        use DocumentState::*;
        assert!(Pending.can_advance_to(&Reading));
        assert!(Reading.can_advance_to(&Skipped));
        assert!(Tokenizing.can_advance_to(&Committed));
        assert!(Segmenting.can_advance_to(&Failed {
            stage: DocumentStage::Segmenting,
            kind: ErrorKind::StageTimeout
        }));
        assert!(!Pending.can_advance_to(&Committed));
        assert!(!Committed.can_advance_to(&Reading));
        assert!(!Skipped.can_advance_to(&Failed {
            stage: DocumentStage::Reading,
            kind: ErrorKind::Format
        }));
    }

    #[test]
    fn startup_rejects_unregistered_engine_and_unknown_format() {
        let temp = tempdir().unwrap();
        let cfg = config(&temp.path().join("in.txt"), temp.path());
        let err = Pipeline::new(cfg.clone(), TokenizerRegistry::new()).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownEngine { .. }));

        let mut bad_format = cfg;
        bad_format.format = "parquet".into();
        let registry = TokenizerRegistry::from_engines(&bad_format.engines).unwrap();
        assert!(matches!(
            Pipeline::new(bad_format, registry),
            Err(PipelineError::Format { .. })
        ));
    }

    #[test]
    fn transform_runs_every_stage() {
        let temp = tempdir().unwrap();
        let pipeline = pipeline(config(&temp.path().join("in.txt"), temp.path()));
        let raw = Record::raw("doc:1", Lang::En, b"Hello world. Bye now.".to_vec(), "read:lines");
        let out = pipeline.transform(&raw).unwrap();
        assert_eq!(out.normalized.text(), Some("Hello world. Bye now."));
        let tokens: Vec<Vec<String>> = out
            .tokenized
            .iter()
            .filter_map(Record::tokens)
            .map(<[String]>::to_vec)
            .collect();
        assert_eq!(tokens, vec![vec!["Hello", "world."], vec!["Bye", "now."]]);
        assert_eq!(
            out.tokenized[1].provenance(),
            ["read:lines", "normalize:nfkc", "segment:en", "tokenize:en/whitespace"]
        );
    }

    #[test]
    fn slow_stage_fails_only_that_document() {
        let temp = tempdir().unwrap();
        let input = temp.path().join("in.txt");
        fs::write(&input, "fast one.\nslow two.\nfast three.\n").unwrap();
        let mut cfg = config(&input, &temp.path().join("store"));
        cfg.stage_timeout_ms = 50;

        let mut registry = TokenizerRegistry::new();
        registry.register(
            TokenizerDescriptor::new(Lang::En, "whitespace"),
            Arc::new(FnTokenizer::new("whitespace", |text: &str| {
                if text.starts_with("slow") {
                    std::thread::sleep(Duration::from_millis(200));
                }
                Ok(text.split_whitespace().map(str::to_string).collect())
            })),
        );
        let pipeline = Pipeline::new(cfg, registry).unwrap();
        let report = pipeline.execute(&CancellationToken::new()).unwrap();

        assert_eq!(report.committed, 2);
        assert_eq!(report.failures(DocumentStage::Tokenizing, ErrorKind::StageTimeout), 1);
        assert_eq!(report.quarantined[0].source_id, "in:2");
    }

    #[test]
    fn stalled_tokenizer_is_abandoned_before_later_segments() {
        let temp = tempdir().unwrap();
        let input = temp.path().join("in.txt");
        fs::write(&input, "fast one.\nFine start. slow middle. Never reached.\nfast three.\n").unwrap();
        let mut cfg = config(&input, &temp.path().join("store"));
        cfg.stage_timeout_ms = 100;

        let reached = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&reached);
        let mut registry = TokenizerRegistry::new();
        registry.register(
            TokenizerDescriptor::new(Lang::En, "whitespace"),
            Arc::new(FnTokenizer::new("whitespace", move |text: &str| {
                if text.starts_with("slow") {
                    std::thread::sleep(Duration::from_millis(1500));
                }
                if text.starts_with("Never") {
                    flag.store(true, Ordering::SeqCst);
                }
                Ok(text.split_whitespace().map(str::to_string).collect())
            })),
        );
        let pipeline = Pipeline::new(cfg, registry).unwrap();

        let started = Instant::now();
        let report = pipeline.execute(&CancellationToken::new()).unwrap();
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(report.committed, 2);
        assert_eq!(report.failures(DocumentStage::Tokenizing, ErrorKind::StageTimeout), 1);
        assert_eq!(report.quarantined[0].source_id, "in:2");

        std::thread::sleep(Duration::from_millis(2000));
        assert!(!reached.load(Ordering::SeqCst));
        let store = pipeline.open_store().unwrap();
        assert!(store.read_document("in:2").unwrap().is_none());
    }

    #[test]
    fn tokenize_job_stops_at_the_first_segment_past_the_deadline() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let doc = Record::raw("doc:1", Lang::En, b"a b c".to_vec(), "read:lines");
        let segments: Vec<Record> = ["one.", "two.", "three."]
            .iter()
            .enumerate()
            .map(|(idx, text)| doc.derive(idx, Content::Segment(text.to_string()), ["segment:en"]))
            .collect();
        let job = TokenizeJob {
            source_id: "doc:1".into(),
            engine: "whitespace".into(),
            step: "tokenize:en/whitespace".into(),
            tokenizer: Arc::new(FnTokenizer::new("whitespace", move |text: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(60));
                Ok(vec![text.to_string()])
            })),
            segments,
            deadline: Deadline::start(Duration::from_millis(30)),
        };

        let err = job.run().unwrap_err();
        assert!(matches!(err, PipelineError::StageTimeout { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_document_commits_without_segments() {
        let temp = tempdir().unwrap();
        let input = temp.path().join("in.jsonl");
        fs::write(
            &input,
            concat!(
                "{\"id\":\"full\",\"text\":\"Hello there.\"}\n",
                "{\"id\":\"blank\",\"text\":\" \\t \"}\n",
            ),
        )
        .unwrap();
        let mut cfg = config(&input, &temp.path().join("store"));
        cfg.format = "jsonl".into();
        let pipeline = pipeline(cfg);
        let report = pipeline.execute(&CancellationToken::new()).unwrap();
        assert_eq!(report.committed, 2);
        assert_eq!(report.failed_total(), 0);

        let store = pipeline.open_store().unwrap();
        assert_eq!(store.read_document("blank").unwrap(), Some(Vec::new()));
        assert_eq!(store.manifest_entry("blank").unwrap().unwrap().segments, 0);
        assert_eq!(store.read_document("full").unwrap().unwrap().len(), 1);
    }

    #[test]
    fn cancelled_token_stops_before_first_batch() {
        let temp = tempdir().unwrap();
        let input = temp.path().join("in.txt");
        fs::write(&input, "a.\nb.\nc.\n").unwrap();
        let pipeline = pipeline(config(&input, &temp.path().join("store")));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = pipeline.execute(&cancel).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.processed(), 0);
        assert_eq!(report.next_offset, 0);
    }

    #[test]
    fn unselected_languages_are_ignored_and_unconfigured_ones_fail() {
        let temp = tempdir().unwrap();
        let input = temp.path().join("in.jsonl");
        fs::write(
            &input,
            concat!(
                "{\"text\":\"Hello.\",\"lang\":\"en\"}\n",
                "{\"text\":\"Bonjour.\",\"lang\":\"fr\"}\n",
                "{\"text\":\"Hallo.\",\"lang\":\"de\"}\n",
            ),
        )
        .unwrap();
        let mut cfg = config(&input, &temp.path().join("store"));
        cfg.format = "jsonl".into();

        let mut filtered = cfg.clone();
        filtered.languages = vec![Lang::En];
        let report = pipeline(filtered).execute(&CancellationToken::new()).unwrap();
        assert_eq!((report.committed, report.ignored), (1, 2));

        let mut open = cfg;
        open.mode = RunMode::Restart;
        let report = pipeline(open).execute(&CancellationToken::new()).unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(report.failures(DocumentStage::Tokenizing, ErrorKind::UnknownEngine), 2);
    }
}
