#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Run configuration types.
pub mod config;
/// Centralized constants used across readers, stages, and the store.
pub mod constants;
/// Record model, manifest, and quarantine entry types.
pub mod data;
mod hash;
/// Run statistics and language balance helpers.
pub mod metrics;
/// Text decoding and normalization.
pub mod normalize;
/// Batch driver and document lifecycle tracking.
pub mod pipeline;
/// Sentence and paragraph segmentation.
pub mod segment;
/// Source reader traits and built-in formats.
pub mod source;
/// Sharded on-disk corpus store.
pub mod store;
/// Tokenizer trait, registry, and reference engines.
pub mod tokenize;
/// Input transports used by sources (filesystem today).
pub mod transport;
/// Shared type aliases.
pub mod types;

mod errors;

pub use config::{
    ColumnMap, NormalizerOptions, PipelineConfig, RunMode, SegmentMode, UnicodeForm,
};
pub use data::{Content, Lang, ManifestEntry, QuarantineEntry, Record, Stage, TokenizedRecord};
pub use errors::{ErrorKind, PipelineError};
pub use metrics::{CorpusStats, LangStats};
pub use normalize::Normalizer;
pub use pipeline::{
    CancellationToken, DocumentStage, DocumentState, DocumentTracker, Pipeline, RunReport,
};
pub use segment::Segmenter;
pub use source::{ReaderRegistry, ReaderSpec, RecordStream, SourceReader};
pub use store::{CorpusStore, DocumentInfo};
pub use tokenize::{
    CharacterTokenizer, EojeolTokenizer, FnTokenizer, RegexTokenizer, Tokenizer,
    TokenizerDescriptor, TokenizerRegistry, WhitespaceTokenizer,
};
#[cfg(feature = "huggingface")]
pub use tokenize::PretrainedTokenizer;
pub use types::{
    Checksum, EngineName, FormatTag, Metadata, RecordId, SourceId, SplitName, Token, TransformName,
};
