use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{EngineName, SourceId};

/// Error type for reader, transformation, tokenizer, and persistence failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Unreadable input, unknown format tag, or a malformed row.
    #[error("format error in '{origin}': {reason}")]
    Format {
        /// Input path or the source id the row would have had.
        origin: String,
        /// What was wrong.
        reason: String,
    },
    /// Document bytes are not text in a supported encoding.
    #[error("document '{source_id}' cannot be decoded as text: {reason}")]
    Encoding {
        /// Failed document.
        source_id: SourceId,
        /// Decoder message.
        reason: String,
    },
    /// No tokenizer for a `(lang, engine)` pair.
    #[error("no tokenizer registered for lang '{lang}' engine '{engine}'")]
    UnknownEngine {
        /// Language tag.
        lang: String,
        /// Requested engine.
        engine: EngineName,
    },
    /// A stage ran past its wall-clock budget.
    #[error("document '{source_id}' exceeded {budget_ms}ms at stage {stage} ({elapsed_ms}ms)")]
    StageTimeout {
        /// Failed document.
        source_id: SourceId,
        /// Record stage the step was producing.
        stage: crate::data::Stage,
        /// Configured budget.
        budget_ms: u128,
        /// Time spent when the driver gave up.
        elapsed_ms: u128,
    },
    /// Shard payload or manifest entry could not be written.
    #[error("commit of '{source_id}' failed: {reason}")]
    Commit {
        /// Failed document.
        source_id: SourceId,
        /// Underlying store error.
        reason: String,
    },
    /// A tokenizer capability failed, panicked, or returned nothing.
    #[error("tokenizer '{engine}' failed: {reason}")]
    Tokenizer {
        /// Engine that failed.
        engine: EngineName,
        /// What went wrong.
        reason: String,
    },
    /// Corpus store failure outside a single commit.
    #[error("corpus store failure: {0}")]
    Store(String),
    /// Invalid run configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Filesystem error.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// JSON encoding or decoding error.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl PipelineError {
    /// Classification used in run reports and the quarantine log.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Format { .. } => ErrorKind::Format,
            Self::Encoding { .. } => ErrorKind::Encoding,
            Self::UnknownEngine { .. } => ErrorKind::UnknownEngine,
            Self::StageTimeout { .. } => ErrorKind::StageTimeout,
            Self::Commit { .. } => ErrorKind::Commit,
            Self::Tokenizer { .. } => ErrorKind::Tokenizer,
            Self::Store(_) => ErrorKind::Store,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Io(_) => ErrorKind::Io,
            Self::Serde(_) => ErrorKind::Store,
        }
    }

    pub(crate) fn format(origin: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Format {
            origin: origin.to_string(),
            reason: reason.into(),
        }
    }
}

/// Copyable error classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`PipelineError::Format`].
    Format,
    /// See [`PipelineError::Encoding`].
    Encoding,
    /// See [`PipelineError::UnknownEngine`].
    UnknownEngine,
    /// See [`PipelineError::StageTimeout`].
    StageTimeout,
    /// See [`PipelineError::Commit`].
    Commit,
    /// See [`PipelineError::Tokenizer`].
    Tokenizer,
    /// Store and JSON failures.
    Store,
    /// See [`PipelineError::Configuration`].
    Configuration,
    /// See [`PipelineError::Io`].
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Format => "format",
            Self::Encoding => "encoding",
            Self::UnknownEngine => "unknown_engine",
            Self::StageTimeout => "stage_timeout",
            Self::Commit => "commit",
            Self::Tokenizer => "tokenizer",
            Self::Store => "store",
            Self::Configuration => "configuration",
            Self::Io => "io",
        };
        f.write_str(name)
    }
}
