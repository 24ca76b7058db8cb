use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::record::{RECORD_ID_SEPARATOR, SPLIT_ID_SEPARATOR};
use crate::errors::{ErrorKind, PipelineError};

pub use crate::types::{Checksum, Metadata, RecordId, SourceId, SplitName, Token, TransformName};

/// Language tag attached to every record.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, bitcode::Encode, bitcode::Decode,
)]
pub enum Lang {
    /// Korean (`ko`).
    Ko,
    /// English (`en`).
    En,
    /// Any other tag, stored lowercased (`ja`, `und`).
    Other(String),
}

impl Lang {
    /// Tag used for documents that carry no language information.
    pub fn undetermined() -> Self {
        Self::Other("und".to_string())
    }

    /// Canonical tag string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ko => "ko",
            Self::En => "en",
            Self::Other(tag) => tag.as_str(),
        }
    }
}

impl Default for Lang {
    fn default() -> Self {
        Self::undetermined()
    }
}

impl fmt::Display for Lang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lang {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let tag = value.trim().to_ascii_lowercase();
        match tag.as_str() {
            "" => Err(PipelineError::Configuration("empty language tag".into())),
            "ko" | "kor" | "ko-kr" => Ok(Self::Ko),
            "en" | "eng" | "en-us" | "en-gb" => Ok(Self::En),
            _ => Ok(Self::Other(tag)),
        }
    }
}

impl Serialize for Lang {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Lang {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Pipeline stage a record (or a document) has reached.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Undecoded bytes from a reader.
    Raw,
    /// Decoded and normalized document text.
    Normalized,
    /// One sentence or paragraph.
    Segmented,
    /// Token sequence of one segment.
    Tokenized,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Raw => "raw",
            Self::Normalized => "normalized",
            Self::Segmented => "segmented",
            Self::Tokenized => "tokenized",
        };
        f.write_str(name)
    }
}

/// Stage-dependent record payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Content {
    /// Undecoded source bytes.
    Raw(Vec<u8>),
    /// Whole normalized document text.
    Text(String),
    /// One segment of a normalized document.
    Segment(String),
    /// Ordered tokens of one segment.
    Tokens(Vec<Token>),
}

impl Content {
    fn stage(&self) -> Stage {
        match self {
            Self::Raw(_) => Stage::Raw,
            Self::Text(_) => Stage::Normalized,
            Self::Segment(_) => Stage::Segmented,
            Self::Tokens(_) => Stage::Tokenized,
        }
    }
}

/// One unit of corpus content at a given stage.
///
/// Records are immutable: every stage builds new records through
/// [`Record::derive`], carrying the provenance chain forward. The id is fixed
/// by `(source_id, position)` and never depends on content. Split and
/// metadata are document-level and carried unchanged by every derived record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    id: RecordId,
    source_id: SourceId,
    position: usize,
    lang: Lang,
    split: Option<SplitName>,
    metadata: Metadata,
    content: Content,
    provenance: Vec<TransformName>,
}

impl Record {
    /// Build a raw record as produced by a source reader.
    pub fn raw(
        source_id: impl Into<SourceId>,
        lang: Lang,
        bytes: impl Into<Vec<u8>>,
        step: impl Into<TransformName>,
    ) -> Self {
        let source_id = source_id.into();
        Self {
            id: record_id(&source_id, 0),
            source_id,
            position: 0,
            lang,
            split: None,
            metadata: Metadata::new(),
            content: Content::Raw(bytes.into()),
            provenance: vec![step.into()],
        }
    }

    /// Attach the non-text columns a reader kept for this document.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Tag a raw record with the input split it was read from.
    ///
    /// The split name becomes part of the source id (`train/corpus:3`), so
    /// equal reader ids in different splits stay distinct documents.
    pub fn into_split(mut self, split: &str) -> Self {
        self.source_id = split_source_id(split, &self.source_id);
        self.id = record_id(&self.source_id, self.position);
        self.split = Some(split.to_string());
        self
    }

    /// Build the next-stage record at `position`, appending `steps` to provenance.
    pub fn derive<I, S>(&self, position: usize, content: Content, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TransformName>,
    {
        let mut provenance = self.provenance.clone();
        provenance.extend(steps.into_iter().map(Into::into));
        Self {
            id: record_id(&self.source_id, position),
            source_id: self.source_id.clone(),
            position,
            lang: self.lang.clone(),
            split: self.split.clone(),
            metadata: self.metadata.clone(),
            content,
            provenance,
        }
    }

    /// Stable record id (`doc:3#0`).
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    /// Id of the document this record came from.
    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    /// Stage-specific index (segment index for segmented/tokenized records).
    pub fn position(&self) -> usize {
        self.position
    }

    /// Language tag.
    pub fn lang(&self) -> &Lang {
        &self.lang
    }

    /// Input split, when the run reads named splits.
    pub fn split(&self) -> Option<&str> {
        self.split.as_deref()
    }

    /// Non-text columns kept by the reader.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Stage implied by the content variant.
    pub fn stage(&self) -> Stage {
        self.content.stage()
    }

    /// Stage payload.
    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Ordered transformation names applied so far.
    pub fn provenance(&self) -> &[TransformName] {
        &self.provenance
    }

    /// Text for normalized and segmented records.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            Content::Text(text) | Content::Segment(text) => Some(text),
            _ => None,
        }
    }

    /// Tokens for tokenized records.
    pub fn tokens(&self) -> Option<&[Token]> {
        match &self.content {
            Content::Tokens(tokens) => Some(tokens),
            _ => None,
        }
    }

    /// Persistable view of a tokenized record.
    pub fn to_tokenized(&self) -> Option<TokenizedRecord> {
        let tokens = self.tokens()?;
        Some(TokenizedRecord {
            id: self.id.clone(),
            source_id: self.source_id.clone(),
            segment_index: self.position,
            lang: self.lang.clone(),
            split: self.split.clone(),
            tokens: tokens.to_vec(),
            provenance: self.provenance.clone(),
        })
    }
}

/// Record id for `source_id` at `position` (`doc:3#0`).
pub fn record_id(source_id: &str, position: usize) -> RecordId {
    format!("{source_id}{RECORD_ID_SEPARATOR}{position}")
}

/// Source id of `source_id` read from `split` (`train/corpus:3`).
pub fn split_source_id(split: &str, source_id: &str) -> SourceId {
    format!("{split}{SPLIT_ID_SEPARATOR}{source_id}")
}

/// Persisted form of one tokenized segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bitcode::Encode, bitcode::Decode)]
pub struct TokenizedRecord {
    /// Record id (`doc:3#0`).
    pub id: RecordId,
    /// Document the segment belongs to.
    pub source_id: SourceId,
    /// Position of the segment within its document.
    pub segment_index: usize,
    /// Language tag.
    pub lang: Lang,
    /// Input split, when the run reads named splits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<SplitName>,
    /// Ordered tokens.
    pub tokens: Vec<Token>,
    /// Transformations applied, reader first.
    pub provenance: Vec<TransformName>,
}

/// Completion marker for one source document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Committed document.
    pub source_id: SourceId,
    /// Input split the document was read from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<SplitName>,
    /// Last stage whose output is durable.
    pub stage_completed: Stage,
    /// Checksum of the configuration that produced the output.
    pub config_checksum: Checksum,
    /// Checksum over the committed tokenized records.
    pub checksum_of_output: Checksum,
    /// Number of committed segments.
    pub segments: usize,
    /// Commit time.
    pub timestamp: DateTime<Utc>,
}

impl ManifestEntry {
    /// True when this entry proves the output for `config_checksum` is complete.
    pub fn satisfies(&self, config_checksum: &str) -> bool {
        self.stage_completed == Stage::Tokenized && self.config_checksum == config_checksum
    }
}

/// Quarantine log entry for a document that failed a stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    /// Failed document (or the id the unparsable row would have had).
    pub source_id: SourceId,
    /// Stage the document was in when it failed (`reading`, `tokenizing`, ...).
    pub stage: String,
    /// Error classification.
    pub kind: ErrorKind,
    /// Rendered error message.
    pub reason: String,
    /// Failure time.
    pub timestamp: DateTime<Utc>,
}
