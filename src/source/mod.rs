//! Source reader interfaces and the format-tag registry.
//!
//! Ownership model:
//! - `SourceReader` turns one input path into a lazy, finite `RecordStream`
//!   of raw records. Readers only read; they never write.
//! - `ReaderRegistry` maps a format tag to a reader factory, so the driver
//!   stays format-agnostic beyond choosing a tag.
//! - `RecordStream` tracks its document position so a run can be restarted
//!   from a saved offset. Named splits are read back to back as one stream
//!   whose position counts across splits.

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::config::{ColumnMap, PipelineConfig};
use crate::constants::reader::{
    FORMAT_DELIMITED, FORMAT_FILES, FORMAT_JSONL, FORMAT_LINES, FORMAT_TSV,
};
use crate::data::{Lang, Record, split_source_id};
use crate::errors::PipelineError;
use crate::types::{FormatTag, SplitName};

/// Source implementation modules.
pub mod sources;

pub use sources::delimited::DelimitedReader;
pub use sources::files::FileTreeReader;
pub use sources::jsonl::JsonLinesReader;
pub use sources::lines::LineReader;

/// Everything a reader needs to know about its input.
#[derive(Clone, Debug)]
pub struct ReaderSpec {
    /// Input file or directory.
    pub path: PathBuf,
    /// Language for documents without a per-row tag.
    pub default_lang: Lang,
    /// Column mapping for tabular formats.
    pub columns: ColumnMap,
}

impl ReaderSpec {
    /// Reader inputs taken from a run configuration.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            path: config.input.clone(),
            default_lang: config.default_lang.clone(),
            columns: config.columns.clone(),
        }
    }

    /// Same settings, reading `path` instead.
    pub fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }
}

/// Item yielded by a record stream.
///
/// Per-document parse failures surface as `Err(PipelineError::Format)` whose
/// `origin` is the source id the document would have had; the stream keeps
/// going after them.
pub type StreamItem = Result<Record, PipelineError>;

/// Reader capability for one input format.
pub trait SourceReader: Send + Sync {
    /// Format tag this reader serves.
    fn format(&self) -> &str;

    /// Open a stream that skips the first `offset` documents.
    fn open_at(&self, offset: usize) -> Result<RecordStream, PipelineError>;

    /// Open a stream from the first document.
    fn open(&self) -> Result<RecordStream, PipelineError> {
        self.open_at(0)
    }

    /// True when `open_at` can start at an offset without replaying earlier
    /// documents through the caller.
    fn supports_offset(&self) -> bool {
        true
    }
}

/// Lazy, finite, ordered sequence of raw records with a restart position.
pub struct RecordStream {
    inner: Box<dyn Iterator<Item = StreamItem> + Send>,
    position: usize,
}

impl RecordStream {
    /// Wrap an iterator whose first item sits at document `position`.
    pub fn new(inner: impl Iterator<Item = StreamItem> + Send + 'static, position: usize) -> Self {
        Self {
            inner: Box::new(inner),
            position,
        }
    }

    /// Offset of the next document; pass it to `open_at` to resume.
    pub fn position(&self) -> usize {
        self.position
    }
}

impl Iterator for RecordStream {
    type Item = StreamItem;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next()?;
        self.position += 1;
        Some(item)
    }
}

/// Builds a reader for a spec.
pub type ReaderFactory =
    Arc<dyn Fn(&ReaderSpec) -> Result<Box<dyn SourceReader>, PipelineError> + Send + Sync>;

/// Format-tag → reader factory registry.
#[derive(Clone)]
pub struct ReaderRegistry {
    factories: IndexMap<FormatTag, ReaderFactory>,
}

impl Default for ReaderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ReaderRegistry {
    /// Registry without any formats.
    pub fn empty() -> Self {
        Self {
            factories: IndexMap::new(),
        }
    }

    /// Registry with the built-in `lines`, `files`, `tsv`, `delimited`, and `jsonl` readers.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(FORMAT_LINES, |spec| {
            Ok(Box::new(LineReader::new(&spec.path, spec.default_lang.clone())))
        });
        registry.register(FORMAT_FILES, |spec| {
            Ok(Box::new(FileTreeReader::new(
                &spec.path,
                spec.default_lang.clone(),
            )))
        });
        registry.register(FORMAT_TSV, |spec| {
            let mut columns = spec.columns.clone();
            columns.delimiter = '\t';
            Ok(Box::new(DelimitedReader::new(
                &spec.path,
                spec.default_lang.clone(),
                columns,
                FORMAT_TSV,
            )?))
        });
        registry.register(FORMAT_DELIMITED, |spec| {
            Ok(Box::new(DelimitedReader::new(
                &spec.path,
                spec.default_lang.clone(),
                spec.columns.clone(),
                FORMAT_DELIMITED,
            )?))
        });
        registry.register(FORMAT_JSONL, |spec| {
            Ok(Box::new(JsonLinesReader::new(
                &spec.path,
                spec.default_lang.clone(),
                spec.columns.clone(),
            )))
        });
        registry
    }

    /// Register (or replace) the factory for `tag`.
    pub fn register<F>(&mut self, tag: impl Into<FormatTag>, factory: F)
    where
        F: Fn(&ReaderSpec) -> Result<Box<dyn SourceReader>, PipelineError> + Send + Sync + 'static,
    {
        self.factories.insert(tag.into(), Arc::new(factory));
    }

    /// True when `tag` has a registered reader.
    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Registered format tags in registration order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the reader for `tag`, failing with `Format` for unknown tags.
    pub fn reader(&self, tag: &str, spec: &ReaderSpec) -> Result<Box<dyn SourceReader>, PipelineError> {
        let factory = self.factories.get(tag).ok_or_else(|| {
            PipelineError::format(
                spec.path.display(),
                format!("unrecognized source format '{tag}'"),
            )
        })?;
        factory(spec)
    }

    /// Open `spec.path` as `tag` starting at document `offset`.
    pub fn open(
        &self,
        tag: &str,
        spec: &ReaderSpec,
        offset: usize,
    ) -> Result<RecordStream, PipelineError> {
        self.reader(tag, spec)?.open_at(offset)
    }

    /// Open named splits as `tag`, one after another, starting at `offset`
    /// documents into the combined sequence.
    ///
    /// Every split is opened up front, so a missing or unreadable split fails
    /// before any document is read. Records and per-row errors carry the
    /// split-prefixed source id (`train/corpus:3`).
    pub fn open_splits(
        &self,
        tag: &str,
        splits: &[(SplitName, ReaderSpec)],
        offset: usize,
    ) -> Result<RecordStream, PipelineError> {
        let mut streams = Vec::with_capacity(splits.len());
        for (name, spec) in splits {
            let stream = self.reader(tag, spec)?.open()?;
            let name = name.clone();
            streams.push(stream.map(move |item| tag_split(&name, item)));
        }
        Ok(RecordStream::new(
            streams.into_iter().flatten().skip(offset),
            offset,
        ))
    }
}

fn tag_split(split: &str, item: StreamItem) -> StreamItem {
    match item {
        Ok(record) => Ok(record.into_split(split)),
        Err(PipelineError::Format { origin, reason }) => Err(PipelineError::Format {
            origin: split_source_id(split, &origin),
            reason,
        }),
        Err(err) => Err(err),
    }
}

/// Open `path` with a built-in reader for `format`.
pub fn open(
    path: impl Into<PathBuf>,
    format: &str,
    default_lang: Lang,
) -> Result<RecordStream, PipelineError> {
    let spec = ReaderSpec {
        path: path.into(),
        default_lang,
        columns: ColumnMap::default(),
    };
    ReaderRegistry::builtin().open(format, &spec, 0)
}
