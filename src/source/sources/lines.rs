use std::path::PathBuf;

use crate::constants::provenance::READ_PREFIX;
use crate::constants::reader::FORMAT_LINES;
use crate::data::{Lang, Record};
use crate::errors::PipelineError;
use crate::source::sources::line_source_id;
use crate::source::{RecordStream, SourceReader, StreamItem};
use crate::transport::fs::LineStream;

/// Treats every non-blank line of a text file as one document.
///
/// Source ids are `"{file_stem}:{line_no}"` with 1-based physical line numbers,
/// so ids survive edits that only append lines.
pub struct LineReader {
    path: PathBuf,
    lang: Lang,
}

impl LineReader {
    /// Reader over the lines of `path`.
    pub fn new(path: impl Into<PathBuf>, lang: Lang) -> Self {
        Self {
            path: path.into(),
            lang,
        }
    }
}

impl SourceReader for LineReader {
    fn format(&self) -> &str {
        FORMAT_LINES
    }

    fn open_at(&self, offset: usize) -> Result<RecordStream, PipelineError> {
        let lines = LineStream::open(&self.path)?;
        let path = self.path.clone();
        let lang = self.lang.clone();
        let step = format!("{READ_PREFIX}{FORMAT_LINES}");
        let records = lines.skip(offset).map(move |line| -> StreamItem {
            let (line_no, bytes) = line?;
            Ok(Record::raw(
                line_source_id(&path, line_no),
                lang.clone(),
                bytes,
                step.clone(),
            ))
        });
        Ok(RecordStream::new(records, offset))
    }
}
