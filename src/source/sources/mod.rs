use std::path::Path;

use crate::constants::record::LINE_ID_SEPARATOR;
use crate::transport::fs::file_stem;
use crate::types::SourceId;

/// Delimited (`tsv` / `delimited`) reader with column mapping.
pub mod delimited;
/// One-document-per-file directory reader.
pub mod files;
/// JSON-lines reader.
pub mod jsonl;
/// One-document-per-line reader.
pub mod lines;

/// Source id for a document found on `line_no` of `path` (`corpus:12`).
pub(crate) fn line_source_id(path: &Path, line_no: usize) -> SourceId {
    format!("{}{}{}", file_stem(path), LINE_ID_SEPARATOR, line_no)
}
