use std::path::{Path, PathBuf};

use crate::config::ColumnMap;
use crate::constants::provenance::READ_PREFIX;
use crate::constants::record::ID_COLUMN_JOINER;
use crate::data::{Lang, Metadata, Record};
use crate::errors::PipelineError;
use crate::source::sources::line_source_id;
use crate::source::{RecordStream, SourceReader, StreamItem};
use crate::transport::fs::LineStream;

/// Header-first delimited reader (`tsv`, `delimited`).
///
/// Fields are split on a single ASCII delimiter without quoting rules. The
/// text column is passed through as raw bytes; id, language, and metadata
/// columns must be valid UTF-8. Non-empty values of the remaining columns
/// become document metadata unless `ColumnMap::keep_metadata` is off.
pub struct DelimitedReader {
    path: PathBuf,
    lang: Lang,
    columns: ColumnMap,
    delimiter: u8,
    tag: String,
}

impl DelimitedReader {
    /// Build a reader; the delimiter must be a single ASCII character.
    pub fn new(
        path: impl Into<PathBuf>,
        lang: Lang,
        columns: ColumnMap,
        tag: impl Into<String>,
    ) -> Result<Self, PipelineError> {
        if !columns.delimiter.is_ascii() {
            return Err(PipelineError::Configuration(format!(
                "delimiter {:?} is not a single ASCII character",
                columns.delimiter
            )));
        }
        Ok(Self {
            path: path.into(),
            lang,
            delimiter: columns.delimiter as u8,
            columns,
            tag: tag.into(),
        })
    }
}

/// Resolved column positions for one file.
#[derive(Clone, Debug)]
struct ColumnLayout {
    width: usize,
    text: usize,
    id: Vec<usize>,
    lang: Option<usize>,
    metadata: Vec<(usize, String)>,
}

impl ColumnLayout {
    fn resolve(path: &Path, header: &[&str], columns: &ColumnMap) -> Result<Self, PipelineError> {
        let position = |name: &str| header.iter().position(|column| *column == name);
        let text = position(&columns.text).ok_or_else(|| {
            PipelineError::format(
                path.display(),
                format!("header has no text column '{}'", columns.text),
            )
        })?;
        let mut id = Vec::with_capacity(columns.id.len());
        for name in &columns.id {
            let idx = position(name).ok_or_else(|| {
                PipelineError::format(path.display(), format!("header has no id column '{name}'"))
            })?;
            id.push(idx);
        }
        let lang = columns.lang.as_deref().and_then(position);
        let metadata = if columns.keep_metadata {
            header
                .iter()
                .enumerate()
                .filter(|(idx, _)| *idx != text && !id.contains(idx) && Some(*idx) != lang)
                .map(|(idx, name)| (idx, name.to_string()))
                .collect()
        } else {
            Vec::new()
        };
        Ok(Self {
            width: header.len(),
            text,
            id,
            lang,
            metadata,
        })
    }

    fn record(
        &self,
        path: &Path,
        line_no: usize,
        bytes: &[u8],
        delimiter: u8,
        default_lang: &Lang,
        step: &str,
    ) -> StreamItem {
        let origin = line_source_id(path, line_no);
        let fields: Vec<&[u8]> = bytes.split(|byte| *byte == delimiter).collect();
        if fields.len() != self.width {
            return Err(PipelineError::format(
                origin,
                format!("expected {} fields, found {}", self.width, fields.len()),
            ));
        }
        let source_id = if self.id.is_empty() {
            origin
        } else {
            let mut parts = Vec::with_capacity(self.id.len());
            for idx in &self.id {
                let value = utf8_field(fields[*idx], &origin, "id")?;
                if value.is_empty() {
                    return Err(PipelineError::format(&origin, "empty id column"));
                }
                parts.push(value);
            }
            parts.join(ID_COLUMN_JOINER)
        };
        let lang = match self.lang {
            Some(idx) => {
                let value = utf8_field(fields[idx], &source_id, "lang")?;
                if value.is_empty() {
                    default_lang.clone()
                } else {
                    value.parse()?
                }
            }
            None => default_lang.clone(),
        };
        let mut metadata = Metadata::new();
        for (idx, name) in &self.metadata {
            let value = utf8_field(fields[*idx], &source_id, name)?;
            if !value.is_empty() {
                metadata.insert(name.clone(), value.to_string());
            }
        }
        Ok(Record::raw(source_id, lang, fields[self.text], step).with_metadata(metadata))
    }
}

fn utf8_field<'a>(bytes: &'a [u8], origin: &str, column: &str) -> Result<&'a str, PipelineError> {
    std::str::from_utf8(bytes)
        .map(str::trim)
        .map_err(|_| PipelineError::format(origin, format!("{column} column is not valid UTF-8")))
}

impl SourceReader for DelimitedReader {
    fn format(&self) -> &str {
        &self.tag
    }

    fn open_at(&self, offset: usize) -> Result<RecordStream, PipelineError> {
        let mut lines = LineStream::open(&self.path)?;
        let header = match lines.next() {
            None => return Ok(RecordStream::new(std::iter::empty(), offset)),
            Some(line) => line?.1,
        };
        let header = std::str::from_utf8(&header)
            .map_err(|_| PipelineError::format(self.path.display(), "header is not valid UTF-8"))?;
        let header = header.trim_start_matches('\u{feff}');
        let names: Vec<&str> = header
            .split(self.delimiter as char)
            .map(str::trim)
            .collect();
        let layout = ColumnLayout::resolve(&self.path, &names, &self.columns)?;

        let path = self.path.clone();
        let lang = self.lang.clone();
        let delimiter = self.delimiter;
        let step = format!("{READ_PREFIX}{}", self.tag);
        let records = lines.skip(offset).map(move |line| -> StreamItem {
            let (line_no, bytes) = line?;
            layout.record(&path, line_no, &bytes, delimiter, &lang, &step)
        });
        Ok(RecordStream::new(records, offset))
    }
}
