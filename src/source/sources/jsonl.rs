use std::path::PathBuf;

use serde_json::Value;

use crate::config::ColumnMap;
use crate::constants::provenance::READ_PREFIX;
use crate::constants::reader::{DEFAULT_ID_FIELD, FORMAT_JSONL};
use crate::constants::record::ID_COLUMN_JOINER;
use crate::data::{Lang, Metadata, Record};
use crate::errors::PipelineError;
use crate::source::sources::line_source_id;
use crate::source::{RecordStream, SourceReader, StreamItem};
use crate::transport::fs::LineStream;

/// One JSON object per line.
///
/// The text field comes from `ColumnMap::text`. Id fields come from
/// `ColumnMap::id`, falling back to an `id` field and then to the line id.
/// String and number id values are accepted. Other non-null fields become
/// document metadata (nested values as compact JSON) unless
/// `ColumnMap::keep_metadata` is off.
pub struct JsonLinesReader {
    path: PathBuf,
    lang: Lang,
    columns: ColumnMap,
}

impl JsonLinesReader {
    /// Reader for `path`; rows without a language field get `lang`.
    pub fn new(path: impl Into<PathBuf>, lang: Lang, columns: ColumnMap) -> Self {
        Self {
            path: path.into(),
            lang,
            columns,
        }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn metadata_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn parse_line(
    columns: &ColumnMap,
    default_lang: &Lang,
    origin: String,
    bytes: &[u8],
    step: &str,
) -> StreamItem {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|err| PipelineError::format(&origin, format!("invalid JSON: {err}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| PipelineError::format(&origin, "line is not a JSON object"))?;
    let text = object
        .get(&columns.text)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            PipelineError::format(&origin, format!("missing string field '{}'", columns.text))
        })?;

    let source_id = if columns.id.is_empty() {
        object
            .get(DEFAULT_ID_FIELD)
            .and_then(scalar_text)
            .filter(|id| !id.is_empty())
            .unwrap_or(origin)
    } else {
        let mut parts = Vec::with_capacity(columns.id.len());
        for name in &columns.id {
            let part = object
                .get(name)
                .and_then(scalar_text)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| PipelineError::format(&origin, format!("missing id field '{name}'")))?;
            parts.push(part);
        }
        parts.join(ID_COLUMN_JOINER)
    };

    let lang = match columns
        .lang
        .as_deref()
        .and_then(|field| object.get(field))
        .and_then(Value::as_str)
        .map(str::trim)
    {
        Some(tag) if !tag.is_empty() => tag.parse()?,
        _ => default_lang.clone(),
    };

    let mut metadata = Metadata::new();
    if columns.keep_metadata {
        let id_fields: Vec<&str> = if columns.id.is_empty() {
            vec![DEFAULT_ID_FIELD]
        } else {
            columns.id.iter().map(String::as_str).collect()
        };
        for (name, value) in object {
            if *name == columns.text
                || id_fields.contains(&name.as_str())
                || columns.lang.as_deref() == Some(name.as_str())
            {
                continue;
            }
            if let Some(value) = metadata_value(value) {
                metadata.insert(name.clone(), value);
            }
        }
    }
    Ok(Record::raw(source_id, lang, text.as_bytes(), step).with_metadata(metadata))
}

impl SourceReader for JsonLinesReader {
    fn format(&self) -> &str {
        FORMAT_JSONL
    }

    fn open_at(&self, offset: usize) -> Result<RecordStream, PipelineError> {
        let lines = LineStream::open(&self.path)?;
        let path = self.path.clone();
        let lang = self.lang.clone();
        let columns = self.columns.clone();
        let step = format!("{READ_PREFIX}{FORMAT_JSONL}");
        let records = lines.skip(offset).map(move |line| -> StreamItem {
            let (line_no, bytes) = line?;
            parse_line(&columns, &lang, line_source_id(&path, line_no), &bytes, &step)
        });
        Ok(RecordStream::new(records, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn objects_map_to_records_with_per_line_lang() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("mixed.jsonl");
        fs::write(
            &path,
            concat!(
                "{\"id\": 7, \"text\": \"Hello world.\", \"lang\": \"en\"}\n",
                "{\"text\": \"안녕.\", \"lang\": \"ko\"}\n",
                "{\"text\": \"no tag\"}\n",
            ),
        )
        .unwrap();

        let records: Vec<Record> = JsonLinesReader::new(&path, Lang::En, ColumnMap::default())
            .open()
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(records[0].source_id(), "7");
        assert_eq!(records[0].lang(), &Lang::En);
        assert_eq!(records[1].source_id(), "mixed:2");
        assert_eq!(records[1].lang(), &Lang::Ko);
        assert_eq!(records[2].lang(), &Lang::En);
        assert_eq!(records[2].provenance(), ["read:jsonl"]);
    }

    #[test]
    fn malformed_lines_do_not_stop_the_stream() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("broken.jsonl");
        fs::write(
            &path,
            "{\"text\": \"one\"}\nnot json\n{\"body\": \"no text\"}\n{\"text\": \"four\"}\n",
        )
        .unwrap();

        let items: Vec<StreamItem> = JsonLinesReader::new(&path, Lang::En, ColumnMap::default())
            .open()
            .unwrap()
            .collect();
        assert_eq!(items.len(), 4);
        assert!(items[0].is_ok());
        assert!(matches!(&items[1], Err(PipelineError::Format { origin, .. }) if origin == "broken:2"));
        assert!(matches!(&items[2], Err(PipelineError::Format { .. })));
        assert!(items[3].is_ok());
    }

    #[test]
    fn configured_id_fields_are_required() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("ids.jsonl");
        fs::write(&path, "{\"doc\": \"a\", \"sent\": 3, \"text\": \"x\"}\n{\"doc\": \"b\", \"text\": \"y\"}\n")
            .unwrap();
        let columns = ColumnMap {
            id: vec!["doc".into(), "sent".into()],
            ..ColumnMap::default()
        };
        let items: Vec<StreamItem> = JsonLinesReader::new(&path, Lang::En, columns)
            .open()
            .unwrap()
            .collect();
        assert_eq!(items[0].as_ref().unwrap().source_id(), "a_3");
        assert!(items[1].is_err());
    }

    #[test]
    fn extra_fields_become_metadata() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("news.jsonl");
        fs::write(
            &path,
            "{\"id\": 1, \"text\": \"x\", \"lang\": \"ko\", \"label\": 2, \"tags\": [\"a\"], \"title\": \"뉴스\", \"note\": null}\n",
        )
        .unwrap();
        let record = JsonLinesReader::new(&path, Lang::En, ColumnMap::default())
            .open()
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let keys: Vec<&str> = record.metadata().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["label", "tags", "title"]);
        assert_eq!(record.metadata()["label"], "2");
        assert_eq!(record.metadata()["tags"], "[\"a\"]");
        assert_eq!(record.metadata()["title"], "뉴스");
    }
}
