use std::collections::BTreeMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::constants::pipeline::{
    DEFAULT_BATCH_SIZE, DEFAULT_STAGE_TIMEOUT_MS, PIPELINE_OUTPUT_VERSION,
};
use crate::constants::reader::{DEFAULT_LANG_FIELD, DEFAULT_TEXT_FIELD};
use crate::constants::record::SPLIT_ID_SEPARATOR;
use crate::constants::store::{DEFAULT_SHARD_COUNT, DEFAULT_STORE_DIR};
use crate::data::Lang;
use crate::errors::PipelineError;
use crate::hash::checksum_with;
use crate::tokenize::TokenizerDescriptor;
use crate::types::{Checksum, EngineName, FormatTag, SplitName};

/// Unicode normalization form applied by the normalizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnicodeForm {
    /// Canonical composition.
    Nfc,
    /// Compatibility composition (full-width forms become ASCII).
    Nfkc,
    /// Leave code points as decoded.
    None,
}

impl UnicodeForm {
    /// Name used in provenance (`nfc`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nfc => "nfc",
            Self::Nfkc => "nfkc",
            Self::None => "none",
        }
    }
}

/// Normalizer behavior.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerOptions {
    /// Form used for Korean text. NFC keeps precomposed Hangul syllables.
    pub korean_form: UnicodeForm,
    /// Form used for every other language.
    pub default_form: UnicodeForm,
    /// Drop control characters other than newline and tab.
    pub strip_control: bool,
    /// Collapse runs of inline whitespace and trim each line.
    pub collapse_whitespace: bool,
}

impl Default for NormalizerOptions {
    fn default() -> Self {
        Self {
            korean_form: UnicodeForm::Nfc,
            default_form: UnicodeForm::Nfkc,
            strip_control: true,
            collapse_whitespace: true,
        }
    }
}

/// Granularity of segmentation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentMode {
    /// Language-aware sentence boundaries.
    #[default]
    Sentence,
    /// Blank-line separated paragraphs.
    Paragraph,
}

/// Column mapping for delimited and JSON-lines sources.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMap {
    /// Column (or JSON field) holding document text.
    pub text: String,
    /// Columns joined to form the source id; empty means line-number ids.
    pub id: Vec<String>,
    /// Optional per-row language column.
    pub lang: Option<String>,
    /// Field delimiter for the `delimited` format (`tsv` always uses tab).
    pub delimiter: char,
    /// Keep every column other than text, id, and lang as document metadata.
    pub keep_metadata: bool,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            text: DEFAULT_TEXT_FIELD.to_string(),
            id: Vec::new(),
            lang: Some(DEFAULT_LANG_FIELD.to_string()),
            delimiter: '\t',
            keep_metadata: true,
        }
    }
}

/// Whether a run continues from the manifest or starts over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Skip documents already committed under the same configuration.
    #[default]
    Resume,
    /// Clear shards and manifest before processing.
    Restart,
}

/// Immutable run configuration, consumed once at run start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Input file or directory; read as one unsplit source when `splits` is empty.
    pub input: PathBuf,
    /// Named input splits (`train`, `dev`, `test`) read in order, each with
    /// the same format and column mapping. Replaces `input` when non-empty.
    pub splits: IndexMap<SplitName, PathBuf>,
    /// Reader format tag (`lines`, `files`, `tsv`, `delimited`, `jsonl`).
    pub format: FormatTag,
    /// Language assigned to documents that carry no per-row tag.
    pub default_lang: Lang,
    /// Column mapping for tabular inputs.
    pub columns: ColumnMap,
    /// Languages to process; documents in other languages are ignored. Empty means all.
    pub languages: Vec<Lang>,
    /// Tokenizer engine selected per language.
    pub engines: BTreeMap<Lang, EngineName>,
    /// Decoding and normalization settings.
    pub normalizer: NormalizerOptions,
    /// Sentence or paragraph segmentation.
    pub segmentation: SegmentMode,
    /// Documents per batch.
    pub batch_size: usize,
    /// Worker threads; `0` uses the rayon default.
    pub workers: usize,
    /// Per-document, per-stage time budget in milliseconds.
    pub stage_timeout_ms: u64,
    /// Resume from the manifest or clear the store first.
    pub mode: RunMode,
    /// Reader offset to start from (documents before it are not read). With
    /// splits, offsets count across all splits in order.
    pub start_offset: usize,
    /// Corpus store directory.
    pub store_dir: PathBuf,
    /// Number of shard files in a freshly created store.
    pub shard_count: u16,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            splits: IndexMap::new(),
            format: crate::constants::reader::FORMAT_LINES.to_string(),
            default_lang: Lang::undetermined(),
            columns: ColumnMap::default(),
            languages: Vec::new(),
            engines: BTreeMap::new(),
            normalizer: NormalizerOptions::default(),
            segmentation: SegmentMode::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            workers: 0,
            stage_timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
            mode: RunMode::default(),
            start_offset: 0,
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            shard_count: DEFAULT_SHARD_COUNT,
        }
    }
}

impl PipelineConfig {
    /// Reject configurations that would fail every document identically.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.batch_size == 0 {
            return Err(PipelineError::Configuration(
                "batch_size must be greater than zero".into(),
            ));
        }
        if self.shard_count == 0 {
            return Err(PipelineError::Configuration(
                "shard_count must be greater than zero".into(),
            ));
        }
        if self.stage_timeout_ms == 0 {
            return Err(PipelineError::Configuration(
                "stage_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.engines.is_empty() {
            return Err(PipelineError::Configuration(
                "at least one tokenizer engine must be selected".into(),
            ));
        }
        if let Some(lang) = self
            .languages
            .iter()
            .find(|lang| !self.engines.contains_key(*lang))
        {
            return Err(PipelineError::Configuration(format!(
                "language '{lang}' is selected for processing but has no tokenizer engine"
            )));
        }
        if self.columns.text.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "text column name must not be empty".into(),
            ));
        }
        if let Some(name) = self.splits.keys().find(|name| {
            name.trim().is_empty() || name.contains(SPLIT_ID_SEPARATOR)
        }) {
            return Err(PipelineError::Configuration(format!(
                "invalid split name '{name}': must be non-empty without '{SPLIT_ID_SEPARATOR}'"
            )));
        }
        if self.format.trim().is_empty() {
            return Err(PipelineError::format(
                self.input.display(),
                "no source format selected",
            ));
        }
        Ok(())
    }

    /// True when documents tagged `lang` should be processed.
    pub fn accepts(&self, lang: &Lang) -> bool {
        self.languages.is_empty() || self.languages.contains(lang)
    }

    /// Checksum over every setting that affects committed output.
    ///
    /// Input locations, batching, and worker counts are excluded: they change
    /// scheduling, never the bytes written for a document.
    pub fn output_checksum<'a, I>(&self, descriptors: I) -> Result<Checksum, PipelineError>
    where
        I: IntoIterator<Item = &'a TokenizerDescriptor>,
    {
        let normalizer = serde_json::to_string(&self.normalizer)?;
        let segmentation = serde_json::to_string(&self.segmentation)?;
        let mut descriptors: Vec<&TokenizerDescriptor> = descriptors.into_iter().collect();
        descriptors.sort_by(|a, b| {
            (&a.lang, &a.engine_name).cmp(&(&b.lang, &b.engine_name))
        });
        let mut engine_parts = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            engine_parts.push(serde_json::to_string(descriptor)?);
        }
        Ok(checksum_with(|builder| {
            builder.part(PIPELINE_OUTPUT_VERSION.to_le_bytes());
            builder.part(&normalizer);
            builder.part(&segmentation);
            for (lang, engine) in &self.engines {
                builder.part(lang.as_str()).part(engine);
            }
            for part in &engine_parts {
                builder.part(part);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> PipelineConfig {
        let mut engines = BTreeMap::new();
        engines.insert(Lang::En, "whitespace".to_string());
        PipelineConfig {
            engines,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn validate_rejects_zero_batch_and_missing_format() {
        let mut config = base_config();
        assert!(config.validate().is_ok());

        config.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Configuration(_))
        ));

        let mut config = base_config();
        config.format = " ".into();
        assert!(matches!(
            config.validate(),
            Err(PipelineError::Format { .. })
        ));
    }

    #[test]
    fn validate_requires_engine_for_each_selected_language() {
        let mut config = base_config();
        config.languages = vec![Lang::En, Lang::Ko];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("'ko'"));
    }

    #[test]
    fn output_checksum_ignores_scheduling_settings() {
        let config = base_config();
        let descriptor = TokenizerDescriptor::new(Lang::En, "whitespace");
        let base = config.output_checksum([&descriptor]).unwrap();

        let mut rescheduled = config.clone();
        rescheduled.batch_size = 3;
        rescheduled.workers = 7;
        rescheduled.input = PathBuf::from("/elsewhere");
        assert_eq!(rescheduled.output_checksum([&descriptor]).unwrap(), base);

        let mut renormalized = config.clone();
        renormalized.normalizer.default_form = UnicodeForm::Nfc;
        assert_ne!(renormalized.output_checksum([&descriptor]).unwrap(), base);

        let tuned = TokenizerDescriptor::new(Lang::En, "whitespace").with_option("lowercase", "true");
        assert_ne!(config.output_checksum([&tuned]).unwrap(), base);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let json = r#"{"input":"corpus.txt","engines":{"en":"whitespace","ko":"character"}}"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.engines.get(&Lang::Ko).map(String::as_str), Some("character"));
        assert_eq!(config.mode, RunMode::Resume);
        assert!(config.accepts(&Lang::Other("ja".into())));
        assert!(config.splits.is_empty());
    }

    #[test]
    fn splits_keep_order_and_reject_bad_names() {
        let json = r#"{"engines":{"en":"whitespace"},"splits":{"train":"a.tsv","dev":"b.tsv","test":"c.tsv"}}"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        let names: Vec<&str> = config.splits.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["train", "dev", "test"]);
        assert!(config.validate().is_ok());

        let mut nested = config.clone();
        nested.splits.insert("train/extra".into(), PathBuf::from("d.tsv"));
        assert!(matches!(nested.validate(), Err(PipelineError::Configuration(_))));

        let mut blank = config;
        blank.splits.insert(" ".into(), PathBuf::from("e.tsv"));
        assert!(blank.validate().is_err());
    }
}
