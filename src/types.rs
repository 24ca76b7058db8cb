/// Unique record identifier (stable across runs).
/// Example: `news_ko:17#3`
pub type RecordId = String;
/// Identifier for the raw document that produced a record.
/// Examples: `news_ko:17`, `wiki/en/alpha.txt`
pub type SourceId = String;
/// Registered tokenizer engine name.
/// Examples: `whitespace`, `character`, `eojeol`
pub type EngineName = String;
/// Single token emitted by a tokenizer.
/// Examples: `Hello`, `안`, `world.`
pub type Token = String;
/// Name of a transformation recorded in record provenance.
/// Examples: `read:lines`, `normalize:nfc`, `segment:ko`, `tokenize:ko/character`
pub type TransformName = String;
/// Hex-encoded SHA-256 digest.
/// Example: `9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08`
pub type Checksum = String;
/// Format tag selecting a source reader.
/// Examples: `lines`, `files`, `tsv`, `jsonl`
pub type FormatTag = String;
/// Name of an input split.
/// Examples: `train`, `dev`, `test`
pub type SplitName = String;
/// Non-text columns carried with a document, keyed by column name.
/// Example: `{"label": "1", "source": "news"}`
pub type Metadata = std::collections::BTreeMap<String, String>;
