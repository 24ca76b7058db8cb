/// Constants used by record identity and provenance.
pub mod record {
    /// Separator between source id and position in record ids (`doc:3#0`).
    pub const RECORD_ID_SEPARATOR: char = '#';
    /// Separator between file stem and line number in line-derived source ids.
    pub const LINE_ID_SEPARATOR: char = ':';
    /// Separator used when joining multiple id columns into one source id.
    pub const ID_COLUMN_JOINER: &str = "_";
    /// Separator between split name and reader id in split-tagged source ids (`train/corpus:3`).
    pub const SPLIT_ID_SEPARATOR: char = '/';
}

/// Constants used by source readers.
pub mod reader {
    /// Format tag for one-document-per-line text files.
    pub const FORMAT_LINES: &str = "lines";
    /// Format tag for one-document-per-file directories.
    pub const FORMAT_FILES: &str = "files";
    /// Format tag for tab-separated files with a header row.
    pub const FORMAT_TSV: &str = "tsv";
    /// Format tag for delimited files whose delimiter comes from the column map.
    pub const FORMAT_DELIMITED: &str = "delimited";
    /// Format tag for JSON-lines files.
    pub const FORMAT_JSONL: &str = "jsonl";
    /// Default text column used by delimited and JSON-lines readers.
    pub const DEFAULT_TEXT_FIELD: &str = "text";
    /// Default id column used by JSON-lines readers.
    pub const DEFAULT_ID_FIELD: &str = "id";
    /// Default language column used by delimited and JSON-lines readers.
    pub const DEFAULT_LANG_FIELD: &str = "lang";
    /// Extension accepted by the `files` reader (case-insensitive).
    pub const TEXT_FILE_EXTENSION: &str = "txt";
}

/// Provenance step names.
pub mod provenance {
    /// Prefix for reader provenance steps (`read:lines`).
    pub const READ_PREFIX: &str = "read:";
    /// Prefix for normalizer provenance steps (`normalize:nfc`).
    pub const NORMALIZE_PREFIX: &str = "normalize:";
    /// Prefix for segmenter provenance steps (`segment:ko`).
    pub const SEGMENT_PREFIX: &str = "segment:";
    /// Marker recorded when the generic segmentation heuristic was used.
    pub const SEGMENT_FALLBACK: &str = "segment:fallback";
    /// Prefix for tokenizer provenance steps (`tokenize:en/whitespace`).
    pub const TOKENIZE_PREFIX: &str = "tokenize:";
    /// Marker recorded when the decoder stripped a byte-order mark or repaired text.
    pub const DECODE_REPAIRED: &str = "normalize:repaired";
}

/// Constants used by the pipeline driver.
pub mod pipeline {
    /// Default number of documents per batch.
    pub const DEFAULT_BATCH_SIZE: usize = 256;
    /// Default per-document stage budget in milliseconds.
    pub const DEFAULT_STAGE_TIMEOUT_MS: u64 = 30_000;
    /// Version mixed into the configuration checksum; bump when output semantics change.
    pub const PIPELINE_OUTPUT_VERSION: u32 = 2;
}

/// Constants used by corpus-store persistence and wire encoding.
pub mod store {
    /// Version tag for persisted shard payloads.
    pub const SHARD_RECORD_VERSION: u8 = 2;
    /// Prefix marker for bitcode-encoded payloads.
    pub const BITCODE_PREFIX: u8 = b'B';
    /// Version tag for store metadata compatibility checks.
    pub const STORE_VERSION: u8 = 1;
    /// Default number of shard files.
    pub const DEFAULT_SHARD_COUNT: u16 = 16;
    /// Default directory for corpus-store files.
    pub const DEFAULT_STORE_DIR: &str = ".korpus_store";
    /// Filename of the store metadata file.
    pub const STORE_META_FILENAME: &str = "store.json";
    /// Filename of the append-only manifest log.
    pub const MANIFEST_FILENAME: &str = "manifest.jsonl";
    /// Filename of the append-only quarantine log.
    pub const QUARANTINE_FILENAME: &str = "quarantine.jsonl";
    /// Filename of the last run configuration snapshot.
    pub const CONFIG_SNAPSHOT_FILENAME: &str = "run-config.json";
    /// Filename prefix for shard files (`shard-0003.bin`).
    pub const SHARD_FILE_PREFIX: &str = "shard-";
    /// Filename extension for shard files.
    pub const SHARD_FILE_EXTENSION: &str = "bin";
    /// Filename prefix for per-split exports (`split-train.jsonl`).
    pub const SPLIT_EXPORT_PREFIX: &str = "split-";
    /// Filename prefix for per-split metadata exports (`meta-train.jsonl`).
    pub const METADATA_EXPORT_PREFIX: &str = "meta-";
    /// Filename extension for exports.
    pub const EXPORT_FILE_EXTENSION: &str = "jsonl";
}
