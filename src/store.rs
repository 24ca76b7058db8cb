//! On-disk corpus store: sharded tokenized output, manifest, and quarantine.
//!
//! Layout under the store directory:
//! - `shard-NNNN.bin`: `simd_r_drive` key/value files, key = source id, value =
//!   the document's split, metadata, and ordered tokenized records (versioned
//!   bitcode payload).
//! - `manifest.jsonl`: append-only completion log; the last entry per source wins.
//! - `quarantine.jsonl`: append-only log of failed documents.
//! - `store.json`: format version and shard count.
//! - `run-config.json`: configuration snapshot of the last run.
//!
//! A document's shard payload is always written before its manifest entry, so
//! a manifest entry implies readable output.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use simd_r_drive::storage_engine::DataStore;
use simd_r_drive::storage_engine::traits::{DataStoreReader, DataStoreWriter};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::constants::store::{
    BITCODE_PREFIX, CONFIG_SNAPSHOT_FILENAME, EXPORT_FILE_EXTENSION, MANIFEST_FILENAME,
    METADATA_EXPORT_PREFIX, QUARANTINE_FILENAME, SHARD_FILE_EXTENSION, SHARD_FILE_PREFIX,
    SHARD_RECORD_VERSION, SPLIT_EXPORT_PREFIX, STORE_META_FILENAME, STORE_VERSION,
};
use crate::data::{ManifestEntry, QuarantineEntry, Stage, TokenizedRecord};
use crate::errors::PipelineError;
use crate::hash::{checksum_with, shard_index};
use crate::types::{Checksum, Metadata, SourceId, SplitName};

/// Contents of `store.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    /// Store layout version.
    pub version: u8,
    /// Shard files; fixed for the lifetime of the store.
    pub shard_count: u16,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Contents of `run-config.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Checksum of the output-affecting settings.
    pub config_checksum: Checksum,
    /// When this checksum was first recorded.
    pub written_at: DateTime<Utc>,
    /// Full configuration of the run.
    pub config: PipelineConfig,
}

/// Document-level fields stored with a document's tokenized records.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, bitcode::Encode, bitcode::Decode,
)]
pub struct DocumentInfo {
    /// Input split the document was read from.
    pub split: Option<SplitName>,
    /// Non-text columns kept by the reader.
    pub metadata: Metadata,
}

#[derive(Clone, Debug, bitcode::Encode, bitcode::Decode)]
struct ShardDocument {
    info: DocumentInfo,
    records: Vec<TokenizedRecord>,
}

#[derive(Serialize)]
struct MetadataLine<'a> {
    source_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    split: Option<&'a str>,
    #[serde(flatten)]
    metadata: &'a Metadata,
}

struct ManifestLog {
    writer: BufWriter<File>,
    entries: IndexMap<SourceId, ManifestEntry>,
}

/// Directory-backed store shared by pipeline workers.
///
/// Each shard and the manifest sit behind their own mutex, so commits to
/// different shards proceed in parallel while every file has one writer.
pub struct CorpusStore {
    dir: PathBuf,
    meta: StoreMeta,
    shards: Vec<Mutex<DataStore>>,
    manifest: Mutex<ManifestLog>,
    quarantine: Mutex<BufWriter<File>>,
}

impl fmt::Debug for CorpusStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorpusStore")
            .field("dir", &self.dir)
            .field("meta", &self.meta)
            .finish()
    }
}

impl CorpusStore {
    /// Open (or create) the store in `dir`.
    ///
    /// `shard_count` only applies to a new store; an existing store with a
    /// different shard count is rejected because source ids would map to
    /// other shards.
    pub fn open(dir: impl Into<PathBuf>, shard_count: u16) -> Result<Self, PipelineError> {
        let dir = dir.into();
        if shard_count == 0 {
            return Err(PipelineError::Configuration(
                "shard_count must be greater than zero".into(),
            ));
        }
        fs::create_dir_all(&dir).map_err(map_store_err)?;
        let meta = load_or_init_meta(&dir, shard_count)?;
        let shards = open_shards(&dir, meta.shard_count)?;
        let (manifest_path, quarantine_path) = (
            dir.join(MANIFEST_FILENAME),
            dir.join(QUARANTINE_FILENAME),
        );
        let entries = load_manifest(&manifest_path)?;
        terminate_last_line(&manifest_path)?;
        terminate_last_line(&quarantine_path)?;
        info!(
            store = %dir.display(),
            shards = meta.shard_count,
            manifest_entries = entries.len(),
            "opened corpus store"
        );
        Ok(Self {
            manifest: Mutex::new(ManifestLog {
                writer: BufWriter::new(open_append(&manifest_path)?),
                entries,
            }),
            quarantine: Mutex::new(BufWriter::new(open_append(&quarantine_path)?)),
            dir,
            meta,
            shards,
        })
    }

    /// Store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Contents of `store.json`.
    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    /// Number of shard files.
    pub fn shard_count(&self) -> u16 {
        self.meta.shard_count
    }

    /// Path of shard `index`.
    pub fn shard_path(&self, index: u16) -> PathBuf {
        self.dir.join(shard_file_name(index))
    }

    /// Shard holding `source_id`.
    pub fn shard_for(&self, source_id: &str) -> u16 {
        shard_index(source_id, self.meta.shard_count)
    }

    /// Remove every shard, manifest, and quarantine entry.
    pub fn clear(&mut self) -> Result<(), PipelineError> {
        self.shards.clear();
        for index in 0..self.meta.shard_count {
            remove_if_exists(&self.shard_path(index))?;
        }
        self.shards = open_shards(&self.dir, self.meta.shard_count)?;

        let manifest_path = self.dir.join(MANIFEST_FILENAME);
        let quarantine_path = self.dir.join(QUARANTINE_FILENAME);
        remove_if_exists(&manifest_path)?;
        remove_if_exists(&quarantine_path)?;
        self.manifest = Mutex::new(ManifestLog {
            writer: BufWriter::new(open_append(&manifest_path)?),
            entries: IndexMap::new(),
        });
        self.quarantine = Mutex::new(BufWriter::new(open_append(&quarantine_path)?));
        info!(store = %self.dir.display(), "cleared corpus store");
        Ok(())
    }

    /// Write one document's tokenized records and return the output checksum.
    ///
    /// Rewriting a document replaces its previous payload.
    pub fn write_document(
        &self,
        source_id: &str,
        info: &DocumentInfo,
        records: Vec<TokenizedRecord>,
    ) -> Result<Checksum, PipelineError> {
        let payload = encode_document(ShardDocument {
            info: info.clone(),
            records,
        });
        let checksum = checksum_with(|builder| {
            builder.part(&payload);
        });
        let index = self.shard_for(source_id);
        let shard = lock(&self.shards[usize::from(index)], "shard")?;
        shard
            .write(source_id.as_bytes(), &payload)
            .map_err(map_store_err)?;
        debug!(source_id = %source_id, shard = index, bytes = payload.len(), "wrote document");
        Ok(checksum)
    }

    /// Tokenized records previously written for `source_id`.
    pub fn read_document(
        &self,
        source_id: &str,
    ) -> Result<Option<Vec<TokenizedRecord>>, PipelineError> {
        Ok(self.load_document(source_id)?.map(|document| document.records))
    }

    /// Split and metadata previously written for `source_id`.
    pub fn read_document_info(&self, source_id: &str) -> Result<Option<DocumentInfo>, PipelineError> {
        Ok(self.load_document(source_id)?.map(|document| document.info))
    }

    fn load_document(&self, source_id: &str) -> Result<Option<ShardDocument>, PipelineError> {
        let index = self.shard_for(source_id);
        let bytes = {
            let shard = lock(&self.shards[usize::from(index)], "shard")?;
            shard
                .read(source_id.as_bytes())
                .map_err(map_store_err)?
                .map(|entry| entry.as_ref().to_vec())
        };
        bytes.map(|bytes| decode_document(&bytes)).transpose()
    }

    /// Append a manifest entry; it supersedes earlier entries for the same source.
    pub fn append_manifest(&self, entry: ManifestEntry) -> Result<(), PipelineError> {
        let line = serde_json::to_string(&entry)?;
        let mut manifest = lock(&self.manifest, "manifest")?;
        writeln!(manifest.writer, "{line}").map_err(map_store_err)?;
        manifest.writer.flush().map_err(map_store_err)?;
        manifest.entries.insert(entry.source_id.clone(), entry);
        Ok(())
    }

    /// Latest manifest entry for `source_id`.
    pub fn manifest_entry(&self, source_id: &str) -> Result<Option<ManifestEntry>, PipelineError> {
        Ok(lock(&self.manifest, "manifest")?
            .entries
            .get(source_id)
            .cloned())
    }

    /// Latest manifest entry per source, in first-commit order.
    pub fn manifest_entries(&self) -> Result<Vec<ManifestEntry>, PipelineError> {
        Ok(lock(&self.manifest, "manifest")?
            .entries
            .values()
            .cloned()
            .collect())
    }

    /// Append one failed document to the quarantine log.
    pub fn append_quarantine(&self, entry: &QuarantineEntry) -> Result<(), PipelineError> {
        let line = serde_json::to_string(entry)?;
        let mut quarantine = lock(&self.quarantine, "quarantine")?;
        writeln!(quarantine, "{line}").map_err(map_store_err)?;
        quarantine.flush().map_err(map_store_err)?;
        Ok(())
    }

    /// Every quarantine entry on disk, oldest first.
    pub fn quarantine_entries(&self) -> Result<Vec<QuarantineEntry>, PipelineError> {
        let _guard = lock(&self.quarantine, "quarantine")?;
        read_json_lines(&self.dir.join(QUARANTINE_FILENAME))
    }

    /// Save the run configuration next to the output.
    ///
    /// A snapshot already recording `config_checksum` with the same
    /// configuration is left untouched, so repeated identical runs leave the
    /// store byte-for-byte unchanged.
    pub fn write_config_snapshot(
        &self,
        config: &PipelineConfig,
        config_checksum: &str,
    ) -> Result<(), PipelineError> {
        if let Some(existing) = self.config_snapshot()?
            && existing.config_checksum == config_checksum
            && existing.config == *config
        {
            debug!(store = %self.dir.display(), "configuration snapshot unchanged");
            return Ok(());
        }
        let snapshot = ConfigSnapshot {
            config_checksum: config_checksum.to_string(),
            written_at: Utc::now(),
            config: config.clone(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        write_atomically(&self.dir.join(CONFIG_SNAPSHOT_FILENAME), json.as_bytes())
    }

    /// Last saved configuration snapshot, if any.
    pub fn config_snapshot(&self) -> Result<Option<ConfigSnapshot>, PipelineError> {
        let path = self.dir.join(CONFIG_SNAPSHOT_FILENAME);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(map_store_err)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Write committed tokenized records as JSON lines, in manifest order.
    ///
    /// `limit` caps the number of records written (a sample). Returns the
    /// number of records written.
    pub fn export_jsonl(
        &self,
        path: impl AsRef<Path>,
        limit: Option<usize>,
    ) -> Result<usize, PipelineError> {
        self.export_records(path.as_ref(), limit, |_| true)
    }

    /// Like [`export_jsonl`](Self::export_jsonl), restricted to one input split.
    pub fn export_split_jsonl(
        &self,
        split: &str,
        path: impl AsRef<Path>,
        limit: Option<usize>,
    ) -> Result<usize, PipelineError> {
        self.export_records(path.as_ref(), limit, |entry| {
            entry.split.as_deref() == Some(split)
        })
    }

    /// Write one JSON line of metadata columns per committed document.
    ///
    /// `split` restricts the export to one input split. Returns the number of
    /// documents written.
    pub fn export_metadata_jsonl(
        &self,
        split: Option<&str>,
        path: impl AsRef<Path>,
    ) -> Result<usize, PipelineError> {
        let path = path.as_ref();
        ensure_parent_dir(path)?;
        let mut writer = BufWriter::new(File::create(path)?);
        let mut written = 0usize;
        for entry in self.manifest_entries()? {
            if entry.stage_completed != Stage::Tokenized
                || split.is_some_and(|split| entry.split.as_deref() != Some(split))
            {
                continue;
            }
            let Some(info) = self.read_document_info(&entry.source_id)? else {
                warn!(source_id = %entry.source_id, "manifest entry without shard payload");
                continue;
            };
            let line = MetadataLine {
                source_id: &entry.source_id,
                split: info.split.as_deref(),
                metadata: &info.metadata,
            };
            serde_json::to_writer(&mut writer, &line)?;
            writer.write_all(b"\n")?;
            written += 1;
        }
        writer.flush()?;
        Ok(written)
    }

    /// Export every committed split into `dir` as `split-<name>.jsonl` and
    /// `meta-<name>.jsonl`. Returns the record count per split.
    pub fn export_splits(
        &self,
        dir: impl AsRef<Path>,
    ) -> Result<BTreeMap<SplitName, usize>, PipelineError> {
        let dir = dir.as_ref();
        let mut splits: Vec<SplitName> = Vec::new();
        for entry in self.manifest_entries()? {
            if let Some(split) = entry.split
                && !splits.contains(&split)
            {
                splits.push(split);
            }
        }
        let mut counts = BTreeMap::new();
        for split in splits {
            let records = dir.join(format!("{SPLIT_EXPORT_PREFIX}{split}.{EXPORT_FILE_EXTENSION}"));
            let metadata =
                dir.join(format!("{METADATA_EXPORT_PREFIX}{split}.{EXPORT_FILE_EXTENSION}"));
            let written = self.export_split_jsonl(&split, &records, None)?;
            self.export_metadata_jsonl(Some(&split), &metadata)?;
            info!(split = %split, records = written, dir = %dir.display(), "exported split");
            counts.insert(split, written);
        }
        Ok(counts)
    }

    fn export_records(
        &self,
        path: &Path,
        limit: Option<usize>,
        include: impl Fn(&ManifestEntry) -> bool,
    ) -> Result<usize, PipelineError> {
        ensure_parent_dir(path)?;
        let mut writer = BufWriter::new(File::create(path)?);
        let limit = limit.unwrap_or(usize::MAX);
        let mut written = 0usize;
        'documents: for entry in self.manifest_entries()? {
            if entry.stage_completed != Stage::Tokenized || !include(&entry) {
                continue;
            }
            let Some(records) = self.read_document(&entry.source_id)? else {
                warn!(source_id = %entry.source_id, "manifest entry without shard payload");
                continue;
            };
            for record in records {
                if written >= limit {
                    break 'documents;
                }
                serde_json::to_writer(&mut writer, &record)?;
                writer.write_all(b"\n")?;
                written += 1;
            }
        }
        writer.flush()?;
        Ok(written)
    }
}

fn load_or_init_meta(dir: &Path, shard_count: u16) -> Result<StoreMeta, PipelineError> {
    let path = dir.join(STORE_META_FILENAME);
    if path.exists() {
        let bytes = fs::read(&path).map_err(map_store_err)?;
        let meta: StoreMeta = serde_json::from_slice(&bytes).map_err(|err| {
            PipelineError::Store(format!("corrupt store metadata '{}': {err}", path.display()))
        })?;
        if meta.version != STORE_VERSION {
            return Err(PipelineError::Store(format!(
                "store version mismatch (expected {}, found {})",
                STORE_VERSION, meta.version
            )));
        }
        if meta.shard_count != shard_count {
            return Err(PipelineError::Store(format!(
                "store shard count mismatch (expected {}, found {})",
                shard_count, meta.shard_count
            )));
        }
        return Ok(meta);
    }
    let meta = StoreMeta {
        version: STORE_VERSION,
        shard_count,
        created_at: Utc::now(),
    };
    write_atomically(&path, serde_json::to_string_pretty(&meta)?.as_bytes())?;
    Ok(meta)
}

fn open_shards(dir: &Path, shard_count: u16) -> Result<Vec<Mutex<DataStore>>, PipelineError> {
    (0..shard_count)
        .map(|index| {
            DataStore::open(&dir.join(shard_file_name(index)))
                .map(Mutex::new)
                .map_err(map_store_err)
        })
        .collect()
}

fn load_manifest(path: &Path) -> Result<IndexMap<SourceId, ManifestEntry>, PipelineError> {
    let mut entries = IndexMap::new();
    for entry in read_json_lines::<ManifestEntry>(path)? {
        entries.insert(entry.source_id.clone(), entry);
    }
    Ok(entries)
}

/// Parse a JSON-lines log. A line that does not parse (for example a write cut
/// short by a crash) is logged and skipped.
fn read_json_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, PipelineError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path).map_err(map_store_err)?);
    let mut items = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(map_store_err)?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(item) => items.push(item),
            Err(err) => warn!(
                path = %path.display(),
                line = idx + 1,
                error = %err,
                "skipping unreadable log line"
            ),
        }
    }
    Ok(items)
}

/// Append a newline when a log ends mid-line so the next entry starts clean.
fn terminate_last_line(path: &Path) -> Result<(), PipelineError> {
    let mut file = match OpenOptions::new().read(true).append(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(map_store_err(err)),
    };
    let len = file.metadata().map_err(map_store_err)?.len();
    if len == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1)).map_err(map_store_err)?;
    file.read_exact(&mut last).map_err(map_store_err)?;
    if last[0] != b'\n' {
        file.write_all(b"\n").map_err(map_store_err)?;
    }
    Ok(())
}

fn shard_file_name(index: u16) -> String {
    format!("{SHARD_FILE_PREFIX}{index:04}.{SHARD_FILE_EXTENSION}")
}

fn encode_document(document: ShardDocument) -> Vec<u8> {
    let encoded = bitcode::encode(&document);
    let mut buf = Vec::with_capacity(2 + encoded.len());
    buf.push(SHARD_RECORD_VERSION);
    buf.push(BITCODE_PREFIX);
    buf.extend_from_slice(&encoded);
    buf
}

fn decode_document(bytes: &[u8]) -> Result<ShardDocument, PipelineError> {
    match bytes {
        [version, ..] if *version != SHARD_RECORD_VERSION => Err(PipelineError::Store(format!(
            "shard record version mismatch (expected {SHARD_RECORD_VERSION}, found {version})"
        ))),
        [_, prefix, payload @ ..] if *prefix == BITCODE_PREFIX => bitcode::decode(payload)
            .map_err(|err| PipelineError::Store(format!("corrupt shard record: {err}"))),
        _ => Err(PipelineError::Store(
            "bitcode payload missing expected prefix".into(),
        )),
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>, PipelineError> {
    mutex
        .lock()
        .map_err(|_| PipelineError::Store(format!("{what} lock poisoned")))
}

fn open_append(path: &Path) -> Result<File, PipelineError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(map_store_err)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(map_store_err)?;
    fs::rename(&tmp, path).map_err(map_store_err)
}

fn remove_if_exists(path: &Path) -> Result<(), PipelineError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(map_store_err(err)),
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn map_store_err(err: io::Error) -> PipelineError {
    PipelineError::Store(err.to_string())
}
