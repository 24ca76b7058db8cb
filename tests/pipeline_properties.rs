use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;

use korpus::{
    CancellationToken, DocumentStage, ErrorKind, FnTokenizer, Lang, Pipeline, PipelineConfig,
    PipelineError, Record, RunMode, TokenizerDescriptor, TokenizerRegistry, UnicodeForm,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn write_corpus(path: &Path, lines: usize) {
    let body: String = (1..=lines)
        .map(|idx| format!("Document {idx} starts here.  It has {idx}.5 points!\n"))
        .collect();
    fs::write(path, body).unwrap();
}

fn base_config(input: &Path, store_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig {
        input: input.to_path_buf(),
        default_lang: Lang::En,
        store_dir: store_dir.to_path_buf(),
        shard_count: 3,
        batch_size: 3,
        ..PipelineConfig::default()
    };
    config.engines.insert(Lang::En, "whitespace".into());
    config
}

fn builtin_pipeline(config: PipelineConfig) -> Pipeline {
    let registry = TokenizerRegistry::from_engines(&config.engines).unwrap();
    Pipeline::new(config, registry).unwrap()
}

fn export(pipeline: &Pipeline, out: &Path) -> String {
    pipeline.open_store().unwrap().export_jsonl(out, None).unwrap();
    fs::read_to_string(out).unwrap()
}

#[test]
fn rerunning_the_same_configuration_is_idempotent() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("corpus.txt");
    write_corpus(&input, 7);
    let pipeline = builtin_pipeline(base_config(&input, &temp.path().join("store")));

    let first = pipeline.execute(&CancellationToken::new()).unwrap();
    assert_eq!(first.committed, 7);
    let before = export(&pipeline, &temp.path().join("before.jsonl"));

    let second = pipeline.execute(&CancellationToken::new()).unwrap();
    assert_eq!(second.committed, 0);
    assert_eq!(second.skipped, 7);
    let after = export(&pipeline, &temp.path().join("after.jsonl"));
    assert_eq!(before, after);
    assert_eq!(pipeline.open_store().unwrap().manifest_entries().unwrap().len(), 7);
}

#[test]
fn cancelled_run_resumes_to_the_same_output_as_a_clean_run() {
    init_tracing();
    let temp = tempdir().unwrap();
    let input = temp.path().join("corpus.txt");
    write_corpus(&input, 10);

    let config = base_config(&input, &temp.path().join("resumed"));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let mut registry = TokenizerRegistry::new();
    registry.register(
        TokenizerDescriptor::new(Lang::En, "whitespace"),
        Arc::new(FnTokenizer::new("whitespace", move |text: &str| {
            if text.starts_with("Document 2 ") {
                trigger.cancel();
            }
            Ok(text.split_whitespace().map(str::to_string).collect())
        })),
    );
    let interrupted = Pipeline::new(config.clone(), registry).unwrap();
    let partial = interrupted.execute(&cancel).unwrap();
    assert!(partial.cancelled);
    assert_eq!(partial.committed, 3);
    assert_eq!(partial.next_offset, 3);

    let resumed = builtin_pipeline(config);
    assert_eq!(resumed.config_checksum(), interrupted.config_checksum());
    let rest = resumed.execute(&CancellationToken::new()).unwrap();
    assert!(!rest.cancelled);
    assert_eq!((rest.skipped, rest.committed), (3, 7));

    let clean = builtin_pipeline(base_config(&input, &temp.path().join("clean")));
    clean.execute(&CancellationToken::new()).unwrap();
    assert_eq!(
        export(&resumed, &temp.path().join("resumed.jsonl")),
        export(&clean, &temp.path().join("clean.jsonl"))
    );
}

#[test]
fn start_offset_continues_from_a_reported_position() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("corpus.txt");
    write_corpus(&input, 5);
    let mut config = base_config(&input, &temp.path().join("store"));
    config.start_offset = 2;
    let report = builtin_pipeline(config).execute(&CancellationToken::new()).unwrap();
    assert_eq!(report.committed, 3);
    assert_eq!(report.next_offset, 5);
}

#[test]
fn changed_configuration_reprocesses_and_restart_clears() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("corpus.txt");
    write_corpus(&input, 4);
    let store_dir = temp.path().join("store");
    let config = base_config(&input, &store_dir);
    builtin_pipeline(config.clone())
        .execute(&CancellationToken::new())
        .unwrap();

    let mut changed = config.clone();
    changed.normalizer.default_form = UnicodeForm::Nfc;
    let report = builtin_pipeline(changed).execute(&CancellationToken::new()).unwrap();
    assert_eq!((report.committed, report.skipped), (4, 0));

    let mut restart = config;
    restart.mode = RunMode::Restart;
    let pipeline = builtin_pipeline(restart);
    let report = pipeline.execute(&CancellationToken::new()).unwrap();
    assert_eq!(report.committed, 4);
    let store = pipeline.open_store().unwrap();
    assert_eq!(store.manifest_entries().unwrap().len(), 4);
    assert_eq!(
        store.config_snapshot().unwrap().unwrap().config_checksum,
        pipeline.config_checksum()
    );
}

#[test]
fn failures_stay_scoped_to_their_documents() {
    init_tracing();
    let temp = tempdir().unwrap();
    let input = temp.path().join("corpus.txt");
    let mut bytes = b"Good first.\nThis has poison inside.\n".to_vec();
    bytes.extend_from_slice(&[b'B', b'a', b'd', 0xC3, 0x28, b'.', b'\n']);
    bytes.extend_from_slice(b"This one panics.\nGood last.\n");
    fs::write(&input, bytes).unwrap();

    let config = base_config(&input, &temp.path().join("store"));
    let mut registry = TokenizerRegistry::new();
    registry.register(
        TokenizerDescriptor::new(Lang::En, "whitespace"),
        Arc::new(FnTokenizer::new("whitespace", |text: &str| {
            if text.contains("poison") {
                return Err(PipelineError::Tokenizer {
                    engine: "whitespace".into(),
                    reason: "poisoned input".into(),
                });
            }
            if text.contains("panics") {
                panic!("tokenizer bug");
            }
            Ok(text.split_whitespace().map(str::to_string).collect())
        })),
    );
    let pipeline = Pipeline::new(config, registry).unwrap();
    let report = pipeline.execute(&CancellationToken::new()).unwrap();

    assert_eq!(report.committed, 2);
    assert_eq!(report.failures(DocumentStage::Tokenizing, ErrorKind::Tokenizer), 2);
    assert_eq!(report.failures(DocumentStage::Normalizing, ErrorKind::Encoding), 1);

    let store = pipeline.open_store().unwrap();
    assert!(store.read_document("corpus:1").unwrap().is_some());
    assert!(store.read_document("corpus:2").unwrap().is_none());
    assert!(store.read_document("corpus:5").unwrap().is_some());
    let quarantined: Vec<String> = store
        .quarantine_entries()
        .unwrap()
        .into_iter()
        .map(|entry| entry.source_id)
        .collect();
    assert_eq!(quarantined.len(), 3);
    for id in ["corpus:2", "corpus:3", "corpus:4"] {
        assert!(quarantined.contains(&id.to_string()));
    }
}

#[test]
fn malformed_rows_fail_without_stopping_the_stream() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("rows.jsonl");
    fs::write(
        &input,
        "{\"text\":\"First.\"}\nnot json\n{\"body\":\"no text\"}\n{\"text\":\"Last.\"}\n",
    )
    .unwrap();
    let mut config = base_config(&input, &temp.path().join("store"));
    config.format = "jsonl".into();
    let report = builtin_pipeline(config).execute(&CancellationToken::new()).unwrap();
    assert_eq!(report.committed, 2);
    assert_eq!(report.failures(DocumentStage::Reading, ErrorKind::Format), 2);
    let ids: Vec<&str> = report
        .quarantined
        .iter()
        .map(|entry| entry.source_id.as_str())
        .collect();
    assert_eq!(ids, vec!["rows:2", "rows:3"]);
}

#[test]
fn output_does_not_depend_on_workers_or_batching() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("corpus.txt");
    write_corpus(&input, 12);

    let mut serial = base_config(&input, &temp.path().join("serial"));
    serial.workers = 1;
    serial.batch_size = 12;
    let mut parallel = base_config(&input, &temp.path().join("parallel"));
    parallel.workers = 4;
    parallel.batch_size = 5;

    let serial = builtin_pipeline(serial);
    let parallel = builtin_pipeline(parallel);
    assert_eq!(serial.config_checksum(), parallel.config_checksum());
    serial.execute(&CancellationToken::new()).unwrap();
    parallel.execute(&CancellationToken::new()).unwrap();
    assert_eq!(
        export(&serial, &temp.path().join("serial.jsonl")),
        export(&parallel, &temp.path().join("parallel.jsonl"))
    );
}

#[test]
fn repeated_source_ids_are_skipped_within_a_run() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("dupes.jsonl");
    fs::write(
        &input,
        "{\"id\":\"a\",\"text\":\"One.\"}\n{\"id\":\"a\",\"text\":\"Two.\"}\n{\"id\":\"b\",\"text\":\"Three.\"}\n",
    )
    .unwrap();
    let mut config = base_config(&input, &temp.path().join("store"));
    config.format = "jsonl".into();
    let pipeline = builtin_pipeline(config);
    let report = pipeline.execute(&CancellationToken::new()).unwrap();
    assert_eq!((report.committed, report.skipped), (2, 1));
    let first = pipeline.open_store().unwrap().read_document("a").unwrap().unwrap();
    assert_eq!(first[0].tokens, vec!["One."]);
}

#[test]
fn tokens_reproduce_normalized_text() {
    let temp = tempdir().unwrap();
    let pipeline = builtin_pipeline(base_config(
        &temp.path().join("unused.txt"),
        &temp.path().join("store"),
    ));
    let raw = Record::raw(
        "doc:1",
        Lang::En,
        "  Ｗide   text.\r\n\r\nMr. Smith paid $3.50!  Done? ".as_bytes(),
        "read:lines",
    );
    let out = pipeline.transform(&raw).unwrap();
    let joined: String = out
        .tokenized
        .iter()
        .filter_map(Record::tokens)
        .flatten()
        .map(String::as_str)
        .collect();
    let normalized: String = out
        .normalized
        .text()
        .unwrap()
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect();
    assert_eq!(joined, normalized);
    assert_eq!(out.tokenized.len(), 3);
}
