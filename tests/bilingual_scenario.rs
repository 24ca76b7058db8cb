use std::fs;
use std::path::Path;

use tempfile::tempdir;

use korpus::{
    CancellationToken, Lang, Pipeline, PipelineConfig, Stage, TokenizerRegistry,
};

fn bilingual_config(input: &Path, store_dir: &Path, format: &str) -> PipelineConfig {
    let mut config = PipelineConfig {
        input: input.to_path_buf(),
        format: format.into(),
        store_dir: store_dir.to_path_buf(),
        shard_count: 4,
        ..PipelineConfig::default()
    };
    config.engines.insert(Lang::En, "whitespace".into());
    config.engines.insert(Lang::Ko, "character".into());
    config
}

fn run(config: PipelineConfig) -> (Pipeline, korpus::RunReport) {
    let registry = TokenizerRegistry::from_engines(&config.engines).unwrap();
    let pipeline = Pipeline::new(config, registry).unwrap();
    let report = pipeline.execute(&CancellationToken::new()).unwrap();
    (pipeline, report)
}

#[test]
fn two_line_bilingual_tsv_commits_one_record_per_line() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("greetings.tsv");
    fs::write(&input, "lang\ttext\nen\tHello world.\nko\tAnnyeong.\n").unwrap();

    let (pipeline, report) = run(bilingual_config(&input, &temp.path().join("store"), "tsv"));
    assert_eq!(report.committed, 2);
    assert_eq!(report.failed_total(), 0);

    let store = pipeline.open_store().unwrap();
    let english = store.read_document("greetings:2").unwrap().unwrap();
    assert_eq!(english.len(), 1);
    assert_eq!(english[0].tokens, vec!["Hello", "world."]);
    assert_eq!(english[0].lang, Lang::En);

    let korean = store.read_document("greetings:3").unwrap().unwrap();
    assert_eq!(korean.len(), 1);
    assert!(!korean[0].tokens.is_empty());
    assert_eq!(korean[0].tokens.concat(), "Annyeong.");
    assert_eq!(korean[0].lang, Lang::Ko);
    assert_ne!(english[0].id, korean[0].id);

    let entries = store.manifest_entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|entry| entry.stage_completed == Stage::Tokenized
        && entry.config_checksum == pipeline.config_checksum()));
}

#[test]
fn jsonl_hangul_documents_use_the_korean_pipeline() {
    let temp = tempdir().unwrap();
    let input = temp.path().join("mixed.jsonl");
    fs::write(
        &input,
        concat!(
            "{\"id\":\"en-1\",\"lang\":\"en\",\"text\":\"Dr. Kim arrived at 9.30 a.m. today. She left.\"}\n",
            "{\"id\":\"ko-1\",\"lang\":\"ko\",\"text\":\"서울은 맑습니다. 부산은 비가 옵니다!\"}\n",
        ),
    )
    .unwrap();

    let (pipeline, report) = run(bilingual_config(&input, &temp.path().join("store"), "jsonl"));
    assert_eq!(report.committed, 2);
    let en = report.stats.lang(&Lang::En).unwrap();
    assert_eq!((en.documents, en.segments), (1, 2));

    let store = pipeline.open_store().unwrap();
    let korean = store.read_document("ko-1").unwrap().unwrap();
    assert_eq!(korean.len(), 2);
    assert_eq!(korean[0].id, "ko-1#0");
    assert_eq!(korean[1].id, "ko-1#1");
    assert_eq!(korean[0].tokens.concat(), "서울은맑습니다.");
    assert_eq!(
        korean[1].provenance,
        vec!["read:jsonl", "normalize:nfc", "segment:ko", "tokenize:ko/character"]
    );
}
