use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use corpdb_core::{CandidateRecord, CompanyField, CompanyRecord, SourceRef};
use corpdb_storage::{CompanyStore, MemoryStore};
use corpdb_sync::{
    report_daily_markdown, CleanupRunner, EntityMatcher, ImportConfig, ImportPipeline,
    LookupStrategy, ReconcileOptions, ReconcileOutcome, Reconciler, MIN_ADDRESS_SIMILARITY,
};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn config_for(root: &Path) -> ImportConfig {
    let mut config = ImportConfig::from_lookup(|_| None);
    config.workspace_root = root.to_path_buf();
    config.request_delay_ms = 0;
    config
}

fn candidate(cells: &[(&str, &str)]) -> CandidateRecord {
    let assembler = config_for(&workspace_root()).load_assembler().unwrap();
    let source = SourceRef {
        source_id: "listed_csv".into(),
        locator: "scenario.csv:2".into(),
        observed_at: Utc::now(),
    };
    assembler
        .assemble(source, cells.iter().copied())
        .expect("candidate has an identity")
}

fn reconciler(store: Arc<dyn CompanyStore>, dry_run: bool) -> Reconciler {
    let policy = config_for(&workspace_root()).load_merge_policy().unwrap();
    Reconciler::new(
        store,
        EntityMatcher::default(),
        policy,
        ReconcileOptions {
            dry_run,
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn new_company_is_created_under_its_corporate_number() {
    let store = Arc::new(MemoryStore::new());
    let c = candidate(&[
        ("会社名", "株式会社テスト"),
        ("資本金", "1000万円"),
        ("法人番号", "1234567890123"),
    ]);

    let result = reconciler(store.clone(), false).reconcile(&c).await.unwrap();
    assert_eq!(
        result.outcome,
        ReconcileOutcome::Created {
            id: "1234567890123".into()
        }
    );

    let docs = store.snapshot().await;
    let doc = &docs["1234567890123"];
    assert_eq!(doc.name.as_deref(), Some("株式会社テスト"));
    assert_eq!(doc.capital_stock, Some(10_000));
    assert!(doc.created_at.is_some());
    assert_eq!(doc.created_at, doc.updated_at);
}

#[tokio::test]
async fn blank_phone_is_filled_and_capital_is_kept() {
    let store = Arc::new(MemoryStore::with_records([(
        "a".to_string(),
        CompanyRecord {
            name: Some("株式会社A".into()),
            prefecture: Some("東京都".into()),
            address: Some("東京都港区1-1".into()),
            capital_stock: Some(3_000),
            ..Default::default()
        },
    )]));
    let c = candidate(&[
        ("会社名", "株式会社A"),
        ("住所", "東京都港区1-1"),
        ("電話番号", "03-1234-5678"),
        ("資本金", "5,000"),
    ]);
    assert_eq!(c.record.capital_stock, Some(5_000));

    let result = reconciler(store.clone(), false).reconcile(&c).await.unwrap();
    let ReconcileOutcome::Updated { id, filled } = &result.outcome else {
        panic!("expected an update, got {:?}", result.outcome);
    };
    assert_eq!(id, "a");
    assert!(filled.contains(&CompanyField::PhoneNumber));
    assert!(!filled.contains(&CompanyField::CapitalStock));

    let docs = store.snapshot().await;
    assert_eq!(docs["a"].phone_number.as_deref(), Some("03-1234-5678"));
    assert_eq!(docs["a"].capital_stock, Some(3_000));
    assert!(docs["a"].updated_at.is_some());
}

#[tokio::test]
async fn populated_industry_is_not_replaced_by_a_source_label() {
    let c = candidate(&[("会社名", "株式会社B"), ("業種", "IT・ソフトウェア")]);
    assert_eq!(c.record.industry.as_deref(), Some("ソフトウェア業"));

    let store = Arc::new(MemoryStore::with_records([(
        "b".to_string(),
        CompanyRecord {
            name: Some("株式会社B".into()),
            industry: Some("情報通信業".into()),
            ..Default::default()
        },
    )]));
    reconciler(store.clone(), false).reconcile(&c).await.unwrap();

    let docs = store.snapshot().await;
    assert_eq!(docs["b"].industry.as_deref(), Some("情報通信業"));
    assert_eq!(docs["b"].industry_small.as_deref(), Some("ソフトウェア業"));
}

#[tokio::test]
async fn corporate_number_match_beats_a_name_match() {
    let store = Arc::new(MemoryStore::with_records([
        (
            "x".to_string(),
            CompanyRecord {
                name: Some("株式会社旧商号".into()),
                corporate_number: Some("1234567890123".into()),
                ..Default::default()
            },
        ),
        (
            "y".to_string(),
            CompanyRecord {
                name: Some("株式会社テスト".into()),
                prefecture: Some("東京都".into()),
                ..Default::default()
            },
        ),
    ]));
    let c = candidate(&[
        ("法人番号", "1234567890123"),
        ("会社名", "株式会社テスト"),
        ("都道府県", "東京都"),
    ]);

    let found = EntityMatcher::default()
        .find(store.as_ref(), &c.record)
        .await
        .unwrap()
        .expect("a match");
    assert_eq!(found.strategy, LookupStrategy::CorporateNumber);
    assert_eq!(found.company.id, "x");
}

fn copy_tree(from: &Path, to: &Path) {
    std::fs::create_dir_all(to).unwrap();
    for entry in std::fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), &target).unwrap();
        }
    }
}

fn fixture_workspace() -> tempfile::TempDir {
    let root = workspace_root();
    let dir = tempfile::tempdir().unwrap();
    copy_tree(&root.join("rules"), &dir.path().join("rules"));
    copy_tree(&root.join("fixtures"), &dir.path().join("fixtures"));
    std::fs::copy(root.join("sources.yaml"), dir.path().join("sources.yaml")).unwrap();
    dir
}

fn pipeline(root: &Path, store: Arc<dyn CompanyStore>, dry_run: bool) -> ImportPipeline {
    let config = config_for(root);
    let assembler = config.load_assembler().unwrap();
    let policy = config.load_merge_policy().unwrap();
    let reconciler = Reconciler::new(
        store,
        EntityMatcher::default(),
        policy,
        ReconcileOptions {
            dry_run,
            ..Default::default()
        },
    );
    ImportPipeline::new(config, assembler, reconciler).unwrap()
}

#[tokio::test]
async fn fixture_import_merges_regional_rows_into_listed_records() {
    let workspace = fixture_workspace();
    let store = Arc::new(MemoryStore::new());

    let summary = pipeline(workspace.path(), store.clone(), false)
        .run_import(None)
        .await
        .unwrap();
    assert_eq!(summary.candidates, 7);
    assert_eq!(summary.counts.created, 5);
    assert_eq!(summary.counts.updated, 2);
    assert_eq!(summary.counts.failed, 0);
    assert_eq!(summary.sources.len(), 2);

    let docs = store.snapshot().await;
    assert_eq!(docs.len(), 5);
    let listed = &docs["1234567890123"];
    assert_eq!(listed.phone_number.as_deref(), Some("03-1234-5678"));
    assert_eq!(listed.capital_stock, Some(10_000));
    assert_eq!(
        listed.banks.as_deref(),
        Some(&["みずほ銀行".to_string(), "三菱UFJ銀行".to_string()][..])
    );
    let regional = docs
        .values()
        .find(|d| d.name.as_deref() == Some("株式会社新規"))
        .expect("regional company created");
    assert_eq!(regional.capital_stock, Some(20_000));
    assert_eq!(regional.banks.as_deref(), Some(&["りそな銀行".to_string()][..]));

    let reports = workspace.path().join("reports").join(summary.run_id.to_string());
    for name in [
        "run_summary.json",
        "daily_brief.md",
        "ambiguous_matches.csv",
        "no_match.csv",
        "field_fills.csv",
        "failures.csv",
    ] {
        assert!(reports.join(name).is_file(), "missing {name}");
    }
    let fills = std::fs::read_to_string(reports.join("field_fills.csv")).unwrap();
    assert!(fills.contains("1234567890123,banks,regional_csv"));

    let digest = report_daily_markdown(3, Some(workspace.path().to_path_buf())).unwrap();
    assert!(digest.contains(&summary.run_id.to_string()));
}

#[tokio::test]
async fn dry_run_import_leaves_the_store_untouched() {
    let workspace = fixture_workspace();
    let store = Arc::new(MemoryStore::new());

    let summary = pipeline(workspace.path(), store.clone(), true)
        .run_import(Some("regional_csv"))
        .await
        .unwrap();
    assert!(summary.dry_run);
    assert_eq!(summary.candidates, 3);
    assert_eq!(summary.counts.would_create, 3);
    assert_eq!(summary.counts.created, 0);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn unknown_source_is_rejected_before_any_write() {
    let workspace = fixture_workspace();
    let store = Arc::new(MemoryStore::new());
    let err = pipeline(workspace.path(), store.clone(), false)
        .run_import(Some("nope"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("nope"));
    assert!(store.is_empty().await);
}

fn unnumbered(name: &str, prefecture: &str, address: &str) -> CompanyRecord {
    CompanyRecord {
        name: Some(name.into()),
        prefecture: Some(prefecture.into()),
        address: Some(address.into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn corporate_numbers_are_backfilled_from_the_master_file() {
    let workspace = fixture_workspace();
    let master = workspace.path().join("zenkoku.csv");
    std::fs::write(
        &master,
        [
            "1,7010001008844,01,1,2015-10-05,2015-10-05,テスト工業株式会社,,101,東京都,港区,芝公園４－２－８,,,,,,,,,,,,,,,,,,0\n",
            "2,1234567890123,01,1,2015-10-05,2015-10-05,株式会社ミナミ,,101,大阪府,大阪市中央区,本町１－１,,,,,,,,,,,,,,,,,,0\n",
            "3,2345678901234,01,1,2015-10-05,2015-10-05,株式会社ミナミ,,101,大阪府,堺市堺区,南瓦町３－１,,,,,,,,,,,,,,,,,,0\n",
        ]
        .concat(),
    )
    .unwrap();
    let store = Arc::new(MemoryStore::with_records([
        ("a".to_string(), unnumbered("株式会社テスト工業", "東京都", "東京都港区芝公園4-2-8")),
        ("b".to_string(), unnumbered("株式会社ミナミ", "大阪府", "大阪市中央区本町1-1")),
        ("c".to_string(), unnumbered("株式会社キタ", "北海道", "札幌市中央区1")),
    ]));
    let runner = CleanupRunner::new(config_for(workspace.path()), store.clone());

    let dry = runner
        .backfill_corporate_numbers(&master, MIN_ADDRESS_SIMILARITY, true)
        .await
        .unwrap();
    assert_eq!(dry.cleanup.map(|c| c.affected), Some(2));
    assert!(store.snapshot().await["a"].corporate_number.is_none());

    let summary = runner
        .backfill_corporate_numbers(&master, MIN_ADDRESS_SIMILARITY, false)
        .await
        .unwrap();
    let cleanup = summary.cleanup.expect("cleanup counts");
    assert_eq!(cleanup.scanned, 3);
    assert_eq!(cleanup.committed_ops, 2);
    let docs = store.snapshot().await;
    assert_eq!(docs["a"].corporate_number.as_deref(), Some("7010001008844"));
    assert_eq!(docs["b"].corporate_number.as_deref(), Some("1234567890123"));
    assert_eq!(docs["c"].corporate_number, None);

    let report = std::fs::read_to_string(
        std::path::Path::new(&summary.reports_dir).join("corporate_number_backfill.csv"),
    )
    .unwrap();
    assert!(report.contains("c,株式会社キタ,北海道,not_in_master"));
}

#[tokio::test]
async fn web_presence_backfill_rewrites_stale_flags() {
    let workspace = fixture_workspace();
    let store = Arc::new(MemoryStore::with_records([
        (
            "a".to_string(),
            CompanyRecord {
                name: Some("株式会社ウェブ".into()),
                wantedly: Some("https://www.wantedly.com/companies/web".into()),
                has_any_web_presence: Some(false),
                ..Default::default()
            },
        ),
        (
            "b".to_string(),
            CompanyRecord {
                name: Some("株式会社ナシ".into()),
                company_url: Some("null".into()),
                ..Default::default()
            },
        ),
    ]));
    let summary = CleanupRunner::new(config_for(workspace.path()), store.clone())
        .backfill_web_presence(false)
        .await
        .unwrap();
    assert_eq!(summary.cleanup.map(|c| c.affected), Some(2));
    let docs = store.snapshot().await;
    assert_eq!(docs["a"].has_any_web_presence, Some(true));
    assert_eq!(docs["b"].has_any_web_presence, Some(false));
}
