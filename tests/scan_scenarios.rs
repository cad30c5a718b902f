mod common;

use std::sync::Arc;

use common::{indexer_with, open_db, test_config, write_file, FakeTags};
use mediadex::db::{assets, journal};
use mediadex::scanner::fingerprint::path_key;
use mediadex::scanner::Quality;
use mediadex::ScanOptions;
use tempfile::tempdir;

fn full() -> ScanOptions {
    ScanOptions::default()
}

#[tokio::test]
async fn empty_directory_scans_to_zero() {
    let dir = tempdir().unwrap();
    let media = dir.path().join("media");
    std::fs::create_dir(&media).unwrap();
    let config = test_config(dir.path());
    let db = open_db(&config);
    let indexer = indexer_with(config, &db, Arc::new(FakeTags::default()));

    let stats = indexer.scan_directory(&media, full()).await.unwrap();
    assert_eq!(stats.scanned, 0);
    assert_eq!(stats.added, 0);
    assert_eq!(stats.updated, 0);
    assert_eq!(stats.errors, 0);
    indexer.shutdown(false).await;
}

#[tokio::test]
async fn new_files_are_added_with_unique_ids_and_journaled() {
    let dir = tempdir().unwrap();
    let media = dir.path().join("media");
    let names = ["a.png", "b.jpg", "nested/c.webp"];
    for name in names {
        write_file(&media.join(name), name.as_bytes());
    }
    let config = test_config(dir.path());
    let db = open_db(&config);
    let indexer = indexer_with(config, &db, Arc::new(FakeTags::default()));

    let stats = indexer.scan_directory(&media, full()).await.unwrap();
    assert_eq!(stats.scanned, 3);
    assert_eq!(stats.added, 3);
    assert_eq!(stats.errors, 0);

    let keys: Vec<String> = names.iter().map(|n| path_key(&media.join(n))).collect();
    let existing = db.with_conn(|conn| assets::lookup_existing(conn, &keys)).unwrap();
    let mut unique: Vec<i64> = existing.values().map(|e| e.id).collect();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 3);

    let journaled = db.with_conn(|conn| journal::lookup(conn, &keys)).unwrap();
    assert_eq!(journaled.len(), 3);

    let nested = db
        .with_conn(|conn| assets::get_asset_by_key(conn, &keys[2]))
        .unwrap()
        .unwrap();
    assert_eq!(nested.subfolder, "nested");
    assert_eq!((nested.width, nested.height), (Some(640), Some(480)));
    indexer.shutdown(false).await;
}

#[tokio::test]
async fn editing_one_file_updates_only_that_file() {
    let dir = tempdir().unwrap();
    let media = dir.path().join("media");
    for name in ["a.png", "b.png", "c.png"] {
        write_file(&media.join(name), b"original");
    }
    let config = test_config(dir.path());
    let db = open_db(&config);
    let tool = Arc::new(FakeTags::default());
    let indexer = indexer_with(config, &db, tool.clone());

    indexer.scan_directory(&media, full()).await.unwrap();
    assert_eq!(tool.calls(), 3);

    write_file(&media.join("b.png"), b"edited, and longer than before");
    let stats = indexer.scan_directory(&media, full()).await.unwrap();
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.added, 0);
    assert_eq!(stats.journal_skipped, 2);
    assert_eq!(tool.calls(), 4);
    indexer.shutdown(false).await;
}

#[tokio::test]
async fn rescanning_unchanged_tree_is_idempotent() {
    let dir = tempdir().unwrap();
    let media = dir.path().join("media");
    for name in ["a.png", "b.png", "c.png"] {
        write_file(&media.join(name), name.as_bytes());
    }
    let config = test_config(dir.path());
    let db = open_db(&config);
    let tool = Arc::new(FakeTags::default());
    let indexer = indexer_with(config, &db, tool.clone());

    indexer.scan_directory(&media, full()).await.unwrap();
    let again = indexer.scan_directory(&media, full()).await.unwrap();
    assert_eq!(again.added, 0);
    assert_eq!(again.updated, 0);
    assert_eq!(again.skipped, 3);
    assert_eq!(tool.calls(), 3);
    assert_eq!(db.with_conn(|conn| assets::count_assets(conn)).unwrap(), 3);
    indexer.shutdown(false).await;
}

#[tokio::test]
async fn identical_files_form_one_exact_group() {
    let dir = tempdir().unwrap();
    let media = dir.path().join("media");
    write_file(&media.join("one.png"), b"same bytes");
    write_file(&media.join("copy/two.png"), b"same bytes");
    write_file(&media.join("other.png"), b"different bytes");
    let config = test_config(dir.path());
    let db = open_db(&config);
    let indexer = indexer_with(config, &db, Arc::new(FakeTags::default()));

    indexer.scan_directory(&media, full()).await.unwrap();
    let report = indexer.compute_hashes().await.unwrap();
    assert_eq!(report.hashed, 3);

    let groups = indexer.exact_duplicates().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].total, 2);
    assert_eq!(groups[0].members.len(), 2);

    // Nothing left to hash.
    assert_eq!(indexer.compute_hashes().await.unwrap().hashed, 0);
    indexer.shutdown(false).await;
}

#[tokio::test]
async fn file_deleted_before_persist_is_voided() {
    let dir = tempdir().unwrap();
    let media = dir.path().join("media");
    write_file(&media.join("fleeting.png"), b"here for now");
    let config = test_config(dir.path());
    let db = open_db(&config);
    let indexer = indexer_with(config, &db, Arc::new(FakeTags::deleting()));

    let stats = indexer.scan_directory(&media, full()).await.unwrap();
    assert_eq!(stats.added, 0);
    assert_eq!(stats.state_drifted, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(db.with_conn(|conn| assets::count_assets(conn)).unwrap(), 0);
    indexer.shutdown(false).await;
}

#[tokio::test]
async fn fast_scan_returns_before_enrichment_completes() {
    let dir = tempdir().unwrap();
    let media = dir.path().join("media");
    let names = ["a.png", "b.png", "c.png"];
    for name in names {
        write_file(&media.join(name), name.as_bytes());
    }
    let config = test_config(dir.path());
    let db = open_db(&config);
    let tool = Arc::new(FakeTags::gated());
    let indexer = indexer_with(config, &db, tool.clone());

    let options = ScanOptions {
        fast: true,
        ..ScanOptions::default()
    };
    let stats = indexer.scan_directory(&media, options).await.unwrap();
    assert_eq!(stats.added, 3);
    assert_eq!(stats.enqueued, 3);

    let quality_of = |name: &str| {
        let key = path_key(&media.join(name));
        db.with_conn(|conn| {
            let asset = assets::get_asset_by_key(conn, &key)?.unwrap();
            Ok(assets::get_metadata(conn, asset.id)?.map(|m| m.quality))
        })
        .unwrap()
    };
    for name in names {
        assert_eq!(quality_of(name), Some(Quality::None));
    }

    tool.open();
    indexer.enrichment().wait_idle().await;
    for name in names {
        assert_eq!(quality_of(name), Some(Quality::Full));
    }
    assert_eq!(tool.calls(), 3);
    assert_eq!(indexer.enrichment().stats().enriched, 3);

    let catalog = indexer.catalog_stats().await.unwrap();
    assert_eq!(catalog.by_quality, vec![("full".to_string(), 3)]);
    indexer.shutdown(false).await;
}

fn fast() -> ScanOptions {
    ScanOptions {
        fast: true,
        ..ScanOptions::default()
    }
}

fn journal_matches_asset(db: &mediadex::Database, key: &str) -> bool {
    db.with_conn(|conn| {
        let asset = assets::get_asset_by_key(conn, key)?.unwrap();
        let journaled = journal::lookup(conn, &[key.to_string()])?;
        Ok(journaled.get(key) == Some(&asset.fingerprint))
    })
    .unwrap()
}

#[tokio::test]
async fn fast_rescan_of_edited_rich_file_is_enriched_again() {
    let dir = tempdir().unwrap();
    let media = dir.path().join("media");
    let file = media.join("a.png");
    write_file(&file, b"a");
    let config = test_config(dir.path());
    let db = open_db(&config);
    let tool = Arc::new(FakeTags::default());
    let indexer = indexer_with(config, &db, tool.clone());

    indexer.scan_directory(&media, full()).await.unwrap();
    assert_eq!(tool.calls(), 1);

    write_file(&file, b"edited after the first scan");
    let stats = indexer.scan_directory(&media, fast()).await.unwrap();
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.enqueued, 1);

    indexer.enrichment().wait_idle().await;
    assert_eq!(tool.calls(), 2);
    let key = path_key(&file);
    assert!(journal_matches_asset(&db, &key));

    // Settled: a full rescan has nothing left to extract.
    let stats = indexer.scan_directory(&media, full()).await.unwrap();
    assert_eq!(stats.skipped, 1);
    assert_eq!(tool.calls(), 2);
    indexer.shutdown(false).await;
}

#[tokio::test]
async fn rejected_metadata_write_is_retried_by_next_full_scan() {
    let dir = tempdir().unwrap();
    let media = dir.path().join("media");
    let file = media.join("a.png");
    write_file(&file, b"a");
    let mut config = test_config(dir.path());
    // Nothing reaches the enrichment worker.
    config.scanner.max_enrich_backlog = 0;
    let db = open_db(&config);
    let tool = Arc::new(FakeTags::default());
    let indexer = indexer_with(config, &db, tool.clone());

    indexer.scan_directory(&media, full()).await.unwrap();
    write_file(&file, b"edited after the first scan");
    let stats = indexer.scan_directory(&media, fast()).await.unwrap();
    assert_eq!(stats.updated, 1);
    assert_eq!(stats.enqueued, 0);

    // The bare fast-scan write lost to the stored full tier, so the journal
    // still names the old state.
    let key = path_key(&file);
    assert!(!journal_matches_asset(&db, &key));

    indexer.scan_directory(&media, full()).await.unwrap();
    assert_eq!(tool.calls(), 2);
    assert!(journal_matches_asset(&db, &key));
    let asset = db
        .with_conn(|conn| assets::get_asset_by_key(conn, &key))
        .unwrap()
        .unwrap();
    assert_eq!((asset.width, asset.height), (Some(640), Some(480)));
    indexer.shutdown(false).await;
}
