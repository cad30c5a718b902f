#![allow(dead_code)]

use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mediadex::scanner::kinds::FileKind;
use mediadex::scanner::tools::{MetadataTool, ToolMap, ToolResult};
use mediadex::scanner::MetadataExtractor;
use mediadex::{Config, Database, Indexer};

/// Stands in for exiftool: reports fixed dimensions for images.
#[derive(Default)]
pub struct FakeTags {
    pub calls: AtomicUsize,
    /// While false, reads block until it opens.
    gate: Option<AtomicBool>,
    /// Delete the file while "reading" it.
    delete_on_read: bool,
}

impl FakeTags {
    pub fn gated() -> Self {
        Self {
            gate: Some(AtomicBool::new(false)),
            ..Self::default()
        }
    }

    pub fn deleting() -> Self {
        Self {
            delete_on_read: true,
            ..Self::default()
        }
    }

    pub fn open(&self) {
        if let Some(gate) = &self.gate {
            gate.store(true, Ordering::SeqCst);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MetadataTool for FakeTags {
    fn name(&self) -> &str {
        "fake-tags"
    }

    fn supports(&self, kind: FileKind) -> bool {
        kind == FileKind::Image
    }

    fn read(&self, path: &Path, _fields: Option<&[&str]>) -> ToolResult {
        if let Some(gate) = &self.gate {
            while !gate.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delete_on_read {
            let _ = std::fs::remove_file(path);
        }
        let mut map = ToolMap::new();
        map.insert("ImageWidth".into(), Value::from(640));
        map.insert("ImageHeight".into(), Value::from(480));
        map.insert("Rating".into(), Value::from(3));
        Ok(map)
    }
}

pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.db_path = dir.join("catalog.db");
    config.scanner.batch_size = 2;
    config.enrichment.idle_poll_ms = 5;
    config.enrichment.retry_delay_ms = 5;
    config
}

pub fn open_db(config: &Config) -> Database {
    let db = Database::open(&config.db_path).unwrap();
    db.set_busy_timeout(config.db_busy_timeout()).unwrap();
    db.initialize().unwrap();
    db
}

pub fn indexer_with(config: Config, db: &Database, tool: Arc<FakeTags>) -> Indexer {
    let tool: Arc<dyn MetadataTool> = tool;
    let extractor = Arc::new(MetadataExtractor::new(Some(tool), None));
    Indexer::with_extractor(db.clone(), config, extractor).unwrap()
}

pub fn write_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, bytes).unwrap();
}
