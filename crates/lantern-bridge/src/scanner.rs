//! Change detection over the script tree for hot reloading
//!
//! Tracks the files discovery would load, walking the tree the same way.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, warn};

use crate::discovery::{walk_tree, ScriptKind};

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub changed: Vec<PathBuf>,
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl ScanResult {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty() || !self.added.is_empty() || !self.removed.is_empty()
    }
}

pub struct ScriptScanner {
    root: PathBuf,
    scan_interval: Duration,
    last_scan: Option<Instant>,
    /// path -> modification time as of the last scan
    snapshot: HashMap<PathBuf, SystemTime>,
}

impl ScriptScanner {
    /// Start tracking `root`; files present now are not reported as added
    pub fn new(root: PathBuf, scan_interval: Duration) -> Self {
        let snapshot = collect(&root);
        Self {
            root,
            scan_interval,
            last_scan: None,
            snapshot,
        }
    }

    pub fn should_scan(&self) -> bool {
        self.last_scan
            .map_or(true, |last| last.elapsed() >= self.scan_interval)
    }

    pub fn tracked(&self) -> usize {
        self.snapshot.len()
    }

    pub fn scan_changes(&mut self) -> ScanResult {
        self.last_scan = Some(Instant::now());
        let current = collect(&self.root);
        let mut result = ScanResult::default();

        for (path, modified) in &current {
            match self.snapshot.get(path) {
                Some(previous) if previous != modified => {
                    debug!(target: "scripting", "Script changed: {}", path.display());
                    result.changed.push(path.clone());
                }
                Some(_) => {}
                None => {
                    debug!(target: "scripting", "Script added: {}", path.display());
                    result.added.push(path.clone());
                }
            }
        }

        for path in self.snapshot.keys() {
            if !current.contains_key(path) {
                debug!(target: "scripting", "Script removed: {}", path.display());
                result.removed.push(path.clone());
            }
        }

        result.changed.sort();
        result.added.sort();
        result.removed.sort();
        self.snapshot = current;
        result
    }
}

fn collect(root: &Path) -> HashMap<PathBuf, SystemTime> {
    let mut files = HashMap::new();

    for entry in walk_tree(root) {
        if entry.file_type().is_dir() || ScriptKind::from_path(entry.path()).is_none() {
            continue;
        }
        match entry.metadata().map_err(std::io::Error::from).and_then(|meta| meta.modified()) {
            Ok(modified) => {
                files.insert(entry.into_path(), modified);
            }
            Err(e) => {
                warn!(target: "scripting", "Failed to read modification time for {}: {}", entry.path().display(), e);
            }
        }
    }

    files
}
