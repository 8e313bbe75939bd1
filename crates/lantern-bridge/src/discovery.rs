//! Script discovery
//!
//! Walks the script root recursively and sorts what it finds into extension
//! units, which load first, and regular units. Every directory visited also
//! contributes its alternatives to the module search path.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// `.lua`
    Lua,
    /// `.ext`, loaded before regular scripts
    Extension,
    /// `.dll` / `.so`, loaded like `.ext`
    Native,
}

impl ScriptKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "lua" => Some(ScriptKind::Lua),
            "ext" => Some(ScriptKind::Extension),
            "dll" | "so" => Some(ScriptKind::Native),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    pub fn loads_first(self) -> bool {
        !matches!(self, ScriptKind::Lua)
    }
}

/// One discovered script file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptUnit {
    /// Logical name: the file name without its extension
    pub name: String,
    pub kind: ScriptKind,
    /// Absolute path of the file
    pub path: PathBuf,
    /// Absolute path of the directory holding the file
    pub module_path: PathBuf,
}

impl ScriptUnit {
    fn sort_key(&self) -> String {
        self.path.to_string_lossy().replace('\\', "/")
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptCollection {
    pub extensions: Vec<ScriptUnit>,
    pub regular: Vec<ScriptUnit>,
}

impl ScriptCollection {
    pub fn push(&mut self, unit: ScriptUnit) {
        if unit.kind.loads_first() {
            self.extensions.push(unit);
        } else {
            self.regular.push(unit);
        }
    }

    pub fn clear(&mut self) {
        self.extensions.clear();
        self.regular.clear();
    }

    pub fn len(&self) -> usize {
        self.extensions.len() + self.regular.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extensions then regular units, each group sorted by path
    pub fn load_order(&self) -> Vec<&ScriptUnit> {
        let mut extensions: Vec<&ScriptUnit> = self.extensions.iter().collect();
        let mut regular: Vec<&ScriptUnit> = self.regular.iter().collect();
        extensions.sort_by(|a, b| by_path(a, b));
        regular.sort_by(|a, b| by_path(a, b));
        extensions.extend(regular);
        extensions
    }
}

fn by_path(a: &ScriptUnit, b: &ScriptUnit) -> Ordering {
    a.sort_key().cmp(&b.sort_key())
}

#[derive(Debug, Default)]
pub struct Discovered {
    pub scripts: ScriptCollection,
    /// `;`-separated module search path covering every visited directory
    pub search_path: String,
}

/// Scan `root` for scripts.
///
/// Paths are made absolute. A missing or unreadable root yields nothing and an
/// empty search path.
pub fn discover(root: &Path) -> Discovered {
    let root = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
    let mut discovered = Discovered::default();
    let mut search_path = Vec::new();

    for entry in walk_tree(&root) {
        let path = entry.path();
        if entry.file_type().is_dir() {
            let d = path.display();
            search_path.push(format!("{d}/?;{d}/?.lua;{d}/?.ext;{d}/?.dll;{d}/?.so"));
            continue;
        }

        let Some(kind) = ScriptKind::from_path(path) else {
            continue;
        };
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };

        debug!(target: "scripting", "Found script {}", path.display());
        discovered.scripts.push(ScriptUnit {
            name: name.to_string(),
            kind,
            path: path.to_path_buf(),
            module_path: path.parent().map(Path::to_path_buf).unwrap_or_default(),
        });
    }

    discovered.search_path = search_path.join(";");
    discovered
}

/// Visible entries below `root`, the root itself first and siblings by name.
///
/// A hidden directory is skipped with everything under it. Hot reloading
/// watches the same set of files.
pub(crate) fn walk_tree(root: &Path) -> impl Iterator<Item = DirEntry> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(target: "scripting", "Failed to read script directory: {}", e);
                None
            }
        })
}

#[cfg(unix)]
fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

#[cfg(windows)]
fn is_hidden(entry: &DirEntry) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    entry
        .metadata()
        .map(|meta| meta.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0)
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
fn is_hidden(_entry: &DirEntry) -> bool {
    false
}
