//
// overlay.rs
//
// In-memory editor buffers that take precedence over the filesystem
//

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use ropey::Rope;
use tower_lsp::lsp_types::{Position, TextDocumentContentChangeEvent};

use crate::disk_cache::DiskCache;
use crate::utf16::{trim_line_ending, utf16_offset_to_char_offset};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OverlayError {
    #[error("{} is not open", path.display())]
    NotOpen { path: PathBuf },

    #[error("invalid range in {}: {reason}", path.display())]
    InvalidRange { path: PathBuf, reason: String },
}

#[derive(Debug, thiserror::Error)]
#[error("{}: {source}", path.display())]
pub struct ReadError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl ReadError {
    pub fn is_not_found(&self) -> bool {
        self.source.kind() == std::io::ErrorKind::NotFound
    }
}

/// Notified after every successful open, change and close.
pub trait OverlayObserver: Send + Sync {
    fn overlay_changed(&self, path: &Path);
}

/// One open editor buffer
#[derive(Debug, Clone)]
pub struct OverlayEntry {
    pub contents: Rope,
    pub text: Arc<str>,
    pub version: i32,
    /// Bumped on every applied change
    pub revision: u64,
}

impl OverlayEntry {
    fn new(text: &str, version: i32) -> Self {
        Self {
            contents: Rope::from_str(text),
            text: Arc::from(text),
            version,
            revision: 0,
        }
    }
}

/// Resolve an LSP position to a char index in `rope`, rejecting positions
/// outside the buffer.
fn position_to_char(rope: &Rope, position: Position) -> Result<usize, String> {
    let line = position.line as usize;
    if line >= rope.len_lines() {
        return Err(format!(
            "line {} is past the end of the buffer ({} lines)",
            line,
            rope.len_lines()
        ));
    }
    let line_text = rope.line(line).to_string();
    let line_text = trim_line_ending(&line_text);
    let char_offset = utf16_offset_to_char_offset(line_text, position.character as usize)
        .ok_or_else(|| {
            format!(
                "character {} is outside line {} or splits a surrogate pair",
                position.character, line
            )
        })?;
    Ok(rope.line_to_char(line) + char_offset)
}

/// Apply a batch of changes to a copy of `rope`. Each range refers to the
/// buffer as left by the previous change in the batch.
pub fn apply_changes(rope: &Rope, changes: &[TextDocumentContentChangeEvent]) -> Result<Rope, String> {
    let mut rope = rope.clone();
    for change in changes {
        match change.range {
            Some(range) => {
                let start = position_to_char(&rope, range.start)?;
                let end = position_to_char(&rope, range.end)?;
                if end < start {
                    return Err(format!(
                        "range end {}:{} precedes start {}:{}",
                        range.end.line, range.end.character, range.start.line, range.start.character
                    ));
                }
                rope.remove(start..end);
                rope.insert(start, &change.text);
            }
            None => rope = Rope::from_str(&change.text),
        }
    }
    Ok(rope)
}

/// Single source of truth for file contents. Open buffers shadow disk.
pub struct OverlayStore {
    entries: RwLock<HashMap<PathBuf, OverlayEntry>>,
    disk: DiskCache,
    observers: RwLock<Vec<Arc<dyn OverlayObserver>>>,
}

impl Default for OverlayStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            disk: DiskCache::default(),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn OverlayObserver>) {
        if let Ok(mut guard) = self.observers.write() {
            guard.push(observer);
        }
    }

    fn notify(&self, path: &Path) {
        let observers: Vec<_> = match self.observers.read() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        for observer in observers {
            observer.overlay_changed(path);
        }
    }

    /// Insert or replace the buffer for `path`.
    pub fn open(&self, path: &Path, text: &str, version: i32) {
        if let Ok(mut guard) = self.entries.write() {
            guard.insert(path.to_path_buf(), OverlayEntry::new(text, version));
        }
        log::trace!("overlay open {} (version {})", path.display(), version);
        self.notify(path);
    }

    /// Apply a batch of edits atomically: either every change applies or the
    /// buffer is left untouched.
    pub fn change(
        &self,
        path: &Path,
        version: i32,
        changes: &[TextDocumentContentChangeEvent],
    ) -> Result<(), OverlayError> {
        {
            let mut guard = match self.entries.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let entry = guard.get_mut(path).ok_or_else(|| OverlayError::NotOpen {
                path: path.to_path_buf(),
            })?;
            let contents =
                apply_changes(&entry.contents, changes).map_err(|reason| OverlayError::InvalidRange {
                    path: path.to_path_buf(),
                    reason,
                })?;
            entry.text = Arc::from(contents.to_string());
            entry.contents = contents;
            entry.version = version;
            entry.revision += 1;
        }
        log::trace!("overlay change {} (version {})", path.display(), version);
        self.notify(path);
        Ok(())
    }

    /// Drop the buffer; later reads fall through to disk.
    pub fn close(&self, path: &Path) -> bool {
        let removed = self
            .entries
            .write()
            .map(|mut guard| guard.remove(path).is_some())
            .unwrap_or(false);
        if removed {
            self.disk.invalidate(path);
            self.notify(path);
        }
        removed
    }

    /// Current content of `path`: the open buffer if any, else disk.
    pub fn read(&self, path: &Path) -> Result<Arc<str>, ReadError> {
        if let Some(text) = self.overlay_text(path) {
            return Ok(text);
        }
        self.disk.read(path).map_err(|source| ReadError {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn overlay_text(&self, path: &Path) -> Option<Arc<str>> {
        self.entries.read().ok()?.get(path).map(|e| e.text.clone())
    }

    pub fn version(&self, path: &Path) -> Option<i32> {
        self.entries.read().ok()?.get(path).map(|e| e.version)
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.entries
            .read()
            .map(|g| g.contains_key(path))
            .unwrap_or(false)
    }

    /// Open buffers whose parent directory is `dir`; these may not exist on
    /// disk yet.
    pub fn open_paths_in(&self, dir: &Path) -> Vec<PathBuf> {
        let Ok(guard) = self.entries.read() else {
            return Vec::new();
        };
        let mut paths: Vec<_> = guard
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    pub fn open_paths(&self) -> Vec<PathBuf> {
        self.entries
            .read()
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget cached disk content, e.g. after a watched-file event.
    pub fn refresh_disk(&self, path: &Path) {
        self.disk.invalidate(path);
    }

    pub fn refresh_all_disk(&self) {
        self.disk.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tower_lsp::lsp_types::Range;

    use crate::utf16::LineIndex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<PathBuf>>);

    impl OverlayObserver for Recorder {
        fn overlay_changed(&self, path: &Path) {
            self.0.lock().unwrap().push(path.to_path_buf());
        }
    }

    fn edit(sl: u32, sc: u32, el: u32, ec: u32, text: &str) -> TextDocumentContentChangeEvent {
        TextDocumentContentChangeEvent {
            range: Some(Range::new(Position::new(sl, sc), Position::new(el, ec))),
            range_length: None,
            text: text.to_string(),
        }
    }

    fn full(text: &str) -> TextDocumentContentChangeEvent {
        TextDocumentContentChangeEvent {
            range: None,
            range_length: None,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_overlay_precedence_over_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.go");
        std::fs::write(&path, "package disk\n").unwrap();

        let store = OverlayStore::new();
        assert_eq!(&*store.read(&path).unwrap(), "package disk\n");

        store.open(&path, "package buffer\n", 1);
        assert_eq!(&*store.read(&path).unwrap(), "package buffer\n");

        assert!(store.close(&path));
        assert_eq!(&*store.read(&path).unwrap(), "package disk\n");
    }

    #[test]
    fn test_read_missing_file() {
        let store = OverlayStore::new();
        let err = store.read(Path::new("/nonexistent/golsp/x.go")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_incremental_edits_apply_in_order() {
        let store = OverlayStore::new();
        let path = PathBuf::from("/w/a.go");
        store.open(&path, "package a\n\nfunc A() {}\n", 1);
        // Second edit is expressed against the buffer produced by the first
        store
            .change(&path, 2, &[edit(2, 5, 2, 6, "A2"), edit(2, 8, 2, 8, "x int")])
            .unwrap();
        assert_eq!(
            &*store.overlay_text(&path).unwrap(),
            "package a\n\nfunc A2(x int) {}\n"
        );
        assert_eq!(store.version(&path), Some(2));
    }

    #[test]
    fn test_full_replacement() {
        let store = OverlayStore::new();
        let path = PathBuf::from("/w/a.go");
        store.open(&path, "package a\n", 1);
        store.change(&path, 2, &[full("package b\n")]).unwrap();
        assert_eq!(&*store.read(&path).unwrap(), "package b\n");
    }

    #[test]
    fn test_invalid_range_leaves_buffer_untouched() {
        let store = OverlayStore::new();
        let path = PathBuf::from("/w/a.go");
        store.open(&path, "package a\n", 1);

        let past_line = store.change(&path, 2, &[edit(0, 0, 0, 1, "P"), edit(5, 0, 5, 0, "x")]);
        assert!(matches!(past_line, Err(OverlayError::InvalidRange { .. })));

        let past_char = store.change(&path, 2, &[edit(0, 20, 0, 20, "x")]);
        assert!(matches!(past_char, Err(OverlayError::InvalidRange { .. })));

        let reversed = store.change(&path, 2, &[edit(0, 5, 0, 2, "")]);
        assert!(matches!(reversed, Err(OverlayError::InvalidRange { .. })));

        assert_eq!(&*store.read(&path).unwrap(), "package a\n");
        assert_eq!(store.version(&path), Some(1));
    }

    #[test]
    fn test_change_requires_open_document() {
        let store = OverlayStore::new();
        let err = store.change(Path::new("/w/b.go"), 1, &[full("x")]).unwrap_err();
        assert!(matches!(err, OverlayError::NotOpen { .. }));
    }

    #[test]
    fn test_utf16_columns() {
        let store = OverlayStore::new();
        let path = PathBuf::from("/w/a.go");
        store.open(&path, "s := \"😀x\"\n", 1);
        // 😀 occupies columns 6..8; replace the x after it
        store.change(&path, 2, &[edit(0, 8, 0, 9, "y")]).unwrap();
        assert_eq!(&*store.read(&path).unwrap(), "s := \"😀y\"\n");
        // Column 7 splits the surrogate pair
        let err = store.change(&path, 3, &[edit(0, 7, 0, 7, "z")]);
        assert!(err.is_err());
    }

    #[test]
    fn test_line_breaks_match_line_index() {
        let store = OverlayStore::new();
        let path = PathBuf::from("/w/a.go");
        let text = "// a\u{2028}b\nvar x\rvar z\n";
        store.open(&path, text, 1);
        let index = LineIndex::new(text);
        assert_eq!(index.line_text(text, 1), Some("var x"));

        // Line 1 is `var x` for both the buffer and the index
        store.change(&path, 2, &[edit(1, 4, 1, 5, "y")]).unwrap();
        // A lone carriage return ends line 1
        store.change(&path, 3, &[edit(2, 4, 2, 5, "w")]).unwrap();
        assert_eq!(
            &*store.read(&path).unwrap(),
            "// a\u{2028}b\nvar y\rvar w\n"
        );
    }

    #[test]
    fn test_observers_notified_on_every_mutation() {
        let store = OverlayStore::new();
        let recorder = Arc::new(Recorder::default());
        store.subscribe(recorder.clone());
        let path = PathBuf::from("/w/a.go");

        store.open(&path, "package a\n", 1);
        store.change(&path, 2, &[full("package a\n\n")]).unwrap();
        let _ = store.change(&path, 3, &[edit(9, 0, 9, 0, "x")]);
        store.close(&path);

        assert_eq!(recorder.0.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_open_paths_in_dir() {
        let store = OverlayStore::new();
        store.open(Path::new("/w/p/b.go"), "", 1);
        store.open(Path::new("/w/p/a.go"), "", 1);
        store.open(Path::new("/w/q/c.go"), "", 1);
        assert_eq!(
            store.open_paths_in(Path::new("/w/p")),
            vec![PathBuf::from("/w/p/a.go"), PathBuf::from("/w/p/b.go")]
        );
    }
}
