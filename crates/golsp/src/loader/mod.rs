//
// loader/mod.rs
//
// Compilation unit loading through the overlay, the toolchain and the caches
//

pub mod package_scan;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::build::import_resolve::ImportResolver;
use crate::config::InvalidationPolicy;
use crate::error::LoadError;
use crate::overlay::{OverlayObserver, OverlayStore};
use crate::toolchain::go::guess_package_name;
use crate::toolchain::{CheckInput, Toolchain, ToolchainError};
use crate::unit::{CompilationUnit, PackageSummary, UnitKey, UnitVariant};
use crate::unit_cache::{Outcome, UnitCache};
use crate::workspace_index::UnitSource;

pub use package_scan::{is_test_file, DirScan, ScannedFile};

/// Attempts at checking a unit against summaries that stay current
const MAX_CHECK_ATTEMPTS: usize = 3;

/// Loads units and package summaries on demand. Cheap to clone; clones
/// share the caches.
#[derive(Clone)]
pub struct UnitLoader {
    overlay: Arc<OverlayStore>,
    toolchain: Arc<dyn Toolchain>,
    resolver: Arc<ImportResolver>,
    units: Arc<UnitCache<CompilationUnit>>,
    summaries: Arc<UnitCache<PackageSummary>>,
}

fn toolchain_error(key: &UnitKey, err: ToolchainError) -> LoadError {
    match err {
        ToolchainError::Cancelled => LoadError::Cancelled,
        ToolchainError::Failed(message) => LoadError::Toolchain {
            unit: key.to_string(),
            message,
        },
    }
}

/// Retryable failure for a unit whose imports kept changing under it
fn imports_changed(key: &UnitKey) -> LoadError {
    LoadError::Toolchain {
        unit: key.to_string(),
        message: "imports changed while checking".to_string(),
    }
}

fn join_error(key: &UnitKey, err: tokio::task::JoinError) -> LoadError {
    if err.is_cancelled() {
        return LoadError::Cancelled;
    }
    LoadError::Toolchain {
        unit: key.to_string(),
        message: format!("analysis panicked: {}", err),
    }
}

impl UnitLoader {
    pub fn new(
        overlay: Arc<OverlayStore>,
        toolchain: Arc<dyn Toolchain>,
        resolver: Arc<ImportResolver>,
        units: Arc<UnitCache<CompilationUnit>>,
        summaries: Arc<UnitCache<PackageSummary>>,
    ) -> Self {
        Self {
            overlay,
            toolchain,
            resolver,
            units,
            summaries,
        }
    }

    pub fn overlay(&self) -> &Arc<OverlayStore> {
        &self.overlay
    }

    pub fn toolchain(&self) -> &Arc<dyn Toolchain> {
        &self.toolchain
    }

    pub fn resolver(&self) -> &Arc<ImportResolver> {
        &self.resolver
    }

    pub fn units(&self) -> &Arc<UnitCache<CompilationUnit>> {
        &self.units
    }

    pub fn summaries(&self) -> &Arc<UnitCache<PackageSummary>> {
        &self.summaries
    }

    pub fn build_fingerprint(&self) -> u64 {
        self.resolver.build().fingerprint()
    }

    /// Synchronous directory scan; prefer [`UnitLoader::scan`] from async code.
    pub fn scan_blocking(&self, dir: &Path) -> Result<DirScan, LoadError> {
        DirScan::read(dir, &self.overlay, self.resolver.build(), self.toolchain.as_ref())
    }

    pub async fn scan(&self, dir: &Path) -> Result<DirScan, LoadError> {
        let loader = self.clone();
        let dir = dir.to_path_buf();
        let key_dir = dir.clone();
        tokio::task::spawn_blocking(move || loader.scan_blocking(&dir))
            .await
            .map_err(|e| LoadError::Io {
                path: key_dir,
                message: e.to_string(),
            })?
    }

    /// The unit owning `path`: its directory, narrowed to the package and
    /// variant the file itself declares.
    pub async fn resolve_key(&self, path: &Path) -> Result<UnitKey, LoadError> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if !name.ends_with(".go") {
            return Err(LoadError::NotGoFile {
                path: path.to_path_buf(),
            });
        }
        let dir = path.parent().ok_or_else(|| LoadError::NotGoFile {
            path: path.to_path_buf(),
        })?;
        let scan = self.scan(dir).await?;
        match scan.file(path) {
            Some(file) => Ok(scan.key_for(file)),
            None => {
                // Distinguish a build-excluded file from one without a package clause
                let excluded = match self.overlay.read(path) {
                    Ok(text) => !self.resolver.build().includes(name, &text),
                    Err(e) if e.is_not_found() => {
                        return Err(LoadError::Io {
                            path: path.to_path_buf(),
                            message: e.source.to_string(),
                        })
                    }
                    Err(_) => true,
                };
                if excluded {
                    Err(LoadError::BuildConfigurationExcluded {
                        path: path.to_path_buf(),
                    })
                } else {
                    Err(LoadError::NoBuildableFiles {
                        dir: dir.to_path_buf(),
                    })
                }
            }
        }
    }

    /// Every unit key present in `dir`.
    pub async fn keys_for_dir(&self, dir: &Path) -> Vec<UnitKey> {
        match self.scan(dir).await {
            Ok(scan) => scan.keys(),
            Err(err) => {
                log::debug!("Could not scan {}: {}", dir.display(), err);
                Vec::new()
            }
        }
    }

    pub async fn unit_for_file(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Outcome<CompilationUnit> {
        let key = self.resolve_key(path).await?;
        self.unit(&key, cancel).await
    }

    /// Fully checked unit for `key`, shared with concurrent callers.
    ///
    /// A cached unit checked against an import summary that has since been
    /// invalidated is dropped and loaded again.
    pub async fn unit(&self, key: &UnitKey, cancel: &CancellationToken) -> Outcome<CompilationUnit> {
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let result = self
                .units
                .get_or_load(key, cancel, |generation| self.load_unit(key, generation, cancel))
                .await;
            match result {
                Ok(unit) if !self.summaries_current(&unit.imports) => {
                    self.units.discard(key, &unit);
                    if attempt >= MAX_CHECK_ATTEMPTS {
                        break Err(imports_changed(key));
                    }
                    log::debug!("Imports of {} changed since it was checked, reloading", key);
                }
                result => break result,
            }
        };
        self.units.evict_to_capacity();
        result
    }

    /// Package-level summary for `key`.
    pub async fn summary(&self, key: &UnitKey, cancel: &CancellationToken) -> Outcome<PackageSummary> {
        let result = self
            .summaries
            .get_or_load(key, cancel, |generation| self.load_summary(key, generation, cancel))
            .await;
        self.summaries.evict_to_capacity();
        result
    }

    async fn load_summary(
        &self,
        key: &UnitKey,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<PackageSummary, LoadError> {
        let scan = self.scan(&key.dir).await?;
        let sources = scan.sources_for(key);
        if sources.is_empty() {
            return Err(LoadError::NoBuildableFiles {
                dir: key.dir.clone(),
            });
        }
        let import_path = self.resolver.import_path_for_dir(&key.dir);

        let toolchain = self.toolchain.clone();
        let task_key = key.clone();
        let task_cancel = cancel.clone();
        let summary = tokio::task::spawn_blocking(move || {
            toolchain.summarize(&task_key, import_path.as_deref(), &sources, &task_cancel)
        })
        .await
        .map_err(|e| join_error(key, e))?
        .map_err(|e| toolchain_error(key, e))?;

        crate::perf::record_summary_load();
        Ok(PackageSummary {
            generation,
            ..summary
        })
    }

    /// Where an import of the unit's files points, as a summary key.
    fn import_key(&self, key: &UnitKey, own_import_path: Option<&str>, import_path: &str) -> Option<UnitKey> {
        if key.variant == UnitVariant::XTest && Some(import_path) == own_import_path {
            let scan = self.scan_blocking(&key.dir).ok()?;
            return scan.package_key_for_xtest(&key.package);
        }
        let dir = self.resolver.resolve(import_path, &key.dir)?;
        let scan = self.scan_blocking(&dir).ok()?;
        scan.package_key(Some(&guess_package_name(import_path)))
    }

    async fn import_keys(
        &self,
        key: &UnitKey,
        own_import_path: Option<String>,
        imports: Vec<String>,
    ) -> Result<(HashMap<String, UnitKey>, HashSet<String>), LoadError> {
        let loader = self.clone();
        let key = key.clone();
        let task_key = key.clone();
        tokio::task::spawn_blocking(move || {
            let mut resolved = HashMap::new();
            let mut unresolved = HashSet::new();
            for import_path in imports {
                match loader.import_key(&task_key, own_import_path.as_deref(), &import_path) {
                    Some(import_key) => {
                        resolved.insert(import_path, import_key);
                    }
                    // Standard library packages without a configured GOROOT are not reported
                    None if ImportResolver::is_standard(&import_path)
                        && loader.resolver.build().goroot.is_none() => {}
                    None if import_path == "C" => {}
                    None => {
                        unresolved.insert(import_path);
                    }
                }
            }
            (resolved, unresolved)
        })
        .await
        .map_err(|e| join_error(&key, e))
    }

    /// Load the summaries of every resolved import concurrently. A summary
    /// that fails to load turns its import into an unresolved one.
    async fn import_summaries(
        &self,
        resolved: &HashMap<String, UnitKey>,
        unresolved: &mut HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Arc<PackageSummary>>, LoadError> {
        let mut tasks = JoinSet::new();
        for (import_path, import_key) in resolved {
            let loader = self.clone();
            let import_path = import_path.clone();
            let import_key = import_key.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = loader.summary(&import_key, &cancel).await;
                (import_path, result)
            });
        }

        let mut summaries = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok((import_path, result)) = joined else {
                continue;
            };
            match result {
                Ok(summary) => {
                    summaries.insert(import_path, summary);
                }
                Err(LoadError::Cancelled) => return Err(LoadError::Cancelled),
                Err(err) => {
                    log::debug!("Import {} unavailable: {}", import_path, err);
                    unresolved.insert(import_path);
                }
            }
        }
        Ok(summaries)
    }

    fn summaries_current(&self, summaries: &HashMap<String, Arc<PackageSummary>>) -> bool {
        summaries
            .values()
            .all(|s| self.summaries.generation(&s.key) == s.generation)
    }

    async fn load_unit(
        &self,
        key: &UnitKey,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<CompilationUnit, LoadError> {
        let _timing = crate::perf::TimingGuard::with_threshold(format!("load {}", key), 500);
        let started = Instant::now();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let scan = self.scan(&key.dir).await?;
            let files = scan.files_for(key);
            if files.is_empty() {
                return Err(LoadError::NoBuildableFiles {
                    dir: key.dir.clone(),
                });
            }
            let mut imports: Vec<String> = files.iter().flat_map(|f| f.imports.iter().cloned()).collect();
            imports.sort();
            imports.dedup();
            let sources = scan.sources_for(key);
            let import_path = self.resolver.import_path_for_dir(&key.dir);

            let (resolved, mut unresolved) = self
                .import_keys(key, import_path.clone(), imports)
                .await?;
            let summaries = self
                .import_summaries(&resolved, &mut unresolved, cancel)
                .await?;
            if cancel.is_cancelled() {
                return Err(LoadError::Cancelled);
            }

            let input = CheckInput {
                key: key.clone(),
                import_path: import_path.clone(),
                files: sources,
                imports: summaries.clone(),
                unresolved_imports: unresolved,
            };
            let toolchain = self.toolchain.clone();
            let task_cancel = cancel.clone();
            let checked = tokio::task::spawn_blocking(move || toolchain.check(input, &task_cancel))
                .await
                .map_err(|e| join_error(key, e))?
                .map_err(|e| toolchain_error(key, e))?;

            // An import edited during the check leaves this result stale
            if !self.summaries_current(&summaries) {
                if attempt >= MAX_CHECK_ATTEMPTS {
                    return Err(imports_changed(key));
                }
                log::debug!("Imports of {} changed during check, retrying", key);
                continue;
            }

            crate::perf::record_unit_load(started.elapsed());
            log::trace!(
                "Loaded {} ({} files, {} diagnostics)",
                key,
                checked.files.len(),
                checked.diagnostics.len()
            );
            return Ok(CompilationUnit::new(
                key.clone(),
                generation,
                import_path,
                checked.files,
                checked.symbols,
                checked.diagnostics,
                summaries,
            ));
        }
    }

    pub fn reset(&self) {
        self.units.reset();
        self.summaries.reset();
        self.resolver.invalidate_modules();
    }
}

#[async_trait]
impl UnitSource<CompilationUnit> for UnitLoader {
    async fn load(&self, key: &UnitKey, cancel: &CancellationToken) -> Outcome<CompilationUnit> {
        self.unit(key, cancel).await
    }

    fn cached(&self) -> Vec<(UnitKey, Arc<CompilationUnit>)> {
        self.units.snapshot()
    }
}

#[async_trait]
impl UnitSource<PackageSummary> for UnitLoader {
    async fn load(&self, key: &UnitKey, cancel: &CancellationToken) -> Outcome<PackageSummary> {
        self.summary(key, cancel).await
    }

    fn cached(&self) -> Vec<(UnitKey, Arc<PackageSummary>)> {
        self.summaries.snapshot()
    }
}

/// Invalidates both unit caches whenever an overlay entry changes.
pub struct CacheInvalidator {
    units: Arc<UnitCache<CompilationUnit>>,
    summaries: Arc<UnitCache<PackageSummary>>,
    policy: RwLock<InvalidationPolicy>,
}

impl CacheInvalidator {
    pub fn new(
        units: Arc<UnitCache<CompilationUnit>>,
        summaries: Arc<UnitCache<PackageSummary>>,
        policy: InvalidationPolicy,
    ) -> Self {
        Self {
            units,
            summaries,
            policy: RwLock::new(policy),
        }
    }

    pub fn set_policy(&self, policy: InvalidationPolicy) {
        if let Ok(mut guard) = self.policy.write() {
            *guard = policy;
        }
    }

    pub fn policy(&self) -> InvalidationPolicy {
        self.policy.read().map(|g| *g).unwrap_or_default()
    }

    pub fn invalidate(&self, path: &Path) -> Vec<UnitKey> {
        match self.policy() {
            InvalidationPolicy::File => {
                self.summaries.invalidate(path);
                self.units.invalidate(path)
            }
            InvalidationPolicy::Workspace => {
                let keys = self.units.snapshot().into_iter().map(|(k, _)| k).collect();
                self.units.reset();
                self.summaries.reset();
                keys
            }
        }
    }
}

impl OverlayObserver for CacheInvalidator {
    fn overlay_changed(&self, path: &Path) {
        self.invalidate(path);
    }
}

/// Directories holding Go files among `paths`, deduplicated.
pub fn package_dirs(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = paths
        .iter()
        .filter(|p| p.extension().is_some_and(|e| e == "go"))
        .filter_map(|p| p.parent().map(Path::to_path_buf))
        .collect();
    dirs.sort();
    dirs.dedup();
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildContext;
    use crate::config::BuildOverrides;
    use crate::toolchain::{CheckedPackage, FileHeader, GoToolchain, SourceFile};
    use crate::unit::Resolution;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower_lsp::lsp_types::Position;

    /// Delegates to the Go toolchain and counts full checks.
    #[derive(Default)]
    struct CountingToolchain {
        checks: AtomicUsize,
        summaries: AtomicUsize,
    }

    impl Toolchain for CountingToolchain {
        fn scan_header(&self, source: &str) -> FileHeader {
            GoToolchain.scan_header(source)
        }

        fn summarize(
            &self,
            key: &UnitKey,
            import_path: Option<&str>,
            files: &[SourceFile],
            cancel: &CancellationToken,
        ) -> Result<PackageSummary, ToolchainError> {
            self.summaries.fetch_add(1, Ordering::SeqCst);
            GoToolchain.summarize(key, import_path, files, cancel)
        }

        fn check(
            &self,
            input: CheckInput,
            cancel: &CancellationToken,
        ) -> Result<CheckedPackage, ToolchainError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            GoToolchain.check(input, cancel)
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        loader: UnitLoader,
        toolchain: Arc<CountingToolchain>,
    }

    fn fixture(files: &[(&str, &str)]) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        fs::write(root.join("go.mod"), "module example.com/m\n\ngo 1.21\n").unwrap();
        for (name, text) in files {
            let path = root.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, text).unwrap();
        }
        let build = BuildContext::from_overrides(&BuildOverrides {
            goos: Some("linux".into()),
            goarch: Some("amd64".into()),
            ..Default::default()
        });
        let toolchain = Arc::new(CountingToolchain::default());
        let loader = UnitLoader::new(
            Arc::new(OverlayStore::new()),
            toolchain.clone(),
            Arc::new(ImportResolver::new(Arc::new(build))),
            Arc::new(UnitCache::new("units", 64)),
            Arc::new(UnitCache::new("summaries", 64)),
        );
        Fixture {
            _tmp: tmp,
            root,
            loader,
            toolchain,
        }
    }

    fn pos(text: &str, needle: &str) -> Position {
        let offset = text.find(needle).unwrap();
        let line = text[..offset].matches('\n').count();
        let col = offset - text[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
        Position::new(line as u32, col as u32)
    }

    const A: &str = "package p\n\nfunc A() {}\n";
    const B: &str = "package p\n\nfunc B() { A() }\n";

    #[tokio::test]
    async fn test_concurrent_loads_check_once() {
        let fx = fixture(&[("p/a.go", A), ("p/b.go", B)]);
        let path = fx.root.join("p/b.go");
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let loader = fx.loader.clone();
            let path = path.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loader.unit_for_file(&path, &cancel).await
            }));
        }
        let mut units = Vec::new();
        for handle in handles {
            units.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(fx.toolchain.checks.load(Ordering::SeqCst), 1);
        assert!(units.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_overlay_edit_is_visible_after_invalidation() {
        let fx = fixture(&[("p/a.go", A), ("p/b.go", B)]);
        let a = fx.root.join("p/a.go");
        let b = fx.root.join("p/b.go");
        let invalidator = Arc::new(CacheInvalidator::new(
            fx.loader.units().clone(),
            fx.loader.summaries().clone(),
            InvalidationPolicy::File,
        ));
        fx.loader.overlay().subscribe(invalidator);
        let cancel = CancellationToken::new();

        let unit = fx.loader.unit_for_file(&b, &cancel).await.unwrap();
        let file = unit.file_index(&b).unwrap();
        let reference = unit.symbols.reference_at(file, pos(B, "A()")).unwrap();
        let target = unit.symbols.target_location(&reference.resolution).unwrap();
        assert_eq!(target.path, a);

        fx.loader.overlay().open(&a, "package p\n\nfunc A2() {}\n", 2);
        let unit = fx.loader.unit_for_file(&b, &cancel).await.unwrap();
        let file = unit.file_index(&b).unwrap();
        let reference = unit.symbols.reference_at(file, pos(B, "A()")).unwrap();
        assert_eq!(reference.resolution, Resolution::Unresolved);
        assert_eq!(fx.toolchain.checks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_external_test_unit_narrowed_to_its_files() {
        let xtest = "package p_test\n\nimport \"example.com/m/p\"\n\nfunc Use() { p.A() }\n";
        let fx = fixture(&[("p/a.go", A), ("p/b.go", B), ("p/p_test.go", xtest)]);
        let path = fx.root.join("p/p_test.go");
        let cancel = CancellationToken::new();

        let key = fx.loader.resolve_key(&path).await.unwrap();
        assert_eq!(key.variant, UnitVariant::XTest);
        let unit = fx.loader.unit(&key, &cancel).await.unwrap();
        assert_eq!(unit.files.len(), 1);

        let reference = unit.symbols.reference_at(0, pos(xtest, "A()")).unwrap();
        let target = unit.symbols.target_location(&reference.resolution).unwrap();
        assert_eq!(target.path, fx.root.join("p/a.go"));
        assert!(unit.diagnostics.is_empty(), "{:?}", unit.diagnostics);
    }

    #[tokio::test]
    async fn test_importer_invalidated_by_dependency_edit() {
        let q = "package q\n\nfunc Q() {}\n";
        let user = "package main\n\nimport \"example.com/m/q\"\n\nfunc main() { q.Q() }\n";
        let fx = fixture(&[("q/q.go", q), ("cmd/main.go", user)]);
        let invalidator = Arc::new(CacheInvalidator::new(
            fx.loader.units().clone(),
            fx.loader.summaries().clone(),
            InvalidationPolicy::File,
        ));
        fx.loader.overlay().subscribe(invalidator);
        let cancel = CancellationToken::new();
        let main = fx.root.join("cmd/main.go");

        let unit = fx.loader.unit_for_file(&main, &cancel).await.unwrap();
        assert!(unit.diagnostics.is_empty(), "{:?}", unit.diagnostics);

        fx.loader
            .overlay()
            .open(&fx.root.join("q/q.go"), "package q\n\nfunc R() {}\n", 1);
        let unit = fx.loader.unit_for_file(&main, &cancel).await.unwrap();
        let messages: Vec<_> = unit.diagnostics.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages, vec!["undefined: q.Q"]);
    }

    /// Rewrites `q/q.go` in the overlay while the first `edits` checks of
    /// the importing unit are running.
    struct EditingToolchain {
        overlay: Arc<OverlayStore>,
        target: PathBuf,
        edits: AtomicUsize,
        checks: AtomicUsize,
    }

    impl Toolchain for EditingToolchain {
        fn scan_header(&self, source: &str) -> FileHeader {
            GoToolchain.scan_header(source)
        }

        fn summarize(
            &self,
            key: &UnitKey,
            import_path: Option<&str>,
            files: &[SourceFile],
            cancel: &CancellationToken,
        ) -> Result<PackageSummary, ToolchainError> {
            GoToolchain.summarize(key, import_path, files, cancel)
        }

        fn check(
            &self,
            input: CheckInput,
            cancel: &CancellationToken,
        ) -> Result<CheckedPackage, ToolchainError> {
            let n = self.checks.fetch_add(1, Ordering::SeqCst);
            let checked = GoToolchain.check(input, cancel);
            let pending = self.edits.load(Ordering::SeqCst);
            if pending > 0 {
                self.edits.store(pending - 1, Ordering::SeqCst);
                self.overlay
                    .open(&self.target, "package q\n\nfunc T() {}\n", n as i32 + 1);
            }
            checked
        }
    }

    #[tokio::test]
    async fn test_unit_checked_against_edited_import_is_not_published() {
        let user = "package main\n\nimport \"example.com/m/q\"\n\nfunc main() { q.T() }\n";
        let fx = fixture(&[("q/q.go", "package q\n"), ("cmd/main.go", user)]);
        let overlay = Arc::new(OverlayStore::new());
        let toolchain = Arc::new(EditingToolchain {
            overlay: overlay.clone(),
            target: fx.root.join("q/q.go"),
            edits: AtomicUsize::new(MAX_CHECK_ATTEMPTS),
            checks: AtomicUsize::new(0),
        });
        let build = BuildContext::from_overrides(&BuildOverrides {
            goos: Some("linux".into()),
            goarch: Some("amd64".into()),
            ..Default::default()
        });
        let loader = UnitLoader::new(
            overlay.clone(),
            toolchain.clone(),
            Arc::new(ImportResolver::new(Arc::new(build))),
            Arc::new(UnitCache::new("units", 64)),
            Arc::new(UnitCache::new("summaries", 64)),
        );
        overlay.subscribe(Arc::new(CacheInvalidator::new(
            loader.units().clone(),
            loader.summaries().clone(),
            InvalidationPolicy::File,
        )));
        let cancel = CancellationToken::new();
        let main = fx.root.join("cmd/main.go");

        // Every attempt saw its import change underneath it
        let err = loader.unit_for_file(&main, &cancel).await.unwrap_err();
        assert!(err.retryable(), "{:?}", err);
        assert_eq!(toolchain.checks.load(Ordering::SeqCst), MAX_CHECK_ATTEMPTS);
        assert_eq!(loader.units().ready_count(), 0);

        let unit = loader.unit_for_file(&main, &cancel).await.unwrap();
        assert!(unit.diagnostics.is_empty(), "{:?}", unit.diagnostics);
        assert_eq!(toolchain.checks.load(Ordering::SeqCst), MAX_CHECK_ATTEMPTS + 1);
    }

    #[tokio::test]
    async fn test_cached_unit_with_stale_import_is_reloaded() {
        let q = "package q\n\nfunc Q() {}\n";
        let user = "package main\n\nimport \"example.com/m/q\"\n\nfunc main() { q.Q() }\n";
        let fx = fixture(&[("q/q.go", q), ("cmd/main.go", user)]);
        let cancel = CancellationToken::new();
        let main = fx.root.join("cmd/main.go");

        let first = fx.loader.unit_for_file(&main, &cancel).await.unwrap();
        assert_eq!(fx.toolchain.checks.load(Ordering::SeqCst), 1);

        // Only the summary is invalidated; the unit entry stays ready
        fx.loader.summaries().invalidate(&fx.root.join("q/q.go"));
        assert_eq!(fx.loader.units().ready_count(), 1);

        let second = fx.loader.unit_for_file(&main, &cancel).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(fx.toolchain.checks.load(Ordering::SeqCst), 2);
        let third = fx.loader.unit_for_file(&main, &cancel).await.unwrap();
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[tokio::test]
    async fn test_missing_import_and_excluded_file() {
        let user = "package p\n\nimport \"example.com/m/nothere\"\n\nvar _ = nothere.X\n";
        let fx = fixture(&[("p/p.go", user), ("p/p_windows.go", "package p\n")]);
        let cancel = CancellationToken::new();

        let unit = fx.loader.unit_for_file(&fx.root.join("p/p.go"), &cancel).await.unwrap();
        assert_eq!(unit.diagnostics.len(), 1);
        assert!(unit.diagnostics[0].message.contains("could not import"));

        let err = fx
            .loader
            .resolve_key(&fx.root.join("p/p_windows.go"))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::BuildConfigurationExcluded { .. }));

        let err = fx.loader.resolve_key(&fx.root.join("go.mod")).await.unwrap_err();
        assert!(matches!(err, LoadError::NotGoFile { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_load_is_not_cached() {
        let fx = fixture(&[("p/a.go", A)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fx
            .loader
            .unit_for_file(&fx.root.join("p/a.go"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, LoadError::Cancelled);
        assert_eq!(fx.loader.units().ready_count(), 0);
    }

    #[test]
    fn test_package_dirs() {
        let dirs = package_dirs(&[
            PathBuf::from("/w/a/x.go"),
            PathBuf::from("/w/a/y.go"),
            PathBuf::from("/w/b/go.mod"),
        ]);
        assert_eq!(dirs, vec![PathBuf::from("/w/a")]);
    }
}
