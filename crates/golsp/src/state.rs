//
// state.rs
//
// Per-connection server state shared by every handler
//

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::build::import_resolve::ImportResolver;
use crate::build::BuildContext;
use crate::config::ServerConfig;
use crate::loader::{CacheInvalidator, UnitLoader};
use crate::overlay::OverlayStore;
use crate::revalidation::{DiagnosticsGate, DiagnosticsScheduler};
use crate::toolchain::gofmt::{Formatter, Gofmt};
use crate::toolchain::{GoToolchain, Toolchain};
use crate::unit::{CompilationUnit, PackageSummary, UnitKey};
use crate::unit_cache::UnitCache;
use crate::warmup::{Warmup, WarmupOptions};
use crate::workspace_index::{SearchOptions, WorkspaceIndex};

/// How long shutdown waits for an abandoned warm-up to wind down
const WARMUP_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Everything a connection knows: configuration, open buffers, both unit
/// caches and the workspace index.
///
/// The overlay and the caches live for the whole connection. The loader is
/// rebuilt when the build configuration changes, since its import resolver
/// is tied to one build context.
pub struct ServerState {
    config: RwLock<ServerConfig>,
    overlay: Arc<OverlayStore>,
    toolchain: Arc<dyn Toolchain>,
    units: Arc<UnitCache<CompilationUnit>>,
    summaries: Arc<UnitCache<PackageSummary>>,
    invalidator: Arc<CacheInvalidator>,
    loader: RwLock<UnitLoader>,
    index: Arc<WorkspaceIndex>,
    formatter: RwLock<Arc<dyn Formatter>>,
    warmup: Mutex<Option<Warmup>>,
    pub diagnostics: DiagnosticsScheduler,
    pub diagnostics_gate: DiagnosticsGate,
}

fn make_loader(
    config: &ServerConfig,
    overlay: &Arc<OverlayStore>,
    toolchain: &Arc<dyn Toolchain>,
    units: &Arc<UnitCache<CompilationUnit>>,
    summaries: &Arc<UnitCache<PackageSummary>>,
) -> UnitLoader {
    let build = Arc::new(BuildContext::from_overrides(&config.build));
    log::debug!(
        "Build context {}/{} tags {:?} (fingerprint {:x})",
        build.goos,
        build.goarch,
        build.tags,
        build.fingerprint()
    );
    UnitLoader::new(
        overlay.clone(),
        toolchain.clone(),
        Arc::new(ImportResolver::new(build)),
        units.clone(),
        summaries.clone(),
    )
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_toolchain(config, Arc::new(GoToolchain))
    }

    pub fn with_toolchain(config: ServerConfig, toolchain: Arc<dyn Toolchain>) -> Self {
        let overlay = Arc::new(OverlayStore::new());
        let units = Arc::new(UnitCache::new("units", config.max_cached_units));
        let summaries = Arc::new(UnitCache::new("summaries", config.max_cached_units));
        let invalidator = Arc::new(CacheInvalidator::new(
            units.clone(),
            summaries.clone(),
            config.invalidation,
        ));
        overlay.subscribe(invalidator.clone());
        let loader = make_loader(&config, &overlay, &toolchain, &units, &summaries);
        let formatter: Arc<dyn Formatter> = Arc::new(Gofmt::new(config.gofmt_path.clone()));

        Self {
            config: RwLock::new(config),
            overlay,
            toolchain,
            units,
            summaries,
            invalidator,
            loader: RwLock::new(loader),
            index: Arc::new(WorkspaceIndex::new(None)),
            formatter: RwLock::new(formatter),
            warmup: Mutex::new(None),
            diagnostics: DiagnosticsScheduler::new(),
            diagnostics_gate: DiagnosticsGate::new(),
        }
    }

    pub fn config(&self) -> ServerConfig {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The loader for the current build configuration.
    pub fn loader(&self) -> UnitLoader {
        match self.loader.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn overlay(&self) -> &Arc<OverlayStore> {
        &self.overlay
    }

    pub fn index(&self) -> &Arc<WorkspaceIndex> {
        &self.index
    }

    pub fn formatter(&self) -> Arc<dyn Formatter> {
        match self.formatter.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_formatter(&self, formatter: Arc<dyn Formatter>) {
        if let Ok(mut guard) = self.formatter.write() {
            *guard = formatter;
        }
    }

    pub fn workspace_root(&self) -> Option<PathBuf> {
        self.index.root()
    }

    pub fn set_workspace_root(&self, root: Option<PathBuf>) {
        if let Some(root) = &root {
            log::info!("Workspace root: {}", root.display());
        }
        self.index.set_root(root);
    }

    /// Switch to `config`. Returns whether the build configuration changed,
    /// in which case every cached unit and the import graph were dropped.
    pub fn apply_config(&self, config: ServerConfig) -> bool {
        let previous = self.config();
        let build_changed = previous.build_settings_changed(&config);

        self.invalidator.set_policy(config.invalidation);
        self.units.set_capacity(config.max_cached_units);
        self.summaries.set_capacity(config.max_cached_units);
        if previous.gofmt_path != config.gofmt_path {
            self.set_formatter(Arc::new(Gofmt::new(config.gofmt_path.clone())));
        }
        if build_changed {
            let loader = make_loader(
                &config,
                &self.overlay,
                &self.toolchain,
                &self.units,
                &self.summaries,
            );
            if let Ok(mut guard) = self.loader.write() {
                *guard = loader;
            }
        }
        if let Ok(mut guard) = self.config.write() {
            *guard = config;
        }

        if build_changed {
            log::info!("Build configuration changed, dropping cached units");
            self.reset();
        }
        build_changed
    }

    /// Drop cached analysis for `path` according to the invalidation policy.
    pub fn invalidate(&self, path: &Path) -> Vec<UnitKey> {
        self.overlay.refresh_disk(path);
        self.invalidator.invalidate(path)
    }

    /// Forget every cached unit, summary, module and the import graph.
    pub fn reset(&self) {
        self.cancel_warmup();
        self.loader().reset();
        self.index.reset();
        self.overlay.refresh_all_disk();
    }

    pub fn search_options(&self, limit: usize, cancel: &CancellationToken) -> SearchOptions {
        let config = self.config();
        SearchOptions {
            limit,
            deadline: Instant::now() + Duration::from_millis(config.workspace_search_timeout_ms),
            max_parallel: config.max_parallelism,
            cancel: cancel.clone(),
        }
    }

    /// Start warming the workspace index, replacing any warm-up in progress.
    /// Does nothing without a workspace root or when disabled.
    pub fn start_warmup(&self) -> bool {
        let config = self.config();
        if !config.global_index_enabled || self.workspace_root().is_none() {
            return false;
        }
        let warmup = Warmup::start(
            self.loader(),
            self.index.clone(),
            WarmupOptions {
                max_parallel: config.max_parallelism,
                timeout: Duration::from_millis(config.warmup_timeout_ms),
                check_units: true,
            },
        );
        let previous = match self.warmup.lock() {
            Ok(mut guard) => guard.replace(warmup),
            Err(poisoned) => poisoned.into_inner().replace(warmup),
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
        true
    }

    /// Stop the warm-up, if any, and hand it back so the caller can wait.
    pub fn cancel_warmup(&self) -> Option<Warmup> {
        let warmup = match self.warmup.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(warmup) = &warmup {
            warmup.cancel();
        }
        warmup
    }

    pub fn warmup_running(&self) -> bool {
        self.warmup
            .lock()
            .map(|g| g.as_ref().is_some_and(|w| !w.is_finished()))
            .unwrap_or(false)
    }

    /// Stop background work ahead of exit.
    pub async fn shutdown(&self) {
        self.diagnostics.cancel_all();
        if let Some(warmup) = self.cancel_warmup() {
            if tokio::time::timeout(WARMUP_SHUTDOWN_GRACE, warmup.finish())
                .await
                .is_err()
            {
                log::debug!("Abandoning warm-up at shutdown");
            }
        }
        crate::perf::log_summary("shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildOverrides, InvalidationPolicy};
    use std::fs;

    fn module(files: &[(&str, &str)]) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        fs::write(root.join("go.mod"), "module example.com/s\n").unwrap();
        for (name, text) in files {
            let path = root.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, text).unwrap();
        }
        (tmp, root)
    }

    fn linux() -> ServerConfig {
        ServerConfig {
            build: BuildOverrides {
                goos: Some("linux".into()),
                goarch: Some("amd64".into()),
                ..Default::default()
            },
            global_index_enabled: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_build_change_switches_file_sets() {
        let (_tmp, root) = module(&[
            ("p/p.go", "package p\n\nfunc Common() {}\n"),
            ("p/p_windows.go", "package p\n\nfunc Win() {}\n"),
        ]);
        let state = ServerState::new(linux());
        state.set_workspace_root(Some(root.clone()));
        let cancel = CancellationToken::new();
        let path = root.join("p/p.go");

        let unit = state.loader().unit_for_file(&path, &cancel).await.unwrap();
        assert_eq!(unit.files.len(), 1);

        let mut windows = linux();
        windows.build.goos = Some("windows".into());
        assert!(state.apply_config(windows));
        assert_eq!(state.loader().units().ready_count(), 0);

        let unit = state.loader().unit_for_file(&path, &cancel).await.unwrap();
        assert_eq!(unit.files.len(), 2);
    }

    #[tokio::test]
    async fn test_non_build_change_keeps_cache() {
        let (_tmp, root) = module(&[("p/p.go", "package p\n")]);
        let state = ServerState::new(linux());
        let cancel = CancellationToken::new();
        state
            .loader()
            .unit_for_file(&root.join("p/p.go"), &cancel)
            .await
            .unwrap();

        let mut config = linux();
        config.diagnostics_debounce_ms = 10;
        config.invalidation = InvalidationPolicy::Workspace;
        assert!(!state.apply_config(config));
        assert_eq!(state.loader().units().ready_count(), 1);
    }

    #[tokio::test]
    async fn test_overlay_edits_invalidate_through_state() {
        let (_tmp, root) = module(&[("p/p.go", "package p\n\nfunc A() {}\n")]);
        let state = ServerState::new(linux());
        let cancel = CancellationToken::new();
        let path = root.join("p/p.go");

        let first = state.loader().unit_for_file(&path, &cancel).await.unwrap();
        state.overlay().open(&path, "package p\n\nfunc B() {}\n", 1);
        let second = state.loader().unit_for_file(&path, &cancel).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.symbols.package_scope.contains_key("B"));
    }

    #[tokio::test]
    async fn test_warmup_requires_root_and_flag() {
        let state = ServerState::new(linux());
        assert!(!state.start_warmup());

        let (_tmp, root) = module(&[("p/p.go", "package p\n")]);
        let mut config = linux();
        config.global_index_enabled = true;
        state.apply_config(config);
        state.set_workspace_root(Some(root));
        assert!(state.start_warmup());
        state.shutdown().await;
        assert!(!state.warmup_running());
    }
}
