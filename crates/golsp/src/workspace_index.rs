//
// workspace_index.rs
//
// Workspace import graph and streaming searches across units
//

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rayon::prelude::*;
use tokio::sync::{mpsc, OnceCell, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::loader::UnitLoader;
use crate::unit::UnitKey;
use crate::unit_cache::Outcome;

/// Directory names never descended into
const SKIPPED_DIRS: &[&str] = &["testdata", "node_modules", "vendor"];

/// Matches queued between the producer and a slow consumer
const SEARCH_CHANNEL_CAPACITY: usize = 64;

/// Where searches get units from: a cache snapshot first, then loads.
#[async_trait]
pub trait UnitSource<V>: Send + Sync {
    async fn load(&self, key: &UnitKey, cancel: &CancellationToken) -> Outcome<V>;

    /// Ready entries, without loading anything
    fn cached(&self) -> Vec<(UnitKey, Arc<V>)>;
}

// ============================================================================
// Import graph
// ============================================================================

/// Directory-level import edges of the workspace, built by scanning file
/// headers. Best effort: an edge added after the build is missed until the
/// next rebuild.
#[derive(Debug, Default)]
pub struct ImportGraph {
    dirs: Vec<PathBuf>,
    imports: HashMap<PathBuf, BTreeSet<PathBuf>>,
    importers: HashMap<PathBuf, BTreeSet<PathBuf>>,
}

fn skip_dir(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_') || SKIPPED_DIRS.contains(&name)
}

/// Go files under `root`, grouped by directory.
pub fn go_files_by_dir(root: &Path) -> BTreeMap<PathBuf, Vec<PathBuf>> {
    let mut by_dir: BTreeMap<PathBuf, Vec<PathBuf>> = BTreeMap::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !entry.file_type().is_dir()
            || !entry.file_name().to_str().map(skip_dir).unwrap_or(true)
    });
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "go") {
            if let Some(dir) = path.parent() {
                by_dir.entry(dir.to_path_buf()).or_default().push(path.to_path_buf());
            }
        }
    }
    by_dir
}

impl ImportGraph {
    /// Walk `root` and resolve every buildable file's imports to directories.
    pub fn build(root: &Path, loader: &UnitLoader) -> Self {
        let _timing = crate::perf::TimingGuard::with_threshold("import graph build", 2000);
        let by_dir = go_files_by_dir(root);
        let build = loader.resolver().build();

        let edges: Vec<(PathBuf, Vec<PathBuf>)> = by_dir
            .par_iter()
            .map(|(dir, files)| {
                let mut targets = BTreeSet::new();
                for path in files {
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    let Ok(text) = loader.overlay().read(path) else {
                        continue;
                    };
                    if !build.includes(name, &text) {
                        continue;
                    }
                    for import in loader.toolchain().scan_header(&text).imports {
                        if let Some(target) = loader.resolver().resolve(&import, dir) {
                            if &target != dir {
                                targets.insert(target);
                            }
                        }
                    }
                }
                (dir.clone(), targets.into_iter().collect())
            })
            .collect();

        let mut graph = ImportGraph {
            dirs: by_dir.into_keys().collect(),
            ..Default::default()
        };
        for (dir, targets) in edges {
            for target in &targets {
                graph
                    .importers
                    .entry(target.clone())
                    .or_default()
                    .insert(dir.clone());
            }
            graph.imports.insert(dir, targets.into_iter().collect());
        }
        log::info!(
            "Import graph: {} package directories, {} edges",
            graph.dirs.len(),
            graph.imports.values().map(BTreeSet::len).sum::<usize>()
        );
        graph
    }

    /// Directories containing Go files, sorted.
    pub fn package_dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn imports_of(&self, dir: &Path) -> Vec<PathBuf> {
        self.imports
            .get(dir)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Directories that import `dir` directly.
    pub fn importers(&self, dir: &Path) -> Vec<PathBuf> {
        self.importers
            .get(dir)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Directories that import `dir` directly or indirectly.
    pub fn transitive_importers(&self, dir: &Path) -> Vec<PathBuf> {
        let mut visited: HashSet<&Path> = HashSet::new();
        let mut queue: VecDeque<&Path> = VecDeque::from([dir]);
        let mut found = Vec::new();
        while let Some(current) = queue.pop_front() {
            let Some(importers) = self.importers.get(current) else {
                continue;
            };
            for importer in importers {
                if visited.insert(importer.as_path()) {
                    found.push(importer.clone());
                    queue.push_back(importer.as_path());
                }
            }
        }
        found.sort();
        found
    }
}

/// Lazily built, process-wide view of the workspace.
pub struct WorkspaceIndex {
    root: RwLock<Option<PathBuf>>,
    graph: RwLock<Arc<OnceCell<Arc<ImportGraph>>>>,
}

impl WorkspaceIndex {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root: RwLock::new(root),
            graph: RwLock::new(Arc::new(OnceCell::new())),
        }
    }

    pub fn root(&self) -> Option<PathBuf> {
        self.root.read().ok().and_then(|g| g.clone())
    }

    pub fn set_root(&self, root: Option<PathBuf>) {
        if let Ok(mut guard) = self.root.write() {
            *guard = root;
        }
        self.reset();
    }

    fn cell(&self) -> Arc<OnceCell<Arc<ImportGraph>>> {
        match self.graph.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The import graph, built on first use. Concurrent callers share one
    /// build.
    pub async fn graph(&self, loader: &UnitLoader) -> Arc<ImportGraph> {
        let cell = self.cell();
        let root = self.root();
        cell.get_or_init(|| async move {
            let Some(root) = root else {
                return Arc::new(ImportGraph::default());
            };
            let loader = loader.clone();
            match tokio::task::spawn_blocking(move || ImportGraph::build(&root, &loader)).await {
                Ok(graph) => Arc::new(graph),
                Err(err) => {
                    log::error!("Import graph build failed: {}", err);
                    Arc::new(ImportGraph::default())
                }
            }
        })
        .await
        .clone()
    }

    /// The graph if it has been built already.
    pub fn graph_if_built(&self) -> Option<Arc<ImportGraph>> {
        self.cell().get().cloned()
    }

    /// Forget the graph; the next query rebuilds it. Builds already running
    /// publish into the discarded cell.
    pub fn reset(&self) {
        if let Ok(mut guard) = self.graph.write() {
            *guard = Arc::new(OnceCell::new());
        }
    }

    /// Unit keys of every package directory in the workspace.
    pub async fn all_keys(&self, loader: &UnitLoader) -> Vec<UnitKey> {
        let graph = self.graph(loader).await;
        keys_for_dirs(loader, graph.package_dirs()).await
    }
}

/// Unit keys of `dirs`, scanned concurrently.
pub async fn keys_for_dirs(loader: &UnitLoader, dirs: &[PathBuf]) -> Vec<UnitKey> {
    let mut tasks = JoinSet::new();
    for dir in dirs {
        let loader = loader.clone();
        let dir = dir.clone();
        tasks.spawn(async move { loader.keys_for_dir(&dir).await });
    }
    let mut keys = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(found) = joined {
            keys.extend(found);
        }
    }
    keys.sort();
    keys
}

// ============================================================================
// Streaming search
// ============================================================================

pub type Visitor<V, M> = Arc<dyn Fn(&UnitKey, &V) -> Vec<M> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Maximum matches delivered to the consumer
    pub limit: usize,
    /// Absolute time at which the producer stops
    pub deadline: Instant,
    pub max_parallel: usize,
    /// Request token; cancelling it stops the search
    pub cancel: CancellationToken,
}

/// Consumer side of a search. Dropping it stops the producer.
pub struct SearchStream<M> {
    rx: mpsc::Receiver<Vec<M>>,
    stop: CancellationToken,
    timed_out: Arc<AtomicBool>,
    remaining: usize,
    truncated: bool,
}

impl<M> SearchStream<M> {
    /// The next batch of matches (one unit's worth), or `None` when the
    /// search is complete, stopped or out of budget.
    pub async fn next_batch(&mut self) -> Option<Vec<M>> {
        if self.remaining == 0 {
            return None;
        }
        let mut batch = self.rx.recv().await?;
        if batch.len() >= self.remaining {
            if batch.len() > self.remaining {
                self.truncated = true;
            }
            batch.truncate(self.remaining);
            self.remaining = 0;
            self.truncated = true;
            self.stop.cancel();
        } else {
            self.remaining -= batch.len();
        }
        Some(batch)
    }

    /// Drain every remaining batch.
    pub async fn collect(mut self) -> SearchResults<M> {
        let mut matches = Vec::new();
        while let Some(batch) = self.next_batch().await {
            matches.extend(batch);
        }
        SearchResults {
            matches,
            truncated: self.truncated,
            timed_out: self.timed_out(),
        }
    }

    /// The limit was reached, so more matches may exist.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }
}

impl<M> Drop for SearchStream<M> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[derive(Debug)]
pub struct SearchResults<M> {
    pub matches: Vec<M>,
    pub truncated: bool,
    pub timed_out: bool,
}

/// Visit every unit in `keys`: ready cached units first, then loads of the
/// rest with at most `max_parallel` in flight. Matches stream back in
/// unspecified order.
pub fn search<V, M>(
    source: Arc<dyn UnitSource<V>>,
    keys: Vec<UnitKey>,
    visit: Visitor<V, M>,
    options: SearchOptions,
) -> SearchStream<M>
where
    V: Send + Sync + 'static,
    M: Send + 'static,
{
    let (tx, rx) = mpsc::channel(SEARCH_CHANNEL_CAPACITY);
    let stop = options.cancel.child_token();
    let timed_out = Arc::new(AtomicBool::new(false));

    tokio::spawn(produce(
        source,
        keys,
        visit,
        options.clone(),
        tx,
        stop.clone(),
        timed_out.clone(),
    ));

    SearchStream {
        rx,
        stop,
        timed_out,
        remaining: options.limit,
        truncated: false,
    }
}

async fn produce<V, M>(
    source: Arc<dyn UnitSource<V>>,
    keys: Vec<UnitKey>,
    visit: Visitor<V, M>,
    options: SearchOptions,
    tx: mpsc::Sender<Vec<M>>,
    stop: CancellationToken,
    timed_out: Arc<AtomicBool>,
) where
    V: Send + Sync + 'static,
    M: Send + 'static,
{
    let _timing = crate::perf::TimingGuard::new(format!("search over {} units", keys.len()));
    let in_scope: HashSet<&UnitKey> = keys.iter().collect();
    let mut visited: HashSet<UnitKey> = HashSet::new();

    for (key, unit) in source.cached() {
        if stop.is_cancelled() {
            return;
        }
        if !in_scope.contains(&key) {
            continue;
        }
        let matches = visit(&key, &unit);
        visited.insert(key);
        if !matches.is_empty() && tx.send(matches).await.is_err() {
            return;
        }
    }

    let permits = Arc::new(Semaphore::new(options.max_parallel.max(1)));
    let mut tasks = JoinSet::new();
    for key in keys.into_iter().filter(|k| !visited.contains(k)) {
        let source = source.clone();
        let visit = visit.clone();
        let permits = permits.clone();
        let tx = tx.clone();
        let stop = stop.clone();
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if stop.is_cancelled() {
                return;
            }
            match source.load(&key, &stop).await {
                Ok(unit) => {
                    let matches = visit(&key, &unit);
                    if !matches.is_empty() {
                        let _ = tx.send(matches).await;
                    }
                }
                Err(err) => log::trace!("search skipped {}: {}", key, err),
            }
        });
    }
    drop(tx);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                log::trace!("search stopped with {} loads pending", tasks.len());
                tasks.abort_all();
                break;
            }
            _ = tokio::time::sleep_until(options.deadline) => {
                log::debug!("search timed out with {} loads pending", tasks.len());
                timed_out.store(true, Ordering::SeqCst);
                stop.cancel();
                tasks.abort_all();
                break;
            }
            joined = tasks.join_next() => {
                if joined.is_none() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FakeSource {
        cached: Vec<(UnitKey, Arc<u32>)>,
        loads: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl UnitSource<u32> for FakeSource {
        async fn load(&self, key: &UnitKey, cancel: &CancellationToken) -> Outcome<u32> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = cancel.cancelled() => Err(LoadError::Cancelled),
                _ = tokio::time::sleep(self.delay) => Ok(Arc::new(key.package.len() as u32)),
            }
        }

        fn cached(&self) -> Vec<(UnitKey, Arc<u32>)> {
            self.cached.clone()
        }
    }

    fn key(name: &str) -> UnitKey {
        UnitKey {
            dir: PathBuf::from("/w").join(name),
            package: name.to_string(),
            variant: crate::unit::UnitVariant::Package,
            build: 0,
        }
    }

    fn options(limit: usize, timeout: Duration) -> SearchOptions {
        SearchOptions {
            limit,
            deadline: Instant::now() + timeout,
            max_parallel: 2,
            cancel: CancellationToken::new(),
        }
    }

    fn echo() -> Visitor<u32, String> {
        Arc::new(|key: &UnitKey, _: &u32| vec![key.package.clone()])
    }

    #[tokio::test]
    async fn test_cached_units_are_not_reloaded() {
        let source = Arc::new(FakeSource {
            cached: vec![(key("a"), Arc::new(1)), (key("zz"), Arc::new(2))],
            loads: AtomicUsize::new(0),
            delay: Duration::from_millis(1),
        });
        let keys = vec![key("a"), key("b"), key("c")];
        let results = search(source.clone() as Arc<dyn UnitSource<u32>>, keys, echo(), options(100, Duration::from_secs(5)))
            .collect()
            .await;

        let mut found = results.matches;
        found.sort();
        assert_eq!(found, vec!["a", "b", "c"]);
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
        assert!(!results.truncated);
        assert!(!results.timed_out);
    }

    #[tokio::test]
    async fn test_limit_truncates_and_stops_producer() {
        let source = Arc::new(FakeSource {
            cached: Vec::new(),
            loads: AtomicUsize::new(0),
            delay: Duration::from_millis(5),
        });
        let keys: Vec<_> = (0..50).map(|i| key(&format!("p{}", i))).collect();
        let results = search(source.clone() as Arc<dyn UnitSource<u32>>, keys, echo(), options(3, Duration::from_secs(5)))
            .collect()
            .await;
        assert_eq!(results.matches.len(), 3);
        assert!(results.truncated);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(source.loads.load(Ordering::SeqCst) < 50);
    }

    #[tokio::test]
    async fn test_deadline_returns_partial_results() {
        let source = Arc::new(FakeSource {
            cached: vec![(key("fast"), Arc::new(1))],
            loads: AtomicUsize::new(0),
            delay: Duration::from_secs(30),
        });
        let results = search(
            source as Arc<dyn UnitSource<u32>>,
            vec![key("fast"), key("slow")],
            echo(),
            options(10, Duration::from_millis(50)),
        )
        .collect()
        .await;
        assert_eq!(results.matches, vec!["fast"]);
        assert!(results.timed_out);
    }

    #[tokio::test]
    async fn test_request_cancellation_ends_stream() {
        let source = Arc::new(FakeSource {
            cached: Vec::new(),
            loads: AtomicUsize::new(0),
            delay: Duration::from_secs(30),
        });
        let opts = options(10, Duration::from_secs(60));
        let cancel = opts.cancel.clone();
        let mut stream = search(source as Arc<dyn UnitSource<u32>>, vec![key("a")], echo(), opts);
        cancel.cancel();
        assert!(stream.next_batch().await.is_none());
    }

    #[test]
    fn test_graph_walk_skips_hidden_and_testdata() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        for dir in ["a", "a/b", ".git", "testdata", "a/vendor/x"] {
            std::fs::create_dir_all(root.join(dir)).unwrap();
            std::fs::write(root.join(dir).join("f.go"), "package x\n").unwrap();
        }
        let dirs: Vec<_> = go_files_by_dir(root).into_keys().collect();
        assert_eq!(dirs, vec![root.join("a"), root.join("a/b")]);
    }

    #[test]
    fn test_transitive_importers_visit_each_once() {
        let mut graph = ImportGraph::default();
        let edge = |g: &mut ImportGraph, from: &str, to: &str| {
            g.importers
                .entry(PathBuf::from(to))
                .or_default()
                .insert(PathBuf::from(from));
        };
        edge(&mut graph, "/b", "/a");
        edge(&mut graph, "/c", "/a");
        edge(&mut graph, "/c", "/b");
        edge(&mut graph, "/d", "/c");
        assert_eq!(graph.importers(Path::new("/a")), vec![PathBuf::from("/b"), PathBuf::from("/c")]);
        assert_eq!(
            graph.transitive_importers(Path::new("/a")),
            vec![PathBuf::from("/b"), PathBuf::from("/c"), PathBuf::from("/d")]
        );
    }
}
