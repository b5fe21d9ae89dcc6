//
// config.rs
//
// Server configuration parsed from initializationOptions and settings
//

use std::path::PathBuf;

use serde_json::Value;

/// When diagnostics are computed and pushed to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiagnosticsMode {
    #[default]
    OnChange,
    OnSave,
    Off,
}

/// How much cached analysis an edit throws away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidationPolicy {
    /// Units containing the file, units of its directory, and their dependents
    #[default]
    File,
    /// Every cached unit and summary
    Workspace,
}

/// Build configuration overrides. `None` means "use the environment".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOverrides {
    pub goos: Option<String>,
    pub goarch: Option<String>,
    pub build_tags: Vec<String>,
    pub goroot: Option<PathBuf>,
    pub gopath: Vec<PathBuf>,
    pub go_binary: Option<PathBuf>,
    pub cgo_enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub build: BuildOverrides,
    /// Warm the workspace index in the background after `initialized`
    pub global_index_enabled: bool,
    /// Maximum concurrent background loads
    pub max_parallelism: usize,
    pub diagnostics_mode: DiagnosticsMode,
    pub invalidation: InvalidationPolicy,
    pub diagnostics_debounce_ms: u64,
    pub workspace_search_timeout_ms: u64,
    pub warmup_timeout_ms: u64,
    /// Best-effort cap on ready entries per unit cache
    pub max_cached_units: usize,
    pub max_references: usize,
    pub max_workspace_symbols: usize,
    pub gofmt_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            build: BuildOverrides::default(),
            global_index_enabled: true,
            max_parallelism: default_parallelism(),
            diagnostics_mode: DiagnosticsMode::OnChange,
            invalidation: InvalidationPolicy::File,
            diagnostics_debounce_ms: 200,
            workspace_search_timeout_ms: 10_000,
            warmup_timeout_ms: 60_000,
            max_cached_units: 512,
            max_references: 1000,
            max_workspace_symbols: 256,
            gofmt_path: None,
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 8)
}

impl ServerConfig {
    /// Whether switching from `self` to `other` changes which files belong
    /// to which unit.
    pub fn build_settings_changed(&self, other: &Self) -> bool {
        self.build != other.build
    }

    pub fn log_effective(&self) {
        log::info!("Configuration:");
        log::info!("  goos: {:?}", self.build.goos);
        log::info!("  goarch: {:?}", self.build.goarch);
        log::info!("  buildTags: {:?}", self.build.build_tags);
        log::info!("  goroot: {:?}", self.build.goroot);
        log::info!("  gopath: {:?}", self.build.gopath);
        log::info!("  globalIndexEnabled: {}", self.global_index_enabled);
        log::info!("  maxParallelism: {}", self.max_parallelism);
        log::info!("  diagnosticsMode: {:?}", self.diagnostics_mode);
        log::info!("  invalidation: {:?}", self.invalidation);
        log::info!("  maxCachedUnits: {}", self.max_cached_units);
        log::info!(
            "  workspaceSearchTimeoutMs: {}",
            self.workspace_search_timeout_ms
        );
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect(),
        ),
        // "integration,linux" is accepted as well
        Value::String(s) => Some(
            s.split([',', ' '])
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

fn non_empty_path(value: &Value) -> Option<PathBuf> {
    value
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}

/// Apply recognised keys from `settings` on top of `base`. Unknown keys and
/// values of the wrong type are ignored.
pub fn parse_server_config(settings: &Value, base: &ServerConfig) -> ServerConfig {
    let mut config = base.clone();
    // Settings may arrive wrapped in a `golsp` section
    let settings = settings.get("golsp").unwrap_or(settings);
    if !settings.is_object() {
        return config;
    }

    if let Some(v) = settings.get("goos").and_then(|v| v.as_str()) {
        config.build.goos = Some(v.to_string());
    }
    if let Some(v) = settings.get("goarch").and_then(|v| v.as_str()) {
        config.build.goarch = Some(v.to_string());
    }
    if let Some(v) = settings.get("buildTags").and_then(string_list) {
        config.build.build_tags = v;
    }
    if let Some(v) = settings.get("goroot").and_then(non_empty_path) {
        config.build.goroot = Some(v);
    }
    if let Some(v) = settings.get("gopath") {
        let entries = match v {
            Value::String(s) => std::env::split_paths(s).collect(),
            other => string_list(other)
                .unwrap_or_default()
                .into_iter()
                .map(PathBuf::from)
                .collect(),
        };
        config.build.gopath = entries;
    }
    if let Some(v) = settings.get("goBinary").and_then(non_empty_path) {
        config.build.go_binary = Some(v);
    }
    if let Some(v) = settings.get("cgoEnabled").and_then(|v| v.as_bool()) {
        config.build.cgo_enabled = Some(v);
    }
    if let Some(v) = settings.get("globalIndexEnabled").and_then(|v| v.as_bool()) {
        config.global_index_enabled = v;
    }
    if let Some(v) = settings.get("maxParallelism").and_then(|v| v.as_u64()) {
        config.max_parallelism = (v as usize).max(1);
    }
    if let Some(v) = settings.get("diagnosticsMode").and_then(|v| v.as_str()) {
        match v {
            "onChange" => config.diagnostics_mode = DiagnosticsMode::OnChange,
            "onSave" => config.diagnostics_mode = DiagnosticsMode::OnSave,
            "off" => config.diagnostics_mode = DiagnosticsMode::Off,
            other => log::warn!("Ignoring unknown diagnosticsMode {:?}", other),
        }
    }
    if let Some(v) = settings.get("invalidation").and_then(|v| v.as_str()) {
        match v {
            "file" => config.invalidation = InvalidationPolicy::File,
            "workspace" => config.invalidation = InvalidationPolicy::Workspace,
            other => log::warn!("Ignoring unknown invalidation {:?}", other),
        }
    }
    if let Some(v) = settings.get("diagnosticsDebounceMs").and_then(|v| v.as_u64()) {
        config.diagnostics_debounce_ms = v;
    }
    if let Some(v) = settings
        .get("workspaceSearchTimeoutMs")
        .and_then(|v| v.as_u64())
    {
        config.workspace_search_timeout_ms = v;
    }
    if let Some(v) = settings.get("warmupTimeoutMs").and_then(|v| v.as_u64()) {
        config.warmup_timeout_ms = v;
    }
    if let Some(v) = settings.get("maxCachedUnits").and_then(|v| v.as_u64()) {
        config.max_cached_units = (v as usize).max(1);
    }
    if let Some(v) = settings.get("maxReferences").and_then(|v| v.as_u64()) {
        config.max_references = v as usize;
    }
    if let Some(v) = settings.get("maxWorkspaceSymbols").and_then(|v| v.as_u64()) {
        config.max_workspace_symbols = v as usize;
    }
    if let Some(v) = settings.get("gofmtPath").and_then(non_empty_path) {
        config.gofmt_path = Some(v);
    }

    config
}
