//
// build/mod.rs
//
// Active build configuration: which Go files belong to a unit
//

pub mod constraint;
pub mod import_resolve;

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use crate::config::BuildOverrides;

pub use import_resolve::ImportResolver;

pub const KNOWN_OS: &[&str] = &[
    "aix", "android", "darwin", "dragonfly", "freebsd", "hurd", "illumos", "ios", "js", "linux",
    "nacl", "netbsd", "openbsd", "plan9", "solaris", "wasip1", "windows", "zos",
];

pub const KNOWN_ARCH: &[&str] = &[
    "386", "amd64", "amd64p32", "arm", "armbe", "arm64", "arm64be", "loong64", "mips", "mipsle",
    "mips64", "mips64le", "mips64p32", "mips64p32le", "ppc", "ppc64", "ppc64le", "riscv",
    "riscv64", "s390", "s390x", "sparc", "sparc64", "wasm",
];

const UNIX_OS: &[&str] = &[
    "aix", "android", "darwin", "dragonfly", "freebsd", "hurd", "illumos", "ios", "linux",
    "netbsd", "openbsd", "solaris",
];

/// Highest `go1.N` release tag considered satisfied
const MAX_GO_MINOR: u32 = 23;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildContext {
    pub goos: String,
    pub goarch: String,
    pub tags: BTreeSet<String>,
    pub cgo_enabled: bool,
    pub goroot: Option<PathBuf>,
    pub gopath: Vec<PathBuf>,
}

fn host_goos() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

fn host_goarch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64",
        "loongarch64" => "loong64",
        other => other,
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl Default for BuildContext {
    fn default() -> Self {
        Self::from_overrides(&BuildOverrides::default())
    }
}

impl BuildContext {
    /// Combine configured overrides with the environment (GOOS, GOARCH,
    /// GOROOT, GOPATH, CGO_ENABLED) and the host platform.
    pub fn from_overrides(overrides: &BuildOverrides) -> Self {
        let goos = overrides
            .goos
            .clone()
            .or_else(|| env_non_empty("GOOS"))
            .unwrap_or_else(|| host_goos().to_string());
        let goarch = overrides
            .goarch
            .clone()
            .or_else(|| env_non_empty("GOARCH"))
            .unwrap_or_else(|| host_goarch().to_string());
        let goroot = overrides
            .goroot
            .clone()
            .or_else(|| env_non_empty("GOROOT").map(PathBuf::from));
        let gopath = if overrides.gopath.is_empty() {
            env_non_empty("GOPATH")
                .map(|v| std::env::split_paths(&v).collect())
                .unwrap_or_default()
        } else {
            overrides.gopath.clone()
        };
        let cgo_enabled = overrides
            .cgo_enabled
            .or_else(|| env_non_empty("CGO_ENABLED").map(|v| v == "1"))
            .unwrap_or(true);

        Self {
            goos,
            goarch,
            tags: overrides.build_tags.iter().cloned().collect(),
            cgo_enabled,
            goroot,
            gopath,
        }
    }

    /// Stable digest used as the configuration part of unit keys.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    /// Whether a single build tag is satisfied.
    pub fn matches_tag(&self, tag: &str) -> bool {
        if tag == self.goos || tag == self.goarch || self.tags.contains(tag) {
            return true;
        }
        match tag {
            "gc" => true,
            "cgo" => self.cgo_enabled,
            "unix" => UNIX_OS.contains(&self.goos.as_str()),
            "linux" => self.goos == "android",
            "solaris" => self.goos == "illumos",
            "darwin" => self.goos == "ios",
            _ => tag
                .strip_prefix("go1.")
                .and_then(|minor| minor.parse::<u32>().ok())
                .map(|minor| minor <= MAX_GO_MINOR)
                .unwrap_or(false),
        }
    }

    /// Apply Go's file name rules: `_`/`.` prefixes are ignored and
    /// `_GOOS`, `_GOARCH`, `_GOOS_GOARCH` suffixes must match.
    pub fn matches_file_name(&self, name: &str) -> bool {
        let Some(stem) = name.strip_suffix(".go") else {
            return false;
        };
        if name.starts_with('_') || name.starts_with('.') {
            return false;
        }
        let stem = stem.strip_suffix("_test").unwrap_or(stem);
        let parts: Vec<&str> = stem.split('_').collect();
        // The first element is the base name and never a constraint
        let n = parts.len();
        if n >= 3 && KNOWN_OS.contains(&parts[n - 2]) && KNOWN_ARCH.contains(&parts[n - 1]) {
            return self.matches_tag(parts[n - 2]) && self.matches_tag(parts[n - 1]);
        }
        if n >= 2 {
            let last = parts[n - 1];
            if KNOWN_OS.contains(&last) || KNOWN_ARCH.contains(&last) {
                return self.matches_tag(last);
            }
        }
        true
    }

    /// Evaluate the header build constraints of `source`. Malformed
    /// constraints exclude the file.
    pub fn matches_content(&self, name: &str, source: &str) -> bool {
        let constraints = constraint::header_constraints(source);
        match constraint::header_satisfied(&constraints, &|tag| self.matches_tag(tag)) {
            Ok(satisfied) => satisfied,
            Err(err) => {
                log::warn!("Ignoring {}: malformed build constraint: {}", name, err);
                false
            }
        }
    }

    pub fn includes(&self, name: &str, source: &str) -> bool {
        self.matches_file_name(name) && self.matches_content(name, source)
    }
}
