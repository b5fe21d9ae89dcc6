//
// build/import_resolve.rs
//
// Mapping Go import paths to directories and back
//

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

use regex::Regex;

use super::BuildContext;

/// A parsed `go.mod`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub root: PathBuf,
    pub path: String,
    /// Local `replace` directives: module path -> directory
    pub replaces: Vec<(String, PathBuf)>,
}

struct GoModPatterns {
    module: Regex,
    replace: Regex,
}

fn patterns() -> &'static GoModPatterns {
    static PATTERNS: OnceLock<GoModPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| GoModPatterns {
        module: Regex::new(r#"^module\s+"?([^"\s]+)"?"#).unwrap(),
        // `old [version] => new [version]`, with or without the `replace` keyword
        replace: Regex::new(r#"^(?:replace\s+)?"?([^"\s]+)"?(?:\s+\S+)?\s*=>\s*"?([^"\s]+)"?"#).unwrap(),
    })
}

fn is_local_target(target: &str) -> bool {
    target.starts_with("./") || target.starts_with("../") || Path::new(target).is_absolute()
}

/// Lexically normalise `..` and `.` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Parse the contents of a `go.mod` located in `root`.
pub fn parse_go_mod(root: &Path, content: &str) -> Option<ModuleInfo> {
    let patterns = patterns();
    let mut module_path = None;
    let mut replaces = Vec::new();
    let mut in_replace_block = false;

    for line in content.lines() {
        let line = line.split("//").next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if in_replace_block {
            if line == ")" {
                in_replace_block = false;
                continue;
            }
        } else if line.starts_with("replace (") || line == "replace(" {
            in_replace_block = true;
            continue;
        } else if let Some(caps) = patterns.module.captures(line) {
            module_path = Some(caps[1].to_string());
            continue;
        } else if !line.starts_with("replace") {
            continue;
        }

        if let Some(caps) = patterns.replace.captures(line) {
            let target = &caps[2];
            if is_local_target(target) {
                replaces.push((caps[1].to_string(), normalize(&root.join(target))));
            }
        }
    }

    Some(ModuleInfo {
        root: root.to_path_buf(),
        path: module_path?,
        replaces,
    })
}

/// Strip `prefix` from an import path at a path-element boundary.
fn strip_import_prefix<'a>(import_path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = import_path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

fn join_import(base: &Path, rest: &str) -> PathBuf {
    rest.split('/')
        .filter(|s| !s.is_empty())
        .fold(base.to_path_buf(), |acc, part| acc.join(part))
}

fn relative_import(base: &Path, dir: &Path) -> Option<String> {
    let rel = dir.strip_prefix(base).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Resolves import paths relative to the module containing the importer,
/// then vendor, GOROOT and GOPATH.
pub struct ImportResolver {
    build: Arc<BuildContext>,
    modules: RwLock<HashMap<PathBuf, Option<Arc<ModuleInfo>>>>,
}

impl ImportResolver {
    pub fn new(build: Arc<BuildContext>) -> Self {
        Self {
            build,
            modules: RwLock::new(HashMap::new()),
        }
    }

    pub fn build(&self) -> &BuildContext {
        &self.build
    }

    /// The module whose `go.mod` is nearest above `dir`.
    pub fn module_for(&self, dir: &Path) -> Option<Arc<ModuleInfo>> {
        if let Ok(guard) = self.modules.read() {
            if let Some(cached) = guard.get(dir) {
                return cached.clone();
            }
        }

        let found = dir.ancestors().find_map(|candidate| {
            let go_mod = candidate.join("go.mod");
            let content = std::fs::read_to_string(&go_mod).ok()?;
            match parse_go_mod(candidate, &content) {
                Some(info) => Some(Arc::new(info)),
                None => {
                    log::warn!("{} has no module directive", go_mod.display());
                    None
                }
            }
        });

        if let Ok(mut guard) = self.modules.write() {
            guard.insert(dir.to_path_buf(), found.clone());
        }
        found
    }

    /// Forget cached `go.mod` lookups.
    pub fn invalidate_modules(&self) {
        if let Ok(mut guard) = self.modules.write() {
            guard.clear();
        }
    }

    /// Directory holding the package `import_path` as seen from `from_dir`.
    pub fn resolve(&self, import_path: &str, from_dir: &Path) -> Option<PathBuf> {
        if import_path == "C" || import_path.is_empty() {
            return None;
        }

        let mut candidates = Vec::new();
        if let Some(module) = self.module_for(from_dir) {
            if let Some(rest) = strip_import_prefix(import_path, &module.path) {
                candidates.push(join_import(&module.root, rest));
            }
            for (old, target) in &module.replaces {
                if let Some(rest) = strip_import_prefix(import_path, old) {
                    candidates.push(join_import(target, rest));
                }
            }
            candidates.push(join_import(&module.root.join("vendor"), import_path));
        }
        if let Some(goroot) = &self.build.goroot {
            candidates.push(join_import(&goroot.join("src"), import_path));
        }
        for gopath in &self.build.gopath {
            candidates.push(join_import(&gopath.join("src"), import_path));
        }

        let resolved = candidates.into_iter().find(|c| c.is_dir());
        if resolved.is_none() {
            log::trace!(
                "Unresolved import {:?} from {}",
                import_path,
                from_dir.display()
            );
        }
        resolved
    }

    /// Import path of the package in `dir`, if it lies inside a module,
    /// GOROOT or GOPATH.
    pub fn import_path_for_dir(&self, dir: &Path) -> Option<String> {
        if let Some(module) = self.module_for(dir) {
            if let Some(rel) = relative_import(&module.root, dir) {
                return Some(if rel.is_empty() {
                    module.path.clone()
                } else {
                    format!("{}/{}", module.path, rel)
                });
            }
        }
        if let Some(goroot) = &self.build.goroot {
            if let Some(rel) = relative_import(&goroot.join("src"), dir) {
                return Some(rel);
            }
        }
        self.build
            .gopath
            .iter()
            .find_map(|gopath| relative_import(&gopath.join("src"), dir))
    }

    /// Whether an import path names a standard library package (no dot in
    /// its first element).
    pub fn is_standard(import_path: &str) -> bool {
        import_path
            .split('/')
            .next()
            .map(|first| !first.contains('.'))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_go_mod() {
        let content = r#"
module example.com/m // main module

go 1.21

require example.com/dep v1.2.3

replace example.com/dep => ../dep

replace (
    example.com/other v1.0.0 => ./third_party/other
    example.com/remote => example.com/fork v1.0.0
)
"#;
        let info = parse_go_mod(Path::new("/w/m"), content).unwrap();
        assert_eq!(info.path, "example.com/m");
        assert_eq!(
            info.replaces,
            vec![
                ("example.com/dep".to_string(), PathBuf::from("/w/dep")),
                (
                    "example.com/other".to_string(),
                    PathBuf::from("/w/m/third_party/other")
                ),
            ]
        );
    }

    #[test]
    fn test_parse_go_mod_without_module() {
        assert!(parse_go_mod(Path::new("/w"), "go 1.21\n").is_none());
    }

    #[test]
    fn test_resolve_within_module_and_back() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("go.mod"), "module example.com/m\n").unwrap();
        fs::create_dir_all(root.join("internal/util")).unwrap();
        fs::create_dir_all(root.join("cmd")).unwrap();

        let resolver = ImportResolver::new(Arc::new(BuildContext::default()));
        let from = root.join("cmd");
        assert_eq!(
            resolver.resolve("example.com/m/internal/util", &from),
            Some(root.join("internal/util"))
        );
        assert_eq!(resolver.resolve("example.com/m", &from), Some(root.to_path_buf()));
        assert_eq!(resolver.resolve("example.com/mx", &from), None);
        assert_eq!(resolver.resolve("C", &from), None);

        assert_eq!(
            resolver.import_path_for_dir(&root.join("internal/util")).as_deref(),
            Some("example.com/m/internal/util")
        );
        assert_eq!(
            resolver.import_path_for_dir(root).as_deref(),
            Some("example.com/m")
        );
    }

    #[test]
    fn test_resolve_gopath_and_goroot() {
        let dir = tempfile::tempdir().unwrap();
        let goroot = dir.path().join("goroot");
        let gopath = dir.path().join("gopath");
        fs::create_dir_all(goroot.join("src/fmt")).unwrap();
        fs::create_dir_all(gopath.join("src/github.com/x/y")).unwrap();
        let build = BuildContext {
            goroot: Some(goroot.clone()),
            gopath: vec![gopath.clone()],
            ..BuildContext::default()
        };
        let resolver = ImportResolver::new(Arc::new(build));
        let from = dir.path().join("elsewhere");
        assert_eq!(resolver.resolve("fmt", &from), Some(goroot.join("src/fmt")));
        assert_eq!(
            resolver.resolve("github.com/x/y", &from),
            Some(gopath.join("src/github.com/x/y"))
        );
        assert_eq!(
            resolver.import_path_for_dir(&gopath.join("src/github.com/x/y")).as_deref(),
            Some("github.com/x/y")
        );
    }

    #[test]
    fn test_is_standard() {
        assert!(ImportResolver::is_standard("fmt"));
        assert!(ImportResolver::is_standard("net/http"));
        assert!(!ImportResolver::is_standard("example.com/m"));
    }
}
