//! Temporary Go workspaces for tests and benchmarks.
//!
//! `FixtureWorkspace` writes a module with hand-written files; `generate`
//! builds a deterministic synthetic module of a given size.

use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tower_lsp::lsp_types::{Position, Url};

pub const FIXTURE_MODULE: &str = "example.com/w";

/// A module rooted in a temporary directory, removed on drop.
pub struct FixtureWorkspace {
    _dir: TempDir,
    root: PathBuf,
}

impl FixtureWorkspace {
    /// Empty module with a `go.mod` declaring [`FIXTURE_MODULE`].
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        // macOS hands out /var paths that canonicalize to /private/var
        let root = dir.path().canonicalize().expect("canonicalize temp dir");
        fs::write(root.join("go.mod"), format!("module {}\n\ngo 1.21\n", FIXTURE_MODULE))
            .expect("write go.mod");
        Self { _dir: dir, root }
    }

    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let workspace = Self::new();
        for (relative, text) in files {
            workspace.write(relative, text);
        }
        workspace
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn uri(&self, relative: &str) -> Url {
        Url::from_file_path(self.path(relative)).expect("absolute fixture path")
    }

    /// Write `text` to `relative`, creating directories as needed.
    pub fn write(&self, relative: &str, text: &str) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create fixture dir");
        }
        fs::write(&path, text).expect("write fixture file");
        path
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.path(relative)).expect("read fixture file")
    }
}

impl Default for FixtureWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of the first occurrence of `needle` in `text`. ASCII only.
pub fn position_of(text: &str, needle: &str) -> Position {
    let offset = text
        .find(needle)
        .unwrap_or_else(|| panic!("{:?} not found in fixture text", needle));
    let before = &text[..offset];
    let line = before.matches('\n').count() as u32;
    let column = before.rfind('\n').map(|nl| offset - nl - 1).unwrap_or(offset) as u32;
    Position::new(line, column)
}

/// Shape of a generated workspace.
#[derive(Debug, Clone)]
pub struct FixtureConfig {
    pub packages: usize,
    pub files_per_package: usize,
    pub functions_per_file: usize,
}

impl FixtureConfig {
    pub fn small() -> Self {
        Self {
            packages: 5,
            files_per_package: 2,
            functions_per_file: 5,
        }
    }

    pub fn medium() -> Self {
        Self {
            packages: 25,
            files_per_package: 4,
            functions_per_file: 10,
        }
    }
}

/// Package directory name for package `index`.
pub fn package_name(index: usize) -> String {
    format!("pkg{:03}", index)
}

/// Generate one file. Package `i` imports package `i - 1` and calls its
/// first function, so the workspace forms an import chain.
fn generate_file(package: usize, file: usize, config: &FixtureConfig) -> String {
    let name = package_name(package);
    let mut out = String::new();
    let _ = writeln!(out, "package {}\n", name);
    let imports_previous = package > 0 && file == 0;
    if imports_previous {
        let _ = writeln!(out, "import \"{}/{}\"\n", FIXTURE_MODULE, package_name(package - 1));
    }
    for f in 0..config.functions_per_file {
        let _ = writeln!(out, "// F{}x{} is generated.", file, f);
        let _ = writeln!(out, "func F{}x{}(n int) int {{", file, f);
        let _ = writeln!(out, "\ttotal := n");
        if imports_previous && f == 0 {
            let _ = writeln!(
                out,
                "\ttotal += {}.F0x0(n)",
                package_name(package - 1)
            );
        }
        let _ = writeln!(out, "\treturn total * {}", f + 1);
        let _ = writeln!(out, "}}\n");
    }
    out
}

/// Build a workspace with `config.packages` packages.
pub fn generate(config: &FixtureConfig) -> FixtureWorkspace {
    let workspace = FixtureWorkspace::new();
    for package in 0..config.packages {
        for file in 0..config.files_per_package {
            let relative = format!("{}/f{}.go", package_name(package), file);
            workspace.write(&relative, &generate_file(package, file, config));
        }
    }
    workspace
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_of() {
        let text = "package a\n\nfunc A() {}\n";
        assert_eq!(position_of(text, "A()"), Position::new(2, 5));
        assert_eq!(position_of(text, "package"), Position::new(0, 0));
    }

    #[test]
    fn test_generated_workspace_is_an_import_chain() {
        let workspace = generate(&FixtureConfig::small());
        let first = workspace.read("pkg000/f0.go");
        assert!(!first.contains("import"));
        let second = workspace.read("pkg001/f0.go");
        assert!(second.contains("import \"example.com/w/pkg000\""));
        assert!(second.contains("pkg000.F0x0(n)"));
        assert!(workspace.path("pkg004/f1.go").exists());
    }
}
