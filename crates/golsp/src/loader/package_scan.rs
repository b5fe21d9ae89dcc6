//
// loader/package_scan.rs
//
// Directory listing, build filtering and package variant classification
//

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::build::BuildContext;
use crate::error::LoadError;
use crate::overlay::OverlayStore;
use crate::toolchain::{SourceFile, Toolchain};
use crate::unit::{UnitKey, UnitVariant};

/// A buildable file of a directory, read through the overlay
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub text: Arc<str>,
    pub package: String,
    pub imports: Vec<String>,
    pub is_test: bool,
}

impl ScannedFile {
    /// `package p_test` in a `_test.go` file
    pub fn is_external_test(&self) -> bool {
        self.is_test && self.package.ends_with("_test")
    }

    pub fn variant(&self) -> UnitVariant {
        if self.is_external_test() {
            UnitVariant::XTest
        } else if self.is_test {
            UnitVariant::Test
        } else {
            UnitVariant::Package
        }
    }

    fn source(&self) -> SourceFile {
        SourceFile {
            path: self.path.clone(),
            text: self.text.clone(),
        }
    }
}

pub fn is_test_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with("_test.go"))
        .unwrap_or(false)
}

/// The buildable files of one directory under one build configuration
#[derive(Debug, Clone)]
pub struct DirScan {
    pub dir: PathBuf,
    pub build: u64,
    pub files: Vec<ScannedFile>,
}

impl DirScan {
    /// List `dir` on disk plus open buffers in it, keep files the build
    /// context includes, and read their package clauses.
    pub fn read(
        dir: &Path,
        overlay: &OverlayStore,
        build: &BuildContext,
        toolchain: &dyn Toolchain,
    ) -> Result<Self, LoadError> {
        let mut paths: BTreeSet<PathBuf> = overlay.open_paths_in(dir).into_iter().collect();
        match std::fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
                    if is_file && path.extension().is_some_and(|e| e == "go") {
                        paths.insert(path);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(LoadError::Io {
                    path: dir.to_path_buf(),
                    message: e.to_string(),
                })
            }
        }

        let mut files = Vec::new();
        for path in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !build.matches_file_name(name) {
                continue;
            }
            let text = match overlay.read(&path) {
                Ok(text) => text,
                // Deleted between listing and reading
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    return Err(LoadError::Io {
                        path: path.clone(),
                        message: e.source.to_string(),
                    })
                }
            };
            if !build.matches_content(name, &text) {
                continue;
            }
            let header = toolchain.scan_header(&text);
            let Some(package) = header.package else {
                log::debug!("{} has no package clause", path.display());
                continue;
            };
            files.push(ScannedFile {
                is_test: is_test_file(&path),
                path,
                text,
                package,
                imports: header.imports,
            });
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            build: build.fingerprint(),
            files,
        })
    }

    pub fn file(&self, path: &Path) -> Option<&ScannedFile> {
        self.files.iter().find(|f| f.path == path)
    }

    fn key(&self, package: &str, variant: UnitVariant) -> UnitKey {
        UnitKey {
            dir: self.dir.clone(),
            package: package.to_string(),
            variant,
            build: self.build,
        }
    }

    /// Key of the unit that owns `file`.
    pub fn key_for(&self, file: &ScannedFile) -> UnitKey {
        self.key(&file.package, file.variant())
    }

    /// Every unit present in the directory, sorted.
    pub fn keys(&self) -> Vec<UnitKey> {
        let keys: BTreeSet<UnitKey> = self
            .files
            .iter()
            .map(|f| self.key_for(f))
            .collect();
        keys.into_iter().collect()
    }

    /// The importable package of the directory. With several non-test
    /// packages present, `preferred` (the name an importer expects) wins,
    /// then the lexically first.
    pub fn package_key(&self, preferred: Option<&str>) -> Option<UnitKey> {
        let packages: BTreeSet<&str> = self
            .files
            .iter()
            .filter(|f| !f.is_test)
            .map(|f| f.package.as_str())
            .collect();
        let package = preferred
            .filter(|p| packages.contains(p))
            .or_else(|| packages.iter().next().copied())?;
        Some(self.key(package, UnitVariant::Package))
    }

    /// The package as seen by its external tests: with in-package test files
    /// when there are any.
    pub fn package_key_for_xtest(&self, xtest_package: &str) -> Option<UnitKey> {
        let base = xtest_package.strip_suffix("_test")?;
        let has_tests = self
            .files
            .iter()
            .any(|f| f.is_test && !f.is_external_test() && f.package == base);
        if has_tests {
            Some(self.key(base, UnitVariant::Test))
        } else {
            self.package_key(Some(base))
        }
    }

    /// Files belonging to `key`, in path order.
    pub fn files_for(&self, key: &UnitKey) -> Vec<&ScannedFile> {
        self.files
            .iter()
            .filter(|f| match key.variant {
                UnitVariant::Package => !f.is_test && f.package == key.package,
                UnitVariant::Test => !f.is_external_test() && f.package == key.package,
                UnitVariant::XTest => f.is_external_test() && f.package == key.package,
            })
            .collect()
    }

    pub fn sources_for(&self, key: &UnitKey) -> Vec<SourceFile> {
        self.files_for(key).into_iter().map(ScannedFile::source).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildOverrides;
    use crate::toolchain::GoToolchain;
    use std::fs;

    fn linux() -> BuildContext {
        BuildContext::from_overrides(&BuildOverrides {
            goos: Some("linux".into()),
            goarch: Some("amd64".into()),
            ..Default::default()
        })
    }

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_variants_in_mixed_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        write(dir, "p.go", "package p\n");
        write(dir, "p_internal_test.go", "package p\n");
        write(dir, "p_test.go", "package p_test\n\nimport \"example.com/m/p\"\n");
        write(dir, "p_windows.go", "package p\n");
        write(dir, "README.md", "not go");

        let overlay = OverlayStore::new();
        let scan = DirScan::read(dir, &overlay, &linux(), &GoToolchain).unwrap();
        assert_eq!(scan.files.len(), 3);

        let keys = scan.keys();
        let variants: Vec<_> = keys.iter().map(|k| (k.package.as_str(), k.variant)).collect();
        assert_eq!(
            variants,
            vec![
                ("p", UnitVariant::Package),
                ("p", UnitVariant::Test),
                ("p_test", UnitVariant::XTest)
            ]
        );

        let xtest = &keys[2];
        let names: Vec<_> = scan
            .files_for(xtest)
            .iter()
            .map(|f| f.path.file_name().unwrap().to_owned())
            .collect();
        assert_eq!(names, vec!["p_test.go"]);
        assert_eq!(scan.files_for(&keys[1]).len(), 2);
        assert_eq!(scan.package_key_for_xtest("p_test"), Some(keys[1].clone()));
    }

    #[test]
    fn test_overlay_only_file_is_listed() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = OverlayStore::new();
        let path = tmp.path().join("new.go");
        overlay.open(&path, "package fresh\n", 1);

        let scan = DirScan::read(tmp.path(), &overlay, &linux(), &GoToolchain).unwrap();
        assert_eq!(scan.files.len(), 1);
        assert_eq!(scan.package_key(None).map(|k| k.package), Some("fresh".to_string()));
    }

    #[test]
    fn test_build_constraint_excludes_file() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.go", "//go:build windows\n\npackage p\n");
        let overlay = OverlayStore::new();
        let scan = DirScan::read(tmp.path(), &overlay, &linux(), &GoToolchain).unwrap();
        assert!(scan.keys().is_empty());
    }
}
