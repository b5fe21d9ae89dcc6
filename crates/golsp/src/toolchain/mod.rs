//
// toolchain/mod.rs
//
// Semantic analysis collaborator used by the loader
//

pub mod go;
pub mod gofmt;
pub mod universe;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::unit::{PackageSummary, ParsedFile, SymbolTable, UnitDiagnostic, UnitKey};

pub use go::GoToolchain;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolchainError {
    #[error("analysis cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

/// One source file as read through the overlay
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub text: Arc<str>,
}

/// Package clause and imports of a file, read without analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileHeader {
    pub package: Option<String>,
    pub imports: Vec<String>,
}

pub struct CheckInput {
    pub key: UnitKey,
    pub import_path: Option<String>,
    pub files: Vec<SourceFile>,
    /// Summaries of resolved imports, by import path
    pub imports: HashMap<String, Arc<PackageSummary>>,
    /// Imports to report as unresolvable
    pub unresolved_imports: HashSet<String>,
}

pub struct CheckedPackage {
    pub files: Vec<ParsedFile>,
    pub symbols: SymbolTable,
    pub diagnostics: Vec<UnitDiagnostic>,
}

/// Given a unit's files (already narrowed to one variant) and the summaries
/// of its imports, produce syntax, symbols and diagnostics. Calls are
/// synchronous and may be slow; the loader runs them on the blocking pool.
pub trait Toolchain: Send + Sync {
    fn scan_header(&self, source: &str) -> FileHeader;

    /// Package-level declarations only; never looks at other packages.
    fn summarize(
        &self,
        key: &UnitKey,
        import_path: Option<&str>,
        files: &[SourceFile],
        cancel: &CancellationToken,
    ) -> Result<PackageSummary, ToolchainError>;

    fn check(
        &self,
        input: CheckInput,
        cancel: &CancellationToken,
    ) -> Result<CheckedPackage, ToolchainError>;
}
