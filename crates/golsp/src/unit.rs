//
// unit.rs
//
// Compilation units, package summaries and their symbol tables
//

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tower_lsp::lsp_types::{Position, Range};
use tree_sitter::Tree;

use crate::utf16::LineIndex;

/// Which of the (up to three) packages in a directory a unit covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitVariant {
    /// Non-test files of the package
    Package,
    /// The package plus its in-package `_test.go` files
    Test,
    /// `package p_test` files only
    XTest,
}

/// Identity of a unit: directory, package name, variant and build
/// configuration fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitKey {
    pub dir: PathBuf,
    pub package: String,
    pub variant: UnitVariant,
    pub build: u64,
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match self.variant {
            UnitVariant::Package => "",
            UnitVariant::Test => " [test]",
            UnitVariant::XTest => " [xtest]",
        };
        write!(f, "{} ({}){}", self.package, self.dir.display(), variant)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolLocation {
    pub path: PathBuf,
    pub range: Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeclKind {
    Func,
    Method,
    Type,
    Var,
    Const,
    Field,
    /// Function parameter, result or receiver
    Param,
    TypeParam,
    Label,
}

/// Byte span of a file in which a local declaration is visible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeSpan {
    pub file: usize,
    pub start: usize,
    pub end: usize,
}

pub type DeclId = usize;

#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub name: String,
    pub kind: DeclKind,
    /// Range of the declaring identifier
    pub location: SymbolLocation,
    /// Range of the whole declaration, used for document symbols
    pub full_range: Range,
    /// Receiver base type for methods, struct or interface for fields
    pub container: Option<String>,
    pub package_level: bool,
    pub signature: String,
    pub doc: Option<String>,
    /// Parameter texts for functions and methods
    pub params: Vec<String>,
    /// Base type name of a variable or parameter when written explicitly
    pub type_hint: Option<String>,
    /// Set for function-local declarations
    pub scope: Option<ScopeSpan>,
}

impl Declaration {
    pub fn exported(&self) -> bool {
        is_exported(&self.name)
    }
}

pub fn is_exported(name: &str) -> bool {
    name.chars().next().map(char::is_uppercase).unwrap_or(false)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Declared in this unit
    Local(DeclId),
    /// Member of an imported package
    Imported {
        import_path: String,
        name: String,
        /// Type the member belongs to, for fields and methods
        container: Option<String>,
        location: Option<SymbolLocation>,
    },
    /// The name of an imported package; `location` is its package clause
    Package {
        import_path: String,
        location: Option<SymbolLocation>,
    },
    /// Predeclared identifier
    Builtin,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub file: usize,
    pub range: Range,
    pub start_byte: usize,
    pub end_byte: usize,
    pub name: String,
    pub resolution: Resolution,
    /// The identifier is the declaring occurrence
    pub is_declaration: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportDecl {
    pub file: usize,
    pub path: String,
    /// Name the file refers to the package by (`.` and `_` included)
    pub local_name: String,
    /// The import spec names the package explicitly
    pub aliased: bool,
    pub range: Range,
    pub resolved: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    pub decls: Vec<Declaration>,
    /// Sorted by (file, start_byte)
    pub references: Vec<Reference>,
    pub imports: Vec<ImportDecl>,
    pub package_scope: HashMap<String, DeclId>,
}

impl SymbolTable {
    pub fn decl(&self, id: DeclId) -> Option<&Declaration> {
        self.decls.get(id)
    }

    /// The identifier covering `position` in `file`; both ends inclusive so
    /// a cursor just after a name still hits it.
    pub fn reference_at(&self, file: usize, position: Position) -> Option<&Reference> {
        let start = self.references.partition_point(|r| r.file < file);
        self.references[start..]
            .iter()
            .take_while(|r| r.file == file && r.range.start <= position)
            .filter(|r| r.range.end >= position)
            .last()
    }

    pub fn references_in(&self, file: usize) -> impl Iterator<Item = &Reference> {
        self.references.iter().filter(move |r| r.file == file)
    }

    /// Declaration site a resolution points at, if known.
    pub fn target_location(&self, resolution: &Resolution) -> Option<SymbolLocation> {
        match resolution {
            Resolution::Local(id) => self.decl(*id).map(|d| d.location.clone()),
            Resolution::Imported { location, .. } | Resolution::Package { location, .. } => {
                location.clone()
            }
            _ => None,
        }
    }

    /// Members (fields and methods) declared on type `container`.
    pub fn members_of<'a>(&'a self, container: &'a str) -> impl Iterator<Item = (DeclId, &'a Declaration)> {
        self.decls
            .iter()
            .enumerate()
            .filter(move |(_, d)| d.container.as_deref() == Some(container))
    }
}

pub struct ParsedFile {
    pub path: PathBuf,
    pub text: Arc<str>,
    pub tree: Option<Tree>,
    pub line_index: LineIndex,
    pub package_name: String,
    pub is_test: bool,
}

impl fmt::Debug for ParsedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedFile")
            .field("path", &self.path)
            .field("package_name", &self.package_name)
            .field("has_tree", &self.tree.is_some())
            .finish()
    }
}

impl ParsedFile {
    pub fn offset_at(&self, position: Position) -> Option<usize> {
        self.line_index.offset(&self.text, position)
    }

    pub fn position_at(&self, offset: usize) -> Position {
        self.line_index.position(&self.text, offset)
    }

    pub fn range_of(&self, start: usize, end: usize) -> Range {
        self.line_index.range(&self.text, start, end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Parse,
    Type,
    Import,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDiagnostic {
    pub path: PathBuf,
    pub range: Range,
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub message: String,
}

/// Cache entries expose the files they were built from and the keys they
/// depend on, for invalidation.
pub trait CachedUnit: Send + Sync + 'static {
    fn file_paths(&self) -> &[PathBuf];
    fn dependencies(&self) -> &[UnitKey];
}

/// A fully checked package. Replaced wholesale on reload, never mutated.
#[derive(Debug)]
pub struct CompilationUnit {
    pub key: UnitKey,
    pub generation: u64,
    pub import_path: Option<String>,
    pub files: Vec<ParsedFile>,
    pub symbols: SymbolTable,
    pub diagnostics: Vec<UnitDiagnostic>,
    /// Summaries the unit was checked against, by import path
    pub imports: HashMap<String, Arc<PackageSummary>>,
    dependencies: Vec<UnitKey>,
    file_paths: Vec<PathBuf>,
}

impl CompilationUnit {
    pub fn new(
        key: UnitKey,
        generation: u64,
        import_path: Option<String>,
        files: Vec<ParsedFile>,
        symbols: SymbolTable,
        mut diagnostics: Vec<UnitDiagnostic>,
        imports: HashMap<String, Arc<PackageSummary>>,
    ) -> Self {
        diagnostics.sort_by(|a, b| a.severity.cmp(&b.severity));
        let file_paths = files.iter().map(|f| f.path.clone()).collect();
        let mut dependencies: Vec<UnitKey> = imports.values().map(|s| s.key.clone()).collect();
        dependencies.sort();
        dependencies.dedup();
        Self {
            key,
            generation,
            import_path,
            files,
            symbols,
            diagnostics,
            imports,
            dependencies,
            file_paths,
        }
    }

    pub fn file_index(&self, path: &Path) -> Option<usize> {
        self.files.iter().position(|f| f.path == path)
    }

    pub fn file(&self, path: &Path) -> Option<&ParsedFile> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn diagnostics_for<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = &'a UnitDiagnostic> {
        self.diagnostics.iter().filter(move |d| d.path == path)
    }

    /// Diagnostics of one severity; the list is kept ordered by severity.
    pub fn diagnostics_with(&self, severity: Severity) -> &[UnitDiagnostic] {
        let start = self.diagnostics.partition_point(|d| d.severity < severity);
        let end = self.diagnostics.partition_point(|d| d.severity <= severity);
        &self.diagnostics[start..end]
    }
}

impl CachedUnit for CompilationUnit {
    fn file_paths(&self) -> &[PathBuf] {
        &self.file_paths
    }

    fn dependencies(&self) -> &[UnitKey] {
        &self.dependencies
    }
}

/// Package-level view of a package used to resolve references from its
/// importers. Built from syntax alone, so it never depends on other units.
#[derive(Debug, Clone)]
pub struct PackageSummary {
    pub key: UnitKey,
    pub generation: u64,
    pub name: String,
    pub import_path: Option<String>,
    pub package_clause: Option<SymbolLocation>,
    pub members: HashMap<String, Declaration>,
    /// Methods and struct fields, tagged with their container type
    pub type_members: Vec<Declaration>,
    pub file_paths: Vec<PathBuf>,
}

impl PackageSummary {
    pub fn member(&self, name: &str) -> Option<&Declaration> {
        self.members.get(name)
    }

    pub fn exported_members(&self) -> impl Iterator<Item = &Declaration> {
        self.members.values().filter(|d| d.exported())
    }

    pub fn type_member(&self, container: &str, name: &str) -> Option<&Declaration> {
        self.type_members
            .iter()
            .find(|d| d.name == name && d.container.as_deref() == Some(container))
    }
}

impl CachedUnit for PackageSummary {
    fn file_paths(&self) -> &[PathBuf] {
        &self.file_paths
    }

    fn dependencies(&self) -> &[UnitKey] {
        &[]
    }
}
