//
// handlers.rs
//
// Feature handlers: thin consumers of the unit loader and workspace index
//

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashSet;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::notification::Notification;
use tower_lsp::lsp_types::*;
use tree_sitter::Node;
use url::Url;

use crate::error::{LspError, LspResult};
use crate::loader::{package_dirs, UnitLoader};
use crate::state::ServerState;
use crate::toolchain::go::guess_package_name;
use crate::toolchain::universe::{self, BuiltinKind};
use crate::unit::{
    is_exported, CompilationUnit, DeclId, DeclKind, Declaration, PackageSummary, ParsedFile,
    Reference, Resolution, Severity, SymbolLocation, UnitDiagnostic, UnitKey, UnitVariant,
};
use crate::utf16::LineIndex;
use crate::workspace_index::{keys_for_dirs, search, UnitSource, Visitor};

pub fn uri_to_path(uri: &Url) -> Option<PathBuf> {
    uri.to_file_path().ok()
}

pub fn path_to_uri(path: &Path) -> Option<Url> {
    Url::from_file_path(path).ok()
}

fn to_location(location: &SymbolLocation) -> Option<Location> {
    Some(Location::new(path_to_uri(&location.path)?, location.range))
}

/// Hashable identity of a location, used to dedupe matches across batches
type LocationKey = (String, u32, u32, u32, u32);

fn location_key(location: &Location) -> LocationKey {
    let Range { start, end } = location.range;
    (
        location.uri.to_string(),
        start.line,
        start.character,
        end.line,
        end.character,
    )
}

fn no_information(path: &Path, position: Position) -> LspError {
    LspError::InvalidPosition {
        path: path.to_path_buf(),
        position,
    }
}

/// The unit a document belongs to and the document's index in it.
struct FileContext {
    unit: Arc<CompilationUnit>,
    file: usize,
    path: PathBuf,
}

impl FileContext {
    async fn load(state: &ServerState, uri: &Url, cancel: &CancellationToken) -> LspResult<Self> {
        let path = uri_to_path(uri)
            .ok_or_else(|| LspError::InvalidParams(format!("not a file URI: {}", uri)))?;
        let unit = state.loader().unit_for_file(&path, cancel).await?;
        let file = unit
            .file_index(&path)
            .ok_or_else(|| LspError::BuildConfigurationExcluded { path: path.clone() })?;
        Ok(Self { unit, file, path })
    }

    fn parsed(&self) -> &ParsedFile {
        &self.unit.files[self.file]
    }

    fn reference_at(&self, position: Position) -> LspResult<&Reference> {
        self.unit
            .symbols
            .reference_at(self.file, position)
            .ok_or_else(|| no_information(&self.path, position))
    }

    fn offset_at(&self, position: Position) -> LspResult<usize> {
        self.parsed()
            .offset_at(position)
            .ok_or_else(|| no_information(&self.path, position))
    }
}

/// Declaration of an imported member as recorded in the unit's summaries.
fn imported_decl<'a>(
    unit: &'a CompilationUnit,
    import_path: &str,
    name: &str,
    container: Option<&str>,
) -> Option<&'a Declaration> {
    let summary = unit.imports.get(import_path)?;
    match container {
        Some(container) => summary.type_member(container, name),
        None => summary.member(name),
    }
}

fn imported_package_name(unit: &CompilationUnit, import_path: &str) -> String {
    unit.imports
        .get(import_path)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| guess_package_name(import_path))
}

/// Identifier used to match a package across units: its import path, or its
/// directory outside any module.
pub fn package_id(unit: &CompilationUnit) -> String {
    unit.import_path
        .clone()
        .unwrap_or_else(|| unit.key.dir.display().to_string())
}

// ============================================================================
// Hover
// ============================================================================

fn describe(decl: &Declaration) -> String {
    let mut value = format!("```go\n{}\n```", decl.signature);
    if let Some(doc) = decl.doc.as_deref().filter(|d| !d.is_empty()) {
        value.push_str("\n\n");
        value.push_str(doc);
    }
    value
}

pub async fn hover(
    state: &ServerState,
    uri: &Url,
    position: Position,
    cancel: &CancellationToken,
) -> LspResult<Option<Hover>> {
    let ctx = FileContext::load(state, uri, cancel).await?;
    let reference = ctx.reference_at(position)?;
    let unit = &ctx.unit;

    let value = match &reference.resolution {
        Resolution::Local(id) => unit.symbols.decl(*id).map(describe),
        Resolution::Imported {
            import_path,
            name,
            container,
            ..
        } => imported_decl(unit, import_path, name, container.as_deref()).map(describe),
        Resolution::Package { import_path, .. } => Some(format!(
            "```go\npackage {}\n```\n\n`\"{}\"`",
            imported_package_name(unit, import_path),
            import_path
        )),
        Resolution::Builtin => universe::lookup(&reference.name)
            .map(|b| format!("```go\n{}\n```\n\nPredeclared identifier.", b.signature)),
        Resolution::Unresolved => None,
    };
    let value = value.ok_or_else(|| no_information(&ctx.path, position))?;

    Ok(Some(Hover {
        contents: HoverContents::Markup(MarkupContent {
            kind: MarkupKind::Markdown,
            value,
        }),
        range: Some(reference.range),
    }))
}

// ============================================================================
// Goto Definition
// ============================================================================

/// Location of the declaration the identifier at `position` resolves to. An
/// imported package name resolves to that package's package clause.
pub async fn goto_definition(
    state: &ServerState,
    uri: &Url,
    position: Position,
    cancel: &CancellationToken,
) -> LspResult<Option<GotoDefinitionResponse>> {
    let ctx = FileContext::load(state, uri, cancel).await?;
    let reference = ctx.reference_at(position)?;
    let location = ctx
        .unit
        .symbols
        .target_location(&reference.resolution)
        .and_then(|l| to_location(&l))
        .ok_or_else(|| no_information(&ctx.path, position))?;
    Ok(Some(GotoDefinitionResponse::Scalar(location)))
}

// ============================================================================
// References
// ============================================================================

/// A package-level declaration, named the way importers see it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolDescriptor {
    /// Import path of the declaring package
    pub package: String,
    pub name: String,
    /// Type the member belongs to, for fields and methods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceHints {
    /// Directories to search instead of the importers from the import graph
    #[serde(default)]
    pub dirs: Option<Vec<PathBuf>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceReferencesParams {
    pub query: SymbolDescriptor,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub hints: Option<ReferenceHints>,
    #[serde(default)]
    pub partial_result_token: Option<ProgressToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceReference {
    pub reference: Location,
    pub symbol: SymbolDescriptor,
}

/// `$/partialResult` notification carrying one batch of a streamed result
pub enum PartialResult {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResultParams {
    pub token: ProgressToken,
    pub value: serde_json::Value,
}

impl Notification for PartialResult {
    type Params = PartialResultParams;
    const METHOD: &'static str = "$/partialResult";
}

fn matches_query(
    unit: &CompilationUnit,
    reference: &Reference,
    query: &SymbolDescriptor,
    own_package: bool,
) -> bool {
    if reference.name != query.name {
        return false;
    }
    match &reference.resolution {
        Resolution::Local(id) => {
            own_package
                && unit
                    .symbols
                    .decl(*id)
                    .is_some_and(|d| d.package_level && d.container == query.container)
        }
        Resolution::Imported {
            import_path,
            name,
            container,
            ..
        } => *import_path == query.package && *name == query.name && *container == query.container,
        _ => false,
    }
}

/// Visitor yielding every reference to `query` in a unit. Locations already
/// produced by another unit (a file shared by a package and its test
/// variant) are skipped.
fn reference_visitor(
    query: SymbolDescriptor,
    include_declaration: bool,
) -> Visitor<CompilationUnit, WorkspaceReference> {
    let seen: Arc<DashSet<LocationKey>> = Arc::new(DashSet::new());
    Arc::new(move |_key: &UnitKey, unit: &CompilationUnit| {
        let own_package = unit.key.variant != UnitVariant::XTest && package_id(unit) == query.package;
        unit.symbols
            .references
            .iter()
            .filter(|r| include_declaration || !r.is_declaration)
            .filter(|r| matches_query(unit, r, &query, own_package))
            .filter_map(|r| {
                let file = unit.files.get(r.file)?;
                Some(Location::new(path_to_uri(&file.path)?, r.range))
            })
            .filter(|location| seen.insert(location_key(location)))
            .map(|reference| WorkspaceReference {
                reference,
                symbol: query.clone(),
            })
            .collect()
    })
}

/// Directory holding the package `import_path`, if it can be found.
fn package_dir(state: &ServerState, loader: &UnitLoader, import_path: &str) -> Option<PathBuf> {
    let path = Path::new(import_path);
    if path.is_absolute() {
        return Some(path.to_path_buf());
    }
    let from = state.workspace_root().or_else(|| {
        package_dirs(&state.overlay().open_paths())
            .into_iter()
            .next()
    })?;
    loader.resolver().resolve(import_path, &from)
}

/// Units that may reference `query`: the defining directory, plus its direct
/// importers when the name is exported. `hints.dirs` replaces the importers.
async fn reference_scope(
    state: &ServerState,
    loader: &UnitLoader,
    query: &SymbolDescriptor,
    defining_dir: Option<&Path>,
    hints: Option<&ReferenceHints>,
) -> Vec<UnitKey> {
    let mut dirs = match hints.and_then(|h| h.dirs.clone()) {
        Some(dirs) => dirs,
        None if is_exported(&query.name) => match defining_dir {
            Some(dir) => state.index().graph(loader).await.importers(dir),
            None => Vec::new(),
        },
        None => Vec::new(),
    };
    if let Some(dir) = defining_dir {
        if !dirs.iter().any(|d| d == dir) {
            dirs.insert(0, dir.to_path_buf());
        }
    }
    log::trace!(
        "Reference scope for {}.{}: {} directories",
        query.package,
        query.name,
        dirs.len()
    );
    keys_for_dirs(loader, &dirs).await
}

/// Stream references to `query` in batches, handing each batch to
/// `on_batch` as it arrives. Returns every reference found.
async fn stream_references<F, Fut>(
    state: &ServerState,
    query: SymbolDescriptor,
    defining_dir: Option<&Path>,
    hints: Option<&ReferenceHints>,
    include_declaration: bool,
    limit: usize,
    cancel: &CancellationToken,
    mut on_batch: F,
) -> LspResult<Vec<WorkspaceReference>>
where
    F: FnMut(Vec<WorkspaceReference>) -> Fut,
    Fut: Future<Output = ()>,
{
    let loader = state.loader();
    let keys = reference_scope(state, &loader, &query, defining_dir, hints).await;
    let source: Arc<dyn UnitSource<CompilationUnit>> = Arc::new(loader);
    let visit = reference_visitor(query, include_declaration);
    let mut stream = search(source, keys, visit, state.search_options(limit, cancel));

    let mut found = Vec::new();
    while let Some(batch) = stream.next_batch().await {
        on_batch(batch.clone()).await;
        found.extend(batch);
    }
    if cancel.is_cancelled() {
        return Err(LspError::Cancelled);
    }
    if stream.timed_out() {
        log::warn!("Reference search timed out after {} matches", found.len());
    } else if stream.truncated() {
        log::debug!("Reference search stopped at {} matches", limit);
    }
    Ok(found)
}

fn local_references(unit: &CompilationUnit, id: DeclId, include_declaration: bool) -> Vec<Location> {
    unit.symbols
        .references
        .iter()
        .filter(|r| r.resolution == Resolution::Local(id))
        .filter(|r| include_declaration || !r.is_declaration)
        .filter_map(|r| {
            let file = unit.files.get(r.file)?;
            Some(Location::new(path_to_uri(&file.path)?, r.range))
        })
        .collect()
}

fn sort_locations(locations: &mut [Location]) {
    locations.sort_by(|a, b| {
        a.uri
            .as_str()
            .cmp(b.uri.as_str())
            .then_with(|| a.range.start.cmp(&b.range.start))
    });
}

/// References to the identifier at `position`. Function-local names are
/// answered from the document's own unit; package-level names search the
/// defining package and, when exported, its importers.
pub async fn references(
    state: &ServerState,
    uri: &Url,
    position: Position,
    include_declaration: bool,
    cancel: &CancellationToken,
) -> LspResult<Option<Vec<Location>>> {
    let ctx = FileContext::load(state, uri, cancel).await?;
    let reference = ctx.reference_at(position)?;
    let unit = &ctx.unit;
    let limit = state.config().max_references;

    let (query, defining_dir) = match &reference.resolution {
        Resolution::Local(id) => {
            let decl = unit
                .symbols
                .decl(*id)
                .ok_or_else(|| no_information(&ctx.path, position))?;
            // Nothing imports an external test package
            if !decl.package_level || unit.key.variant == UnitVariant::XTest {
                let mut locations = local_references(unit, *id, include_declaration);
                sort_locations(&mut locations);
                locations.truncate(limit);
                return Ok(Some(locations));
            }
            let query = SymbolDescriptor {
                package: package_id(unit),
                name: decl.name.clone(),
                container: decl.container.clone(),
            };
            (query, Some(unit.key.dir.clone()))
        }
        Resolution::Imported {
            import_path,
            name,
            container,
            location,
        } => {
            let dir = location
                .as_ref()
                .and_then(|l| l.path.parent().map(Path::to_path_buf))
                .or_else(|| package_dir(state, &state.loader(), import_path));
            let query = SymbolDescriptor {
                package: import_path.clone(),
                name: name.clone(),
                container: container.clone(),
            };
            (query, dir)
        }
        _ => return Err(no_information(&ctx.path, position)),
    };

    let found = stream_references(
        state,
        query,
        defining_dir.as_deref(),
        None,
        include_declaration,
        limit,
        cancel,
        |_| async {},
    )
    .await?;
    let mut locations: Vec<Location> = found.into_iter().map(|r| r.reference).collect();
    sort_locations(&mut locations);
    Ok(Some(locations))
}

/// `workspace/references`: references to a symbol named by package and
/// name. Batches are passed to `on_batch` as they are found.
pub async fn workspace_references<F, Fut>(
    state: &ServerState,
    params: WorkspaceReferencesParams,
    cancel: &CancellationToken,
    on_batch: F,
) -> LspResult<Vec<WorkspaceReference>>
where
    F: FnMut(Vec<WorkspaceReference>) -> Fut,
    Fut: Future<Output = ()>,
{
    if params.query.name.is_empty() || params.query.package.is_empty() {
        return Err(LspError::InvalidParams(
            "query needs a package and a name".into(),
        ));
    }
    let limit = params
        .limit
        .unwrap_or_else(|| state.config().max_references);
    let loader = state.loader();
    let defining_dir = package_dir(state, &loader, &params.query.package);
    if defining_dir.is_none() {
        log::debug!("No directory found for package {}", params.query.package);
    }
    stream_references(
        state,
        params.query,
        defining_dir.as_deref(),
        params.hints.as_ref(),
        true,
        limit,
        cancel,
        on_batch,
    )
    .await
}

// ============================================================================
// Completion
// ============================================================================

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Start of the identifier ending at `end`.
fn identifier_start(text: &str, end: usize) -> usize {
    text[..end]
        .char_indices()
        .rev()
        .take_while(|(_, c)| is_identifier_char(*c))
        .last()
        .map(|(i, _)| i)
        .unwrap_or(end)
}

fn completion_kind(decl: &Declaration) -> CompletionItemKind {
    match decl.kind {
        DeclKind::Func => CompletionItemKind::FUNCTION,
        DeclKind::Method => CompletionItemKind::METHOD,
        DeclKind::Type if decl.signature.contains("interface") => CompletionItemKind::INTERFACE,
        DeclKind::Type if decl.signature.contains("struct") => CompletionItemKind::STRUCT,
        DeclKind::Type => CompletionItemKind::CLASS,
        DeclKind::Const => CompletionItemKind::CONSTANT,
        DeclKind::Field => CompletionItemKind::FIELD,
        DeclKind::TypeParam => CompletionItemKind::TYPE_PARAMETER,
        DeclKind::Var | DeclKind::Param | DeclKind::Label => CompletionItemKind::VARIABLE,
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or("").to_string()
}

fn decl_item(decl: &Declaration) -> CompletionItem {
    CompletionItem {
        label: decl.name.clone(),
        kind: Some(completion_kind(decl)),
        detail: Some(first_line(&decl.signature)),
        documentation: decl.doc.clone().map(Documentation::String),
        ..Default::default()
    }
}

/// Locals visible at `offset`, innermost first.
fn visible_locals(unit: &CompilationUnit, file: usize, offset: usize) -> Vec<&Declaration> {
    let mut locals: Vec<&Declaration> = unit
        .symbols
        .decls
        .iter()
        .filter(|d| d.container.is_none() && d.kind != DeclKind::Label)
        .filter(|d| {
            d.scope
                .is_some_and(|s| s.file == file && s.start <= offset && offset <= s.end)
        })
        .collect();
    locals.sort_by(|a, b| {
        let start = |d: &Declaration| d.scope.map(|s| s.start).unwrap_or(0);
        start(*b).cmp(&start(*a))
    });
    locals
}

fn lookup_visible<'a>(
    unit: &'a CompilationUnit,
    file: usize,
    offset: usize,
    name: &str,
) -> Option<&'a Declaration> {
    visible_locals(unit, file, offset)
        .into_iter()
        .find(|d| d.name == name)
        .or_else(|| {
            let id = unit.symbols.package_scope.get(name)?;
            unit.symbols.decl(*id)
        })
}

/// Members offered after `qualifier.`: an imported package's exported
/// members, or the fields and methods of a variable's declared type.
fn member_completions(
    unit: &CompilationUnit,
    file: usize,
    offset: usize,
    qualifier: &str,
) -> Vec<CompletionItem> {
    let import_of = |local_name: &str| {
        unit.symbols
            .imports
            .iter()
            .find(|i| i.file == file && i.local_name == local_name)
            .and_then(|i| unit.imports.get(&i.path))
    };

    if lookup_visible(unit, file, offset, qualifier).is_none() {
        if let Some(summary) = import_of(qualifier) {
            return summary.exported_members().map(decl_item).collect();
        }
        return Vec::new();
    }

    let Some(hint) = lookup_visible(unit, file, offset, qualifier).and_then(|d| d.type_hint.clone())
    else {
        return Vec::new();
    };
    match hint.split_once('.') {
        Some((package, container)) => import_of(package)
            .map(|summary| {
                summary
                    .type_members
                    .iter()
                    .filter(|d| d.container.as_deref() == Some(container) && d.exported())
                    .map(decl_item)
                    .collect()
            })
            .unwrap_or_default(),
        None => unit
            .symbols
            .members_of(&hint)
            .map(|(_, d)| decl_item(d))
            .collect(),
    }
}

fn builtin_item(builtin: &universe::Builtin) -> CompletionItem {
    let kind = match builtin.kind {
        BuiltinKind::Type => CompletionItemKind::CLASS,
        BuiltinKind::Const => CompletionItemKind::CONSTANT,
        BuiltinKind::Func => CompletionItemKind::FUNCTION,
    };
    CompletionItem {
        label: builtin.name.to_string(),
        kind: Some(kind),
        detail: Some(first_line(builtin.signature)),
        ..Default::default()
    }
}

fn scope_completions(unit: &CompilationUnit, file: usize, offset: usize) -> Vec<CompletionItem> {
    let mut items: Vec<CompletionItem> = visible_locals(unit, file, offset)
        .into_iter()
        .map(decl_item)
        .collect();

    let mut package_level: Vec<&Declaration> = unit
        .symbols
        .package_scope
        .values()
        .filter_map(|id| unit.symbols.decl(*id))
        .collect();
    package_level.sort_by(|a, b| a.name.cmp(&b.name));
    items.extend(package_level.into_iter().map(decl_item));

    items.extend(
        unit.symbols
            .imports
            .iter()
            .filter(|i| i.file == file && i.local_name != "_" && i.local_name != ".")
            .map(|i| CompletionItem {
                label: i.local_name.clone(),
                kind: Some(CompletionItemKind::MODULE),
                detail: Some(format!("\"{}\"", i.path)),
                ..Default::default()
            }),
    );
    items.extend(universe::BUILTINS.iter().map(builtin_item));
    items
}

pub async fn completion(
    state: &ServerState,
    uri: &Url,
    position: Position,
    cancel: &CancellationToken,
) -> LspResult<Option<CompletionResponse>> {
    let ctx = FileContext::load(state, uri, cancel).await?;
    let offset = ctx.offset_at(position)?;
    let text = &ctx.parsed().text;

    let start = identifier_start(text, offset);
    let prefix = &text[start..offset];
    let qualifier = text[..start].strip_suffix('.').map(|before| {
        let q_start = identifier_start(before, before.len());
        &before[q_start..]
    });

    let candidates = match qualifier {
        Some(qualifier) if !qualifier.is_empty() => {
            member_completions(&ctx.unit, ctx.file, offset, qualifier)
        }
        _ => scope_completions(&ctx.unit, ctx.file, start),
    };

    // Inner declarations shadow outer ones with the same name
    let mut labels = IndexSet::new();
    let items: Vec<CompletionItem> = candidates
        .into_iter()
        .filter(|item| item.label.starts_with(prefix) && item.label != "_")
        .filter(|item| labels.insert(item.label.clone()))
        .collect();

    Ok(Some(CompletionResponse::Array(items)))
}

// ============================================================================
// Document Symbols
// ============================================================================

fn symbol_kind(decl: &Declaration) -> SymbolKind {
    match decl.kind {
        DeclKind::Func => SymbolKind::FUNCTION,
        DeclKind::Method => SymbolKind::METHOD,
        DeclKind::Type if decl.signature.contains("interface") => SymbolKind::INTERFACE,
        DeclKind::Type if decl.signature.contains("struct") => SymbolKind::STRUCT,
        DeclKind::Type => SymbolKind::CLASS,
        DeclKind::Var | DeclKind::Param => SymbolKind::VARIABLE,
        DeclKind::Const => SymbolKind::CONSTANT,
        DeclKind::Field => SymbolKind::FIELD,
        DeclKind::TypeParam => SymbolKind::TYPE_PARAMETER,
        DeclKind::Label => SymbolKind::KEY,
    }
}

fn contains(outer: &Range, inner: &Range) -> bool {
    outer.start <= inner.start && inner.end <= outer.end
}

#[allow(deprecated)]
fn document_symbol_of(decl: &Declaration, name: String, children: Vec<DocumentSymbol>) -> DocumentSymbol {
    DocumentSymbol {
        name,
        detail: Some(first_line(&decl.signature)),
        kind: symbol_kind(decl),
        tags: None,
        deprecated: None,
        range: decl.full_range,
        selection_range: decl.location.range,
        children: (!children.is_empty()).then_some(children),
    }
}

/// Package-level declarations of one file. Struct fields and interface
/// methods nest under their type; methods declared with a receiver are
/// top-level and named `(T).M`.
fn file_symbols(unit: &CompilationUnit, path: &Path) -> Vec<DocumentSymbol> {
    let decls: Vec<&Declaration> = unit
        .symbols
        .decls
        .iter()
        .filter(|d| d.package_level && d.location.path == path)
        .collect();
    let type_range = |name: &str| {
        decls
            .iter()
            .find(|d| d.kind == DeclKind::Type && d.name == name)
            .map(|d| d.full_range)
    };
    let nested = |decl: &Declaration| {
        decl.container
            .as_deref()
            .and_then(|c| type_range(c))
            .is_some_and(|outer| contains(&outer, &decl.full_range))
    };

    let mut symbols: Vec<DocumentSymbol> = Vec::new();
    for decl in &decls {
        match decl.container.as_deref() {
            None => {
                let children = if decl.kind == DeclKind::Type {
                    decls
                        .iter()
                        .filter(|m| m.container.as_deref() == Some(decl.name.as_str()) && nested(**m))
                        .map(|m| document_symbol_of(m, m.name.clone(), Vec::new()))
                        .collect()
                } else {
                    Vec::new()
                };
                symbols.push(document_symbol_of(decl, decl.name.clone(), children));
            }
            Some(container) if !nested(*decl) => {
                let name = format!("({}).{}", container, decl.name);
                symbols.push(document_symbol_of(decl, name, Vec::new()));
            }
            Some(_) => {}
        }
    }
    symbols.sort_by(|a, b| a.range.start.cmp(&b.range.start));
    symbols
}

pub async fn document_symbol(
    state: &ServerState,
    uri: &Url,
    cancel: &CancellationToken,
) -> LspResult<Option<DocumentSymbolResponse>> {
    let ctx = FileContext::load(state, uri, cancel).await?;
    let symbols = file_symbols(&ctx.unit, &ctx.path);
    Ok(Some(DocumentSymbolResponse::Nested(symbols)))
}

// ============================================================================
// Signature Help
// ============================================================================

/// Innermost call whose argument list encloses `offset`, with its argument
/// list. An unterminated `f(` counts as enclosing the end of the list.
fn enclosing_call(root: Node, offset: usize) -> Option<(Node, Node)> {
    let mut node = root.descendant_for_byte_range(offset, offset)?;
    loop {
        if node.kind() == "call_expression" {
            if let Some(args) = node.child_by_field_name("arguments") {
                let closed = args
                    .child(args.child_count().saturating_sub(1))
                    .is_some_and(|last| last.kind() == ")" && !last.is_missing());
                let inside = args.start_byte() < offset
                    && (offset < args.end_byte() || (offset == args.end_byte() && !closed));
                if inside {
                    return Some((node, args));
                }
            }
        }
        node = node.parent()?;
    }
}

/// Parameters of a predeclared function, split from its signature.
fn builtin_params(signature: &str) -> Vec<String> {
    // Type parameter lists use brackets, so the first paren opens the
    // parameters
    let Some(open) = signature.find('(') else {
        return Vec::new();
    };
    let mut depth = 0usize;
    let mut params = Vec::new();
    let mut current = String::new();
    for c in signature[open + 1..].chars() {
        match c {
            '(' | '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ')' if depth == 0 => break,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                params.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        params.push(current.trim().to_string());
    }
    params
}

pub async fn signature_help(
    state: &ServerState,
    uri: &Url,
    position: Position,
    cancel: &CancellationToken,
) -> LspResult<Option<SignatureHelp>> {
    let ctx = FileContext::load(state, uri, cancel).await?;
    let offset = ctx.offset_at(position)?;
    let parsed = ctx.parsed();
    let Some(tree) = parsed.tree.as_ref() else {
        return Ok(None);
    };
    let Some((call, args)) = enclosing_call(tree.root_node(), offset) else {
        return Ok(None);
    };
    let Some(function) = call.child_by_field_name("function") else {
        return Ok(None);
    };
    let name_node = match function.kind() {
        "selector_expression" => function.child_by_field_name("field"),
        "identifier" => Some(function),
        _ => None,
    };
    let Some(name_node) = name_node else {
        return Ok(None);
    };

    let references = &ctx.unit.symbols.references;
    let key = (ctx.file, name_node.start_byte());
    let Ok(index) = references.binary_search_by_key(&key, |r| (r.file, r.start_byte)) else {
        return Ok(None);
    };
    let reference = &references[index];

    let (label, params, doc) = match &reference.resolution {
        Resolution::Local(id) => match ctx.unit.symbols.decl(*id) {
            Some(d) => (d.signature.clone(), d.params.clone(), d.doc.clone()),
            None => return Ok(None),
        },
        Resolution::Imported {
            import_path,
            name,
            container,
            ..
        } => match imported_decl(&ctx.unit, import_path, name, container.as_deref()) {
            Some(d) => (d.signature.clone(), d.params.clone(), d.doc.clone()),
            None => return Ok(None),
        },
        Resolution::Builtin => match universe::lookup(&reference.name) {
            Some(b) if b.kind == BuiltinKind::Func => {
                (b.signature.to_string(), builtin_params(b.signature), None)
            }
            _ => return Ok(None),
        },
        _ => return Ok(None),
    };

    let mut cursor = args.walk();
    let commas = args
        .children(&mut cursor)
        .filter(|c| c.kind() == "," && c.start_byte() < offset)
        .count();
    let variadic = params.last().is_some_and(|p| p.contains("..."));
    let active = if variadic && !params.is_empty() {
        commas.min(params.len() - 1)
    } else {
        commas
    };
    let active = active as u32;

    Ok(Some(SignatureHelp {
        signatures: vec![SignatureInformation {
            label: first_line(&label),
            documentation: doc.map(Documentation::String),
            parameters: Some(
                params
                    .into_iter()
                    .map(|p| ParameterInformation {
                        label: ParameterLabel::Simple(p),
                        documentation: None,
                    })
                    .collect(),
            ),
            active_parameter: Some(active),
        }],
        active_signature: Some(0),
        active_parameter: Some(active),
    }))
}

// ============================================================================
// Workspace Symbols
// ============================================================================

/// Unit keys of the whole workspace, or of the open documents' packages when
/// there is no workspace root.
async fn workspace_keys(state: &ServerState, loader: &UnitLoader) -> Vec<UnitKey> {
    if state.workspace_root().is_some() {
        return state.index().all_keys(loader).await;
    }
    let dirs = package_dirs(&state.overlay().open_paths());
    keys_for_dirs(loader, &dirs).await
}

#[allow(deprecated)]
fn symbol_information(summary: &PackageSummary, decl: &Declaration) -> Option<SymbolInformation> {
    let container_name = match &decl.container {
        Some(container) => format!("{}.{}", summary.name, container),
        None => summary.name.clone(),
    };
    Some(SymbolInformation {
        name: decl.name.clone(),
        kind: symbol_kind(decl),
        tags: None,
        deprecated: None,
        location: to_location(&decl.location)?,
        container_name: Some(container_name),
    })
}

/// Case-insensitive substring search over package-level declarations and
/// methods of every workspace package. An empty query matches everything.
pub async fn workspace_symbol(
    state: &ServerState,
    query: &str,
    cancel: &CancellationToken,
) -> LspResult<Option<Vec<SymbolInformation>>> {
    let loader = state.loader();
    let keys = workspace_keys(state, &loader).await;
    let needle = query.to_lowercase();
    let seen: Arc<DashSet<LocationKey>> = Arc::new(DashSet::new());

    let visit: Visitor<PackageSummary, SymbolInformation> =
        Arc::new(move |_key: &UnitKey, summary: &PackageSummary| {
            summary
                .members
                .values()
                .chain(summary.type_members.iter().filter(|d| d.kind == DeclKind::Method))
                .filter(|d| needle.is_empty() || d.name.to_lowercase().contains(&needle))
                .filter_map(|d| symbol_information(summary, d))
                .filter(|s| seen.insert(location_key(&s.location)))
                .collect()
        });

    let limit = state.config().max_workspace_symbols;
    let source: Arc<dyn UnitSource<PackageSummary>> = Arc::new(loader);
    let results = search(source, keys, visit, state.search_options(limit, cancel))
        .collect()
        .await;
    if cancel.is_cancelled() {
        return Err(LspError::Cancelled);
    }
    if results.timed_out {
        log::warn!("Workspace symbol search timed out");
    }

    let mut symbols = results.matches;
    symbols.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then_with(|| a.location.uri.as_str().cmp(b.location.uri.as_str()))
    });
    Ok(Some(symbols))
}

// ============================================================================
// Formatting
// ============================================================================

/// Whole-document edit produced by the formatter. Empty when the text is
/// already formatted, no result when the formatter fails.
pub async fn formatting(state: &ServerState, uri: &Url) -> LspResult<Option<Vec<TextEdit>>> {
    let path = uri_to_path(uri)
        .ok_or_else(|| LspError::InvalidParams(format!("not a file URI: {}", uri)))?;
    let text = match state.overlay().read(&path) {
        Ok(text) => text,
        Err(err) => {
            log::debug!("Cannot format {}", err);
            return Ok(None);
        }
    };

    match state.formatter().format(&text).await {
        Ok(formatted) if formatted.as_str() == &*text => Ok(Some(Vec::new())),
        Ok(formatted) => {
            let end = LineIndex::new(&text).position(&text, text.len());
            Ok(Some(vec![TextEdit::new(
                Range::new(Position::new(0, 0), end),
                formatted,
            )]))
        }
        Err(err) => {
            log::warn!("Formatting {} failed: {:#}", path.display(), err);
            Ok(None)
        }
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

pub fn to_lsp_diagnostic(diagnostic: &UnitDiagnostic) -> Diagnostic {
    let severity = match diagnostic.severity {
        Severity::Error => DiagnosticSeverity::ERROR,
        Severity::Warning => DiagnosticSeverity::WARNING,
        Severity::Info => DiagnosticSeverity::INFORMATION,
    };
    Diagnostic {
        range: diagnostic.range,
        severity: Some(severity),
        source: Some("golsp".to_string()),
        message: diagnostic.message.clone(),
        ..Default::default()
    }
}

/// Diagnostics for every file of the unit containing `path`, by file.
pub async fn unit_diagnostics(
    state: &ServerState,
    path: &Path,
    cancel: &CancellationToken,
) -> LspResult<Vec<(PathBuf, Vec<Diagnostic>)>> {
    let unit = state.loader().unit_for_file(path, cancel).await?;
    Ok(unit
        .files
        .iter()
        .map(|file| {
            let diagnostics = unit
                .diagnostics_for(&file.path)
                .map(to_lsp_diagnostic)
                .collect();
            (file.path.clone(), diagnostics)
        })
        .collect())
}
