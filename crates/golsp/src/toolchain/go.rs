//
// toolchain/go.rs
//
// Package analysis over tree-sitter-go syntax trees
//

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::Range;
use tree_sitter::Node;

use super::universe;
use super::{CheckInput, CheckedPackage, FileHeader, SourceFile, Toolchain, ToolchainError};
use crate::parser_pool;
use crate::unit::{
    DeclId, DeclKind, Declaration, DiagnosticKind, ImportDecl, PackageSummary, ParsedFile,
    Reference, Resolution, ScopeSpan, Severity, SymbolLocation, SymbolTable, UnitDiagnostic,
    UnitKey,
};
use crate::utf16::LineIndex;

const MAX_SYNTAX_ERRORS_PER_FILE: usize = 20;
const MAX_SIGNATURE_CHARS: usize = 400;
/// Depth of embedded-field promotion followed when resolving members
const MAX_EMBEDDING_DEPTH: usize = 3;

/// Toolchain built on the tree-sitter Go grammar.
#[derive(Debug, Default, Clone, Copy)]
pub struct GoToolchain;

pub fn named_children(node: Node) -> Vec<Node> {
    let mut cursor = node.walk();
    let children = node.named_children(&mut cursor).collect();
    children
}

fn field_children<'t>(node: Node<'t>, field: &str) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    let children = node.children_by_field_name(field, &mut cursor).collect();
    children
}

fn has_token(node: Node, token: &str) -> bool {
    let mut cursor = node.walk();
    let found = node.children(&mut cursor).any(|c| c.kind() == token);
    found
}

fn unquote(literal: &str) -> &str {
    literal.trim_matches(|c| c == '"' || c == '`')
}

fn truncate(mut text: String) -> String {
    if let Some((idx, _)) = text.char_indices().nth(MAX_SIGNATURE_CHARS) {
        text.truncate(idx);
        text.push_str(" ...");
    }
    text
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clean_comment(text: &str) -> String {
    if let Some(line) = text.strip_prefix("//") {
        line.strip_prefix(' ').unwrap_or(line).trim_end().to_string()
    } else {
        text.trim_start_matches("/*")
            .trim_end_matches("*/")
            .trim()
            .to_string()
    }
}

fn is_major_version(elem: &str) -> bool {
    elem.strip_prefix('v')
        .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

/// Package name an unresolved import is most likely referred to by.
pub fn guess_package_name(import_path: &str) -> String {
    let mut elems: Vec<&str> = import_path.split('/').filter(|e| !e.is_empty()).collect();
    let mut last = elems.pop().unwrap_or(import_path);
    if is_major_version(last) {
        if let Some(prev) = elems.pop() {
            last = prev;
        }
    }
    let last = last.strip_prefix("go-").unwrap_or(last);
    let last = last.split('.').next().unwrap_or(last);
    last.replace('-', "_")
}

fn import_specs(decl: Node) -> Vec<Node> {
    let mut specs = Vec::new();
    for child in named_children(decl) {
        match child.kind() {
            "import_spec" => specs.push(child),
            "import_spec_list" => specs.extend(
                named_children(child)
                    .into_iter()
                    .filter(|c| c.kind() == "import_spec"),
            ),
            _ => {}
        }
    }
    specs
}

fn type_specs(decl: Node) -> Vec<Node> {
    named_children(decl)
        .into_iter()
        .filter(|c| matches!(c.kind(), "type_spec" | "type_alias"))
        .collect()
}

fn value_specs(decl: Node) -> Vec<Node> {
    let mut specs = Vec::new();
    for child in named_children(decl) {
        match child.kind() {
            "var_spec" | "const_spec" => specs.push(child),
            "var_spec_list" | "const_spec_list" => specs.extend(
                named_children(child)
                    .into_iter()
                    .filter(|c| matches!(c.kind(), "var_spec" | "const_spec")),
            ),
            _ => {}
        }
    }
    specs
}

fn package_identifier(root: Node) -> Option<Node> {
    let clause = named_children(root)
        .into_iter()
        .find(|c| c.kind() == "package_clause")?;
    named_children(clause)
        .into_iter()
        .find(|c| c.kind() == "package_identifier")
}

/// Location of the package clause name in `file`.
pub fn package_clause_location(file: &ParsedFile) -> Option<SymbolLocation> {
    let tree = file.tree.as_ref()?;
    let ident = package_identifier(tree.root_node())?;
    Some(SymbolLocation {
        path: file.path.clone(),
        range: file.range_of(ident.start_byte(), ident.end_byte()),
    })
}

fn parse_file(source: &SourceFile) -> Result<ParsedFile, ToolchainError> {
    let tree = parser_pool::parse_go(&source.text)
        .ok_or_else(|| ToolchainError::Failed("Go parser unavailable".to_string()))?;
    let package_name = package_identifier(tree.root_node())
        .and_then(|n| source.text.get(n.byte_range()))
        .unwrap_or_default()
        .to_string();
    let is_test = source
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with("_test.go"))
        .unwrap_or(false);
    Ok(ParsedFile {
        path: source.path.clone(),
        text: source.text.clone(),
        line_index: LineIndex::new(&source.text),
        tree: Some(tree),
        package_name,
        is_test,
    })
}

fn parse_files(
    sources: &[SourceFile],
    cancel: &CancellationToken,
) -> Result<Vec<ParsedFile>, ToolchainError> {
    sources
        .iter()
        .map(|source| {
            if cancel.is_cancelled() {
                return Err(ToolchainError::Cancelled);
            }
            parse_file(source)
        })
        .collect()
}

fn syntax_errors(file: &ParsedFile, out: &mut Vec<UnitDiagnostic>) {
    let Some(tree) = &file.tree else {
        return;
    };
    let mut reported = 0;
    let mut stack = vec![tree.root_node()];
    while let Some(node) = stack.pop() {
        if reported >= MAX_SYNTAX_ERRORS_PER_FILE {
            break;
        }
        let message = if node.is_error() {
            let snippet = file
                .text
                .get(node.byte_range())
                .and_then(|t| t.lines().next())
                .map(|t| t.trim().chars().take(20).collect::<String>())
                .unwrap_or_default();
            Some(if snippet.is_empty() {
                "syntax error".to_string()
            } else {
                format!("syntax error: unexpected {}", snippet)
            })
        } else if node.is_missing() {
            Some(format!("syntax error: missing {}", node.kind()))
        } else {
            None
        };

        if let Some(message) = message {
            out.push(UnitDiagnostic {
                path: file.path.clone(),
                range: file.range_of(node.start_byte(), node.end_byte()),
                severity: Severity::Error,
                kind: DiagnosticKind::Parse,
                message,
            });
            reported += 1;
            continue;
        }

        if node.has_error() {
            let mut cursor = node.walk();
            let children: Vec<_> = node.children(&mut cursor).collect();
            stack.extend(children.into_iter().rev());
        }
    }
}

/// Static type of an expression, as far as syntax tells.
#[derive(Debug, Clone, PartialEq)]
enum TypeRef {
    Local(String),
    Imported { import_path: String, name: String },
}

struct DeclInfo {
    kind: DeclKind,
    signature: String,
    container: Option<String>,
    doc: Option<String>,
    params: Vec<String>,
    type_hint: Option<String>,
}

impl DeclInfo {
    fn new(kind: DeclKind, signature: String) -> Self {
        Self {
            kind,
            signature: truncate(signature),
            container: None,
            doc: None,
            params: Vec::new(),
            type_hint: None,
        }
    }

    fn container(mut self, container: Option<String>) -> Self {
        self.container = container;
        self
    }

    fn doc(mut self, doc: Option<String>) -> Self {
        self.doc = doc;
        self
    }

    fn params(mut self, params: Vec<String>) -> Self {
        self.params = params;
        self
    }

    fn hint(mut self, hint: Option<String>) -> Self {
        self.type_hint = hint;
        self
    }
}

struct Scope {
    names: HashMap<String, DeclId>,
    declared: Vec<DeclId>,
    end: usize,
}

/// Two passes over a package: package-level declarations of every file,
/// then bodies with lexical scopes.
struct Checker<'a> {
    files: &'a [ParsedFile],
    summaries: &'a HashMap<String, Arc<PackageSummary>>,
    file: usize,
    decls: Vec<Declaration>,
    used: Vec<bool>,
    refs: Vec<Reference>,
    declared_at: HashSet<(usize, usize)>,
    package_scope: HashMap<String, DeclId>,
    methods_seen: HashSet<(String, String)>,
    imports: Vec<ImportDecl>,
    import_used: Vec<bool>,
    scopes: Vec<Scope>,
    labels: Vec<HashMap<String, DeclId>>,
    error_depth: usize,
    diagnostics: Vec<UnitDiagnostic>,
}

impl<'a> Checker<'a> {
    fn new(files: &'a [ParsedFile], summaries: &'a HashMap<String, Arc<PackageSummary>>) -> Self {
        Self {
            files,
            summaries,
            file: 0,
            decls: Vec::new(),
            used: Vec::new(),
            refs: Vec::new(),
            declared_at: HashSet::new(),
            package_scope: HashMap::new(),
            methods_seen: HashSet::new(),
            imports: Vec::new(),
            import_used: Vec::new(),
            scopes: Vec::new(),
            labels: Vec::new(),
            error_depth: 0,
            diagnostics: Vec::new(),
        }
    }

    fn root(&self, file: usize) -> Option<Node<'a>> {
        let files: &'a [ParsedFile] = self.files;
        files.get(file)?.tree.as_ref().map(|t| t.root_node())
    }

    fn text(&self, node: Node<'a>) -> &'a str {
        let files: &'a [ParsedFile] = self.files;
        let source: &'a str = &files[self.file].text;
        source.get(node.byte_range()).unwrap_or("")
    }

    fn range(&self, node: Node) -> Range {
        self.files[self.file].range_of(node.start_byte(), node.end_byte())
    }

    fn location(&self, node: Node) -> SymbolLocation {
        SymbolLocation {
            path: self.files[self.file].path.clone(),
            range: self.range(node),
        }
    }

    fn report(&mut self, node: Node, severity: Severity, kind: DiagnosticKind, message: String) {
        let location = self.location(node);
        self.diagnostics.push(UnitDiagnostic {
            path: location.path,
            range: location.range,
            severity,
            kind,
            message,
        });
    }

    fn add_decl(&mut self, name_node: Node<'a>, full: Node<'a>, info: DeclInfo) -> DeclId {
        let name = self.text(name_node).to_string();
        let location = self.location(name_node);
        let scope = self.scopes.last().map(|s| ScopeSpan {
            file: self.file,
            start: name_node.start_byte(),
            end: s.end,
        });
        let id = self.decls.len();
        self.refs.push(Reference {
            file: self.file,
            range: location.range,
            start_byte: name_node.start_byte(),
            end_byte: name_node.end_byte(),
            name: name.clone(),
            resolution: Resolution::Local(id),
            is_declaration: true,
        });
        self.declared_at.insert((self.file, name_node.start_byte()));
        self.decls.push(Declaration {
            name,
            kind: info.kind,
            location,
            full_range: self.range(full),
            container: info.container,
            package_level: scope.is_none(),
            signature: info.signature,
            doc: info.doc,
            params: info.params,
            type_hint: info.type_hint,
            scope,
        });
        self.used.push(false);
        id
    }

    fn bind(&mut self, id: DeclId) {
        let name = self.decls[id].name.clone();
        if name == "_" {
            return;
        }
        if let Some(scope) = self.scopes.last_mut() {
            scope.names.insert(name, id);
            scope.declared.push(id);
        }
    }

    fn bind_package(&mut self, id: DeclId) {
        let decl = &self.decls[id];
        if decl.name == "_" || (decl.name == "init" && decl.kind == DeclKind::Func) {
            return;
        }
        if self.package_scope.contains_key(&decl.name) {
            let message = format!("{} redeclared in this block", decl.name);
            let location = decl.location.clone();
            self.diagnostics.push(UnitDiagnostic {
                path: location.path,
                range: location.range,
                severity: Severity::Error,
                kind: DiagnosticKind::Type,
                message,
            });
            return;
        }
        self.package_scope.insert(decl.name.clone(), id);
    }

    fn bind_here(&mut self, id: DeclId) {
        if self.scopes.is_empty() {
            self.bind_package(id);
        } else {
            self.bind(id);
        }
    }

    fn push_scope(&mut self, node: Node) {
        self.scopes.push(Scope {
            names: HashMap::new(),
            declared: Vec::new(),
            end: node.end_byte(),
        });
    }

    fn pop_scope(&mut self) {
        let Some(scope) = self.scopes.pop() else {
            return;
        };
        for id in scope.declared {
            let decl = &self.decls[id];
            if decl.kind == DeclKind::Var && !self.used[id] {
                self.diagnostics.push(UnitDiagnostic {
                    path: decl.location.path.clone(),
                    range: decl.location.range,
                    severity: Severity::Error,
                    kind: DiagnosticKind::Type,
                    message: format!("declared and not used: {}", decl.name),
                });
            }
        }
    }

    // Comments directly above `node`, or above its declaration keyword.
    fn doc_comment(&self, node: Node<'a>) -> Option<String> {
        let mut lines = Vec::new();
        let mut expected_row = node.start_position().row;
        let mut prev = node.prev_sibling();
        while let Some(p) = prev {
            if p.kind() != "comment" || p.end_position().row + 1 != expected_row {
                break;
            }
            lines.push(clean_comment(self.text(p)));
            expected_row = p.start_position().row;
            prev = p.prev_sibling();
        }
        if lines.is_empty() {
            return None;
        }
        lines.reverse();
        Some(lines.join("\n"))
    }

    fn doc_for(&self, spec: Node<'a>) -> Option<String> {
        self.doc_comment(spec).or_else(|| {
            let mut parent = spec.parent()?;
            if matches!(parent.kind(), "var_spec_list" | "const_spec_list") {
                parent = parent.parent()?;
            }
            matches!(
                parent.kind(),
                "var_declaration" | "const_declaration" | "type_declaration"
            )
            .then(|| self.doc_comment(parent))
            .flatten()
        })
    }

    fn base_type_name(&self, ty: Node<'a>) -> Option<String> {
        match ty.kind() {
            "type_identifier" | "identifier" => Some(self.text(ty).to_string()),
            "qualified_type" => Some(collapse_whitespace(self.text(ty)).replace(' ', "")),
            "pointer_type" | "parenthesized_type" => named_children(ty)
                .into_iter()
                .next()
                .and_then(|inner| self.base_type_name(inner)),
            "generic_type" => ty
                .child_by_field_name("type")
                .and_then(|inner| self.base_type_name(inner)),
            _ => None,
        }
    }

    fn signature_text(&self, node: Node<'a>) -> String {
        let end = node
            .child_by_field_name("body")
            .map(|b| b.start_byte())
            .unwrap_or(node.end_byte());
        let files: &'a [ParsedFile] = self.files;
        let source: &'a str = &files[self.file].text;
        source
            .get(node.start_byte()..end)
            .unwrap_or("")
            .trim_end()
            .to_string()
    }

    fn param_texts(&self, list: Option<Node<'a>>) -> Vec<String> {
        let Some(list) = list else {
            return Vec::new();
        };
        let mut params = Vec::new();
        for param in named_children(list) {
            let variadic = match param.kind() {
                "parameter_declaration" => false,
                "variadic_parameter_declaration" => true,
                _ => continue,
            };
            let ty = param
                .child_by_field_name("type")
                .map(|t| collapse_whitespace(self.text(t)))
                .unwrap_or_default();
            let ty = if variadic { format!("...{}", ty) } else { ty };
            let names = field_children(param, "name");
            if names.is_empty() {
                params.push(ty);
            } else {
                params.extend(names.into_iter().map(|n| format!("{} {}", self.text(n), ty)));
            }
        }
        params
    }

    fn result_hint(&self, node: Node<'a>) -> Option<String> {
        let result = node.child_by_field_name("result")?;
        if result.kind() == "parameter_list" {
            let first = named_children(result)
                .into_iter()
                .find(|p| p.kind() == "parameter_declaration")?;
            first
                .child_by_field_name("type")
                .and_then(|t| self.base_type_name(t))
        } else {
            self.base_type_name(result)
        }
    }

    fn receiver_type(&self, receiver: Node<'a>) -> Option<String> {
        let param = named_children(receiver)
            .into_iter()
            .find(|p| p.kind() == "parameter_declaration")?;
        self.base_type_name(param.child_by_field_name("type")?)
    }

    // Package-level pass

    fn collect_file(&mut self, file: usize) {
        self.file = file;
        let Some(root) = self.root(file) else {
            return;
        };
        for node in named_children(root) {
            match node.kind() {
                "import_declaration" => self.collect_imports(node),
                "function_declaration" => self.collect_function(node),
                "method_declaration" => self.collect_method(node),
                "type_declaration" => {
                    for spec in type_specs(node) {
                        self.declare_type_spec(spec);
                    }
                }
                "var_declaration" | "const_declaration" => {
                    let kind = value_kind(node);
                    for spec in value_specs(node) {
                        for id in self.declare_value_spec(spec, kind) {
                            self.bind_package(id);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn collect_imports(&mut self, decl: Node<'a>) {
        for spec in import_specs(decl) {
            let Some(path_node) = spec.child_by_field_name("path") else {
                continue;
            };
            let path = unquote(self.text(path_node)).to_string();
            if path.is_empty() {
                continue;
            }
            let explicit = spec
                .child_by_field_name("name")
                .map(|n| self.text(n).to_string());
            let local_name = explicit
                .clone()
                .or_else(|| self.summaries.get(&path).map(|s| s.name.clone()))
                .unwrap_or_else(|| guess_package_name(&path));
            self.imports.push(ImportDecl {
                file: self.file,
                resolved: self.summaries.contains_key(&path),
                path,
                local_name,
                aliased: explicit.is_some(),
                range: self.range(spec),
            });
            self.import_used.push(false);
        }
    }

    fn collect_function(&mut self, node: Node<'a>) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let info = DeclInfo::new(DeclKind::Func, self.signature_text(node))
            .doc(self.doc_comment(node))
            .params(self.param_texts(node.child_by_field_name("parameters")))
            .hint(self.result_hint(node));
        let id = self.add_decl(name_node, node, info);
        self.bind_package(id);
    }

    fn collect_method(&mut self, node: Node<'a>) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let container = node
            .child_by_field_name("receiver")
            .and_then(|r| self.receiver_type(r));
        let name = self.text(name_node).to_string();
        if let Some(container) = &container {
            if name != "_" && !self.methods_seen.insert((container.clone(), name.clone())) {
                self.report(
                    name_node,
                    Severity::Error,
                    DiagnosticKind::Type,
                    format!("method {}.{} already declared", container, name),
                );
            }
        }
        let info = DeclInfo::new(DeclKind::Method, self.signature_text(node))
            .container(container)
            .doc(self.doc_comment(node))
            .params(self.param_texts(node.child_by_field_name("parameters")))
            .hint(self.result_hint(node));
        self.add_decl(name_node, node, info);
    }

    fn declare_type_spec(&mut self, spec: Node<'a>) -> Option<DeclId> {
        let name_node = spec.child_by_field_name("name")?;
        let name = self.text(name_node).to_string();
        let info = DeclInfo::new(DeclKind::Type, format!("type {}", self.text(spec)))
            .doc(self.doc_for(spec));
        let id = self.add_decl(name_node, spec, info);
        self.bind_here(id);
        if let Some(ty) = spec.child_by_field_name("type") {
            self.declare_type_members(&name, ty);
        }
        Some(id)
    }

    fn embedded_name(&self, ty: Node<'a>) -> Option<Node<'a>> {
        match ty.kind() {
            "type_identifier" => Some(ty),
            "qualified_type" => ty.child_by_field_name("name"),
            "generic_type" | "pointer_type" => ty
                .child_by_field_name("type")
                .or_else(|| named_children(ty).into_iter().next())
                .and_then(|inner| self.embedded_name(inner)),
            _ => None,
        }
    }

    fn declare_type_members(&mut self, container: &str, ty: Node<'a>) {
        match ty.kind() {
            "struct_type" => {
                let fields = named_children(ty)
                    .into_iter()
                    .filter(|c| c.kind() == "field_declaration_list")
                    .flat_map(named_children)
                    .filter(|c| c.kind() == "field_declaration");
                for field in fields {
                    let type_node = field.child_by_field_name("type");
                    let type_text = type_node
                        .map(|t| collapse_whitespace(self.text(t)))
                        .unwrap_or_default();
                    let hint = type_node.and_then(|t| self.base_type_name(t));
                    let doc = self.doc_comment(field);
                    let names = field_children(field, "name");
                    let names = if names.is_empty() {
                        type_node.and_then(|t| self.embedded_name(t)).into_iter().collect()
                    } else {
                        names
                    };
                    for name_node in names {
                        let info = DeclInfo::new(
                            DeclKind::Field,
                            format!("field {} {}", self.text(name_node), type_text),
                        )
                        .container(Some(container.to_string()))
                        .doc(doc.clone())
                        .hint(hint.clone());
                        self.add_decl(name_node, field, info);
                    }
                }
            }
            "interface_type" => {
                for elem in named_children(ty) {
                    if !matches!(elem.kind(), "method_elem" | "method_spec") {
                        continue;
                    }
                    let Some(name_node) = elem.child_by_field_name("name") else {
                        continue;
                    };
                    let info = DeclInfo::new(
                        DeclKind::Method,
                        format!("func ({}).{}", container, collapse_whitespace(self.text(elem))),
                    )
                    .container(Some(container.to_string()))
                    .doc(self.doc_comment(elem))
                    .params(self.param_texts(elem.child_by_field_name("parameters")))
                    .hint(self.result_hint(elem));
                    self.add_decl(name_node, elem, info);
                }
            }
            _ => {}
        }
    }

    fn declare_value_spec(&mut self, spec: Node<'a>, kind: DeclKind) -> Vec<DeclId> {
        let keyword = if kind == DeclKind::Const { "const" } else { "var" };
        let ty = spec.child_by_field_name("type");
        let type_text = ty.map(|t| collapse_whitespace(self.text(t)));
        let type_hint = ty.and_then(|t| self.base_type_name(t));
        let values = spec
            .child_by_field_name("value")
            .map(named_children)
            .unwrap_or_default();
        let doc = self.doc_for(spec);
        let names = field_children(spec, "name");
        let positional = values.len() == names.len();

        let mut ids = Vec::new();
        for (i, name_node) in names.into_iter().enumerate() {
            let name = self.text(name_node);
            let value = values.get(i).filter(|_| positional);
            let signature = match (&type_text, value) {
                (Some(t), _) => format!("{} {} {}", keyword, name, t),
                (None, Some(v)) if kind == DeclKind::Const => {
                    format!("const {} = {}", name, collapse_whitespace(self.text(*v)))
                }
                _ => format!("{} {}", keyword, name),
            };
            let hint = type_hint
                .clone()
                .or_else(|| value.and_then(|v| self.static_hint(*v)));
            let info = DeclInfo::new(kind, signature).doc(doc.clone()).hint(hint);
            ids.push(self.add_decl(name_node, spec, info));
        }
        ids
    }

    // Body pass

    fn check_file(&mut self, file: usize) {
        self.file = file;
        let Some(root) = self.root(file) else {
            return;
        };
        for node in named_children(root) {
            self.visit(node);
        }
    }

    fn visit_children(&mut self, node: Node<'a>) {
        for child in named_children(node) {
            self.visit(child);
        }
    }

    fn visit_scoped(&mut self, node: Node<'a>) {
        self.push_scope(node);
        self.visit_children(node);
        self.pop_scope();
    }

    fn visit(&mut self, node: Node<'a>) {
        match node.kind() {
            "comment" | "package_clause" | "import_declaration" => {}
            "field_identifier" | "package_identifier" | "label_name" | "blank_identifier" | "dot" => {}
            "function_declaration" | "method_declaration" | "func_literal" => {
                self.visit_function(node)
            }
            "type_declaration" => self.visit_type_declaration(node),
            "var_declaration" | "const_declaration" => self.visit_value_declaration(node),
            "block" | "if_statement" | "for_statement" | "expression_switch_statement"
            | "select_statement" | "expression_case" | "default_case" | "type_case"
            | "communication_case" => self.visit_scoped(node),
            "type_switch_statement" => self.visit_type_switch(node),
            "short_var_declaration" => self.visit_short_var(node),
            "range_clause" | "receive_statement" => self.visit_binding_clause(node),
            "break_statement" | "continue_statement" | "goto_statement" => {
                self.visit_label_use(node)
            }
            "selector_expression" => self.visit_selector(node),
            "qualified_type" => self.visit_qualified_type(node),
            "composite_literal" => self.visit_composite_literal(node),
            "parameter_list" => self.visit_param_types(node),
            "identifier" | "type_identifier" => self.resolve_identifier(node, true),
            "ERROR" => {
                self.error_depth += 1;
                self.visit_children(node);
                self.error_depth -= 1;
            }
            _ => self.visit_children(node),
        }
    }

    fn visit_function(&mut self, node: Node<'a>) {
        self.push_scope(node);
        self.labels.push(HashMap::new());
        if let Some(type_params) = node.child_by_field_name("type_parameters") {
            self.declare_type_params(type_params);
        }
        if let Some(receiver) = node.child_by_field_name("receiver") {
            self.declare_receiver_type_params(receiver);
            self.declare_params(receiver);
        }
        if let Some(params) = node.child_by_field_name("parameters") {
            self.declare_params(params);
        }
        if let Some(result) = node.child_by_field_name("result") {
            if result.kind() == "parameter_list" {
                self.declare_params(result);
            } else {
                self.visit(result);
            }
        }
        if let Some(body) = node.child_by_field_name("body") {
            self.declare_labels(body);
            // The body shares the function's scope
            self.visit_children(body);
        }
        self.labels.pop();
        self.pop_scope();
    }

    fn declare_params(&mut self, list: Node<'a>) {
        for param in named_children(list) {
            let variadic = match param.kind() {
                "parameter_declaration" => false,
                "variadic_parameter_declaration" => true,
                _ => {
                    self.visit(param);
                    continue;
                }
            };
            let ty = param.child_by_field_name("type");
            if let Some(ty) = ty {
                self.visit(ty);
            }
            let type_text = ty
                .map(|t| collapse_whitespace(self.text(t)))
                .unwrap_or_default();
            let hint = if variadic {
                None
            } else {
                ty.and_then(|t| self.base_type_name(t))
            };
            for name_node in field_children(param, "name") {
                let signature = format!(
                    "var {} {}{}",
                    self.text(name_node),
                    if variadic { "..." } else { "" },
                    type_text
                );
                let id = self.add_decl(
                    name_node,
                    param,
                    DeclInfo::new(DeclKind::Param, signature).hint(hint.clone()),
                );
                self.bind(id);
            }
        }
    }

    fn visit_param_types(&mut self, list: Node<'a>) {
        for param in named_children(list) {
            match param.child_by_field_name("type") {
                Some(ty) if param.kind().ends_with("parameter_declaration") => self.visit(ty),
                _ => self.visit(param),
            }
        }
    }

    fn declare_type_params(&mut self, list: Node<'a>) {
        for decl in named_children(list) {
            if decl.kind() != "type_parameter_declaration" {
                continue;
            }
            let constraint = decl.child_by_field_name("type");
            let constraint_text = constraint
                .map(|c| collapse_whitespace(self.text(c)))
                .unwrap_or_else(|| "any".to_string());
            for name_node in field_children(decl, "name") {
                let signature = format!("type {} {}", self.text(name_node), constraint_text);
                let id = self.add_decl(name_node, decl, DeclInfo::new(DeclKind::TypeParam, signature));
                self.bind(id);
            }
            if let Some(constraint) = constraint {
                self.visit(constraint);
            }
        }
    }

    // `func (l *List[T]) ...` introduces T
    fn declare_receiver_type_params(&mut self, receiver: Node<'a>) {
        let Some(ty) = named_children(receiver)
            .into_iter()
            .find(|p| p.kind() == "parameter_declaration")
            .and_then(|p| p.child_by_field_name("type"))
        else {
            return;
        };
        let mut ty = ty;
        while ty.kind() == "pointer_type" || ty.kind() == "parenthesized_type" {
            match named_children(ty).into_iter().next() {
                Some(inner) => ty = inner,
                None => return,
            }
        }
        let Some(args) = ty
            .child_by_field_name("type_arguments")
            .filter(|_| ty.kind() == "generic_type")
        else {
            return;
        };
        let mut stack = vec![args];
        while let Some(node) = stack.pop() {
            if matches!(node.kind(), "type_identifier" | "identifier") {
                let signature = format!("type {} any", self.text(node));
                let id = self.add_decl(node, node, DeclInfo::new(DeclKind::TypeParam, signature));
                self.bind(id);
            } else {
                stack.extend(named_children(node));
            }
        }
    }

    fn declare_labels(&mut self, body: Node<'a>) {
        let mut stack = vec![body];
        while let Some(node) = stack.pop() {
            match node.kind() {
                "func_literal" => continue,
                "labeled_statement" => {
                    if let Some(label) = node.child_by_field_name("label") {
                        let signature = format!("label {}", self.text(label));
                        let id = self.add_decl(label, node, DeclInfo::new(DeclKind::Label, signature));
                        let name = self.decls[id].name.clone();
                        if let Some(labels) = self.labels.last_mut() {
                            labels.insert(name, id);
                        }
                    }
                }
                _ => {}
            }
            stack.extend(named_children(node));
        }
    }

    fn visit_label_use(&mut self, node: Node<'a>) {
        for child in named_children(node) {
            if child.kind() != "label_name" {
                self.visit(child);
                continue;
            }
            let name = self.text(child);
            let resolution = self
                .labels
                .last()
                .and_then(|labels| labels.get(name))
                .map(|id| Resolution::Local(*id))
                .unwrap_or(Resolution::Unresolved);
            if resolution == Resolution::Unresolved && self.error_depth == 0 {
                self.report(
                    child,
                    Severity::Error,
                    DiagnosticKind::Type,
                    format!("label {} not defined", name),
                );
            }
            self.record_ref(child, resolution);
        }
    }

    fn visit_type_declaration(&mut self, node: Node<'a>) {
        for spec in type_specs(node) {
            if !self.scopes.is_empty() {
                self.declare_type_spec(spec);
            }
            self.push_scope(spec);
            if let Some(type_params) = spec.child_by_field_name("type_parameters") {
                self.declare_type_params(type_params);
            }
            if let Some(ty) = spec.child_by_field_name("type") {
                self.visit(ty);
            }
            self.pop_scope();
        }
    }

    fn visit_value_declaration(&mut self, node: Node<'a>) {
        let kind = value_kind(node);
        for spec in value_specs(node) {
            if let Some(ty) = spec.child_by_field_name("type") {
                self.visit(ty);
            }
            if let Some(value) = spec.child_by_field_name("value") {
                self.visit(value);
            }
            if !self.scopes.is_empty() {
                for id in self.declare_value_spec(spec, kind) {
                    self.bind(id);
                }
            }
        }
    }

    fn visit_type_switch(&mut self, node: Node<'a>) {
        self.push_scope(node);
        if let Some(init) = node.child_by_field_name("initializer") {
            self.visit(init);
        }
        if let Some(value) = node.child_by_field_name("value") {
            self.visit(value);
        }
        if let Some(alias) = node.child_by_field_name("alias") {
            for ident in named_children(alias) {
                if ident.kind() != "identifier" {
                    continue;
                }
                let signature = format!("var {}", self.text(ident));
                let id = self.add_decl(ident, node, DeclInfo::new(DeclKind::Var, signature));
                // Use in any clause counts; not tracked per clause
                self.used[id] = true;
                self.bind(id);
            }
        }
        for clause in named_children(node) {
            if matches!(clause.kind(), "type_case" | "default_case" | "comment") {
                self.visit(clause);
            }
        }
        self.pop_scope();
    }

    fn declare_local_vars(&mut self, left: Node<'a>, full: Node<'a>, hints: &[Option<String>], reuse: bool) {
        for (i, ident) in named_children(left).into_iter().enumerate() {
            if ident.kind() != "identifier" {
                self.visit(ident);
                continue;
            }
            let name = self.text(ident);
            if name == "_" {
                continue;
            }
            let existing = self
                .scopes
                .last()
                .and_then(|s| s.names.get(name))
                .copied()
                .filter(|_| reuse);
            match existing {
                Some(id) => self.refs.push(Reference {
                    file: self.file,
                    range: self.range(ident),
                    start_byte: ident.start_byte(),
                    end_byte: ident.end_byte(),
                    name: name.to_string(),
                    resolution: Resolution::Local(id),
                    is_declaration: false,
                }),
                None => {
                    let hint = hints.get(i).cloned().flatten();
                    let signature = match &hint {
                        Some(h) => format!("var {} {}", name, h),
                        None => format!("var {}", name),
                    };
                    let id = self.add_decl(ident, full, DeclInfo::new(DeclKind::Var, signature).hint(hint));
                    self.bind(id);
                }
            }
        }
    }

    fn visit_short_var(&mut self, node: Node<'a>) {
        let right = node.child_by_field_name("right");
        if let Some(right) = right {
            self.visit(right);
        }
        let Some(left) = node.child_by_field_name("left") else {
            return;
        };
        let values = right.map(named_children).unwrap_or_default();
        let hints: Vec<Option<String>> = if values.len() == named_children(left).len() {
            values.iter().map(|v| self.static_hint(*v)).collect()
        } else {
            Vec::new()
        };
        self.declare_local_vars(left, node, &hints, true);
    }

    fn visit_binding_clause(&mut self, node: Node<'a>) {
        if let Some(right) = node.child_by_field_name("right") {
            self.visit(right);
        }
        let Some(left) = node.child_by_field_name("left") else {
            return;
        };
        if has_token(node, ":=") {
            self.declare_local_vars(left, node, &[], false);
        } else {
            self.visit(left);
        }
    }

    fn visit_selector(&mut self, node: Node<'a>) {
        let (Some(operand), Some(field)) = (
            node.child_by_field_name("operand"),
            node.child_by_field_name("field"),
        ) else {
            self.visit_children(node);
            return;
        };

        if operand.kind() == "identifier" {
            if let Resolution::Package {
                import_path,
                location,
            } = self.lookup(self.text(operand))
            {
                self.record_ref(
                    operand,
                    Resolution::Package {
                        import_path: import_path.clone(),
                        location,
                    },
                );
                self.resolve_package_member(&import_path, operand, field);
                return;
            }
        }

        self.visit(operand);
        let name = self.text(field);
        let resolution = self
            .expr_type(operand)
            .and_then(|t| self.find_member(&t, name, 0))
            .unwrap_or(Resolution::Unresolved);
        self.record_ref(field, resolution);
    }

    fn visit_qualified_type(&mut self, node: Node<'a>) {
        let (Some(package), Some(name)) = (
            node.child_by_field_name("package"),
            node.child_by_field_name("name"),
        ) else {
            self.visit_children(node);
            return;
        };
        match self.lookup(self.text(package)) {
            Resolution::Package {
                import_path,
                location,
            } => {
                self.record_ref(
                    package,
                    Resolution::Package {
                        import_path: import_path.clone(),
                        location,
                    },
                );
                self.resolve_package_member(&import_path, package, name);
            }
            _ => {
                if self.error_depth == 0 {
                    let message = format!("undefined: {}", self.text(package));
                    self.report(package, Severity::Error, DiagnosticKind::Type, message);
                }
                self.record_ref(package, Resolution::Unresolved);
                self.record_ref(name, Resolution::Unresolved);
            }
        }
    }

    fn resolve_package_member(&mut self, import_path: &str, package: Node<'a>, member: Node<'a>) {
        let name = self.text(member);
        let summaries: &'a HashMap<String, Arc<PackageSummary>> = self.summaries;
        let resolution = match summaries.get(import_path) {
            Some(summary) => match summary.member(name) {
                Some(decl) if decl.exported() => Resolution::Imported {
                    import_path: import_path.to_string(),
                    name: name.to_string(),
                    container: None,
                    location: Some(decl.location.clone()),
                },
                found => {
                    if self.error_depth == 0 {
                        let message = match found {
                            Some(_) => format!("name {} not exported by package {}", name, summary.name),
                            None => format!("undefined: {}.{}", self.text(package), name),
                        };
                        self.report(member, Severity::Error, DiagnosticKind::Type, message);
                    }
                    Resolution::Unresolved
                }
            },
            None => Resolution::Unresolved,
        };
        self.record_ref(member, resolution);
    }

    fn visit_composite_literal(&mut self, node: Node<'a>) {
        let ty = node.child_by_field_name("type");
        if let Some(ty) = ty {
            self.visit(ty);
        }
        let type_ref = ty.and_then(|t| self.type_ref_of(t));
        if let Some(body) = node.child_by_field_name("body") {
            self.visit_literal_value(body, type_ref.as_ref());
        }
    }

    fn visit_literal_value(&mut self, body: Node<'a>, ty: Option<&TypeRef>) {
        for element in named_children(body) {
            match element.kind() {
                "keyed_element" => {
                    let parts = named_children(element);
                    let key = element
                        .child_by_field_name("key")
                        .or_else(|| parts.first().copied());
                    let value = element
                        .child_by_field_name("value")
                        .or_else(|| parts.get(1).copied());
                    if let Some(key) = key {
                        self.visit_literal_key(key, ty);
                    }
                    if let Some(value) = value {
                        self.visit_literal_element(value);
                    }
                }
                "literal_value" => self.visit_literal_value(element, None),
                _ => self.visit_literal_element(element),
            }
        }
    }

    fn visit_literal_element(&mut self, element: Node<'a>) {
        if element.kind() != "literal_element" {
            if element.kind() == "literal_value" {
                self.visit_literal_value(element, None);
            } else {
                self.visit(element);
            }
            return;
        }
        for child in named_children(element) {
            if child.kind() == "literal_value" {
                self.visit_literal_value(child, None);
            } else {
                self.visit(child);
            }
        }
    }

    fn visit_literal_key(&mut self, key: Node<'a>, ty: Option<&TypeRef>) {
        let ident = match key.kind() {
            "field_identifier" | "identifier" => Some(key),
            "literal_element" => {
                let children = named_children(key);
                match children.as_slice() {
                    [only] if only.kind() == "identifier" => Some(*only),
                    _ => None,
                }
            }
            _ => None,
        };
        let Some(ident) = ident else {
            self.visit_literal_element(key);
            return;
        };
        let name = self.text(ident);
        match ty.and_then(|t| self.find_member(t, name, 0)) {
            Some(resolution) => self.record_ref(ident, resolution),
            // Map keys, or a struct type that is not known here
            None if key.kind() != "field_identifier" => self.resolve_identifier(ident, false),
            None => self.record_ref(ident, Resolution::Unresolved),
        }
    }

    fn resolve_identifier(&mut self, node: Node<'a>, report: bool) {
        let name = self.text(node);
        if name.is_empty() || name == "_" {
            return;
        }
        let resolution = self.lookup(name);
        if resolution == Resolution::Unresolved && report && self.error_depth == 0 {
            self.report(
                node,
                Severity::Error,
                DiagnosticKind::Type,
                format!("undefined: {}", name),
            );
        }
        self.record_ref(node, resolution);
    }

    fn record_ref(&mut self, node: Node<'a>, resolution: Resolution) {
        if self.declared_at.contains(&(self.file, node.start_byte())) {
            return;
        }
        match &resolution {
            Resolution::Local(id) => {
                if let Some(used) = self.used.get_mut(*id) {
                    *used = true;
                }
            }
            Resolution::Package { import_path, .. } | Resolution::Imported { import_path, .. } => {
                self.mark_import_used(import_path)
            }
            _ => {}
        }
        self.refs.push(Reference {
            file: self.file,
            range: self.range(node),
            start_byte: node.start_byte(),
            end_byte: node.end_byte(),
            name: self.text(node).to_string(),
            resolution,
            is_declaration: false,
        });
    }

    fn mark_import_used(&mut self, import_path: &str) {
        for (i, import) in self.imports.iter().enumerate() {
            if import.file == self.file && import.path == import_path {
                self.import_used[i] = true;
            }
        }
    }

    fn file_imports(&self) -> impl Iterator<Item = &ImportDecl> + '_ {
        let file = self.file;
        self.imports.iter().filter(move |i| i.file == file)
    }

    fn lookup(&self, name: &str) -> Resolution {
        for scope in self.scopes.iter().rev() {
            if let Some(id) = scope.names.get(name) {
                return Resolution::Local(*id);
            }
        }
        if let Some(id) = self.package_scope.get(name) {
            return Resolution::Local(*id);
        }
        if let Some(import) = self.file_imports().find(|i| i.local_name == name) {
            if import.local_name != "_" && import.local_name != "." {
                return Resolution::Package {
                    import_path: import.path.clone(),
                    location: self
                        .summaries
                        .get(&import.path)
                        .and_then(|s| s.package_clause.clone()),
                };
            }
        }
        for import in self.file_imports().filter(|i| i.local_name == ".") {
            if let Some(decl) = self
                .summaries
                .get(&import.path)
                .and_then(|s| s.member(name))
                .filter(|d| d.exported())
            {
                return Resolution::Imported {
                    import_path: import.path.clone(),
                    name: name.to_string(),
                    container: None,
                    location: Some(decl.location.clone()),
                };
            }
        }
        if universe::is_predeclared(name) {
            return Resolution::Builtin;
        }
        Resolution::Unresolved
    }

    fn hint_to_type(&self, hint: &str) -> Option<TypeRef> {
        match hint.split_once('.') {
            Some((package, name)) => match self.lookup(package) {
                Resolution::Package { import_path, .. } => Some(TypeRef::Imported {
                    import_path,
                    name: name.to_string(),
                }),
                _ => None,
            },
            None => Some(TypeRef::Local(hint.to_string())),
        }
    }

    fn imported_member_type(&self, import_path: &str, name: &str, container: Option<&str>) -> Option<TypeRef> {
        let summary = self.summaries.get(import_path)?;
        let decl = match container {
            Some(container) => summary.type_member(container, name)?,
            None => summary.member(name)?,
        };
        if decl.kind == DeclKind::Type && container.is_none() {
            return Some(TypeRef::Imported {
                import_path: import_path.to_string(),
                name: name.to_string(),
            });
        }
        let hint = decl.type_hint.as_deref()?;
        // Qualified hints refer to the imported package's own imports
        if hint.contains('.') {
            return None;
        }
        Some(TypeRef::Imported {
            import_path: import_path.to_string(),
            name: hint.to_string(),
        })
    }

    fn type_ref_of(&self, ty: Node<'a>) -> Option<TypeRef> {
        match ty.kind() {
            "type_identifier" | "identifier" => {
                let name = self.text(ty);
                match self.lookup(name) {
                    Resolution::Local(id) => {
                        let decl = &self.decls[id];
                        matches!(decl.kind, DeclKind::Type | DeclKind::TypeParam)
                            .then(|| TypeRef::Local(decl.name.clone()))
                    }
                    Resolution::Imported { import_path, .. } => Some(TypeRef::Imported {
                        import_path,
                        name: name.to_string(),
                    }),
                    _ => None,
                }
            }
            "qualified_type" => {
                let package = ty.child_by_field_name("package")?;
                let name = ty.child_by_field_name("name")?;
                match self.lookup(self.text(package)) {
                    Resolution::Package { import_path, .. } => Some(TypeRef::Imported {
                        import_path,
                        name: self.text(name).to_string(),
                    }),
                    _ => None,
                }
            }
            "generic_type" => self.type_ref_of(ty.child_by_field_name("type")?),
            "pointer_type" | "parenthesized_type" => {
                self.type_ref_of(named_children(ty).into_iter().next()?)
            }
            _ => None,
        }
    }

    fn expr_type(&self, expr: Node<'a>) -> Option<TypeRef> {
        match expr.kind() {
            "identifier" | "type_identifier" => match self.lookup(self.text(expr)) {
                Resolution::Local(id) => {
                    let decl = &self.decls[id];
                    match decl.kind {
                        DeclKind::Type | DeclKind::TypeParam => Some(TypeRef::Local(decl.name.clone())),
                        _ => self.hint_to_type(decl.type_hint.as_deref()?),
                    }
                }
                Resolution::Imported {
                    import_path,
                    name,
                    container,
                    ..
                } => self.imported_member_type(&import_path, &name, container.as_deref()),
                _ => None,
            },
            "selector_expression" => {
                let operand = expr.child_by_field_name("operand")?;
                let field = self.text(expr.child_by_field_name("field")?);
                if operand.kind() == "identifier" {
                    if let Resolution::Package { import_path, .. } = self.lookup(self.text(operand)) {
                        return self.imported_member_type(&import_path, field, None);
                    }
                }
                match self.find_member(&self.expr_type(operand)?, field, 0)? {
                    Resolution::Local(id) => {
                        let decl = &self.decls[id];
                        self.hint_to_type(decl.type_hint.as_deref()?)
                    }
                    Resolution::Imported {
                        import_path,
                        name,
                        container,
                        ..
                    } => self.imported_member_type(&import_path, &name, container.as_deref()),
                    _ => None,
                }
            }
            "call_expression" => self.expr_type(expr.child_by_field_name("function")?),
            "unary_expression" | "parenthesized_expression" => {
                let inner = expr
                    .child_by_field_name("operand")
                    .or_else(|| named_children(expr).into_iter().next())?;
                self.expr_type(inner)
            }
            "composite_literal" => self.type_ref_of(expr.child_by_field_name("type")?),
            "qualified_type" | "generic_type" | "pointer_type" => self.type_ref_of(expr),
            _ => None,
        }
    }

    fn find_member(&self, ty: &TypeRef, name: &str, depth: usize) -> Option<Resolution> {
        match ty {
            TypeRef::Local(container) => {
                let members: Vec<DeclId> = self
                    .decls
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| d.container.as_deref() == Some(container.as_str()))
                    .map(|(id, _)| id)
                    .collect();
                if let Some(id) = members.iter().find(|id| self.decls[**id].name == name) {
                    return Some(Resolution::Local(*id));
                }
                if depth >= MAX_EMBEDDING_DEPTH {
                    return None;
                }
                members.iter().find_map(|id| {
                    let decl = &self.decls[*id];
                    let hint = decl.type_hint.as_deref()?;
                    let embedded = decl.kind == DeclKind::Field
                        && hint.rsplit('.').next() == Some(decl.name.as_str());
                    if !embedded {
                        return None;
                    }
                    self.find_member(&self.hint_to_type(hint)?, name, depth + 1)
                })
            }
            TypeRef::Imported {
                import_path,
                name: container,
            } => {
                let summary = self.summaries.get(import_path)?;
                let decl = summary.type_member(container, name)?;
                Some(Resolution::Imported {
                    import_path: import_path.clone(),
                    name: name.to_string(),
                    container: Some(container.clone()),
                    location: Some(decl.location.clone()),
                })
            }
        }
    }

    /// Type name of an initializer, for member resolution on the variable.
    fn static_hint(&self, expr: Node<'a>) -> Option<String> {
        match self.expr_type(expr)? {
            TypeRef::Local(name) => Some(name),
            TypeRef::Imported { import_path, name } => {
                let import = self
                    .imports
                    .iter()
                    .find(|i| i.file == self.file && i.path == import_path)?;
                if import.local_name == "." {
                    Some(name)
                } else {
                    Some(format!("{}.{}", import.local_name, name))
                }
            }
        }
    }

    fn finish(mut self, unresolved: &HashSet<String>) -> (SymbolTable, Vec<UnitDiagnostic>) {
        for (i, import) in self.imports.iter().enumerate() {
            let path = &self.files[import.file].path;
            if import.path == "C" {
                continue;
            }
            if !self.import_used[i] && import.local_name != "_" {
                let message = if import.aliased && import.local_name != "." {
                    format!("\"{}\" imported as {} and not used", import.path, import.local_name)
                } else {
                    format!("\"{}\" imported and not used", import.path)
                };
                self.diagnostics.push(UnitDiagnostic {
                    path: path.clone(),
                    range: import.range,
                    severity: Severity::Error,
                    kind: DiagnosticKind::Type,
                    message,
                });
            }
            if unresolved.contains(&import.path) {
                self.diagnostics.push(UnitDiagnostic {
                    path: path.clone(),
                    range: import.range,
                    severity: Severity::Warning,
                    kind: DiagnosticKind::Import,
                    message: format!("could not import {} (no package found)", import.path),
                });
            }
        }

        self.refs.sort_by_key(|r| (r.file, r.start_byte));
        let symbols = SymbolTable {
            decls: self.decls,
            references: self.refs,
            imports: self.imports,
            package_scope: self.package_scope,
        };
        (symbols, self.diagnostics)
    }
}

fn value_kind(node: Node) -> DeclKind {
    if node.kind() == "const_declaration" {
        DeclKind::Const
    } else {
        DeclKind::Var
    }
}

impl Toolchain for GoToolchain {
    fn scan_header(&self, source: &str) -> FileHeader {
        let Some(tree) = parser_pool::parse_go(source) else {
            return FileHeader::default();
        };
        let root = tree.root_node();
        let text = |node: Node| source.get(node.byte_range()).unwrap_or("").to_string();
        let package = package_identifier(root).map(text);
        let imports = named_children(root)
            .into_iter()
            .filter(|n| n.kind() == "import_declaration")
            .flat_map(import_specs)
            .filter_map(|spec| spec.child_by_field_name("path"))
            .map(|path| unquote(&text(path)).to_string())
            .filter(|path| !path.is_empty())
            .collect();
        FileHeader { package, imports }
    }

    fn summarize(
        &self,
        key: &UnitKey,
        import_path: Option<&str>,
        files: &[SourceFile],
        cancel: &CancellationToken,
    ) -> Result<PackageSummary, ToolchainError> {
        let parsed = parse_files(files, cancel)?;
        let no_imports = HashMap::new();
        let mut checker = Checker::new(&parsed, &no_imports);
        for i in 0..parsed.len() {
            if cancel.is_cancelled() {
                return Err(ToolchainError::Cancelled);
            }
            checker.collect_file(i);
        }

        let mut members = HashMap::new();
        let mut type_members = Vec::new();
        for decl in checker.decls {
            if !decl.package_level {
                continue;
            }
            match decl.kind {
                DeclKind::Method | DeclKind::Field => type_members.push(decl),
                DeclKind::Func if decl.name == "init" || decl.name == "_" => {}
                _ => {
                    members.entry(decl.name.clone()).or_insert(decl);
                }
            }
        }

        let package_clause = parsed
            .iter()
            .filter(|f| !f.is_test)
            .chain(parsed.iter().filter(|f| f.is_test))
            .find_map(package_clause_location);
        let name = parsed
            .iter()
            .map(|f| f.package_name.as_str())
            .find(|n| !n.is_empty())
            .unwrap_or(key.package.as_str())
            .to_string();

        Ok(PackageSummary {
            key: key.clone(),
            generation: 0,
            name,
            import_path: import_path.map(str::to_string),
            package_clause,
            members,
            type_members,
            file_paths: parsed.iter().map(|f| f.path.clone()).collect(),
        })
    }

    fn check(
        &self,
        input: CheckInput,
        cancel: &CancellationToken,
    ) -> Result<CheckedPackage, ToolchainError> {
        let files = parse_files(&input.files, cancel)?;
        let (symbols, mut diagnostics) = {
            let mut checker = Checker::new(&files, &input.imports);
            for i in 0..files.len() {
                if cancel.is_cancelled() {
                    return Err(ToolchainError::Cancelled);
                }
                checker.collect_file(i);
            }
            for i in 0..files.len() {
                if cancel.is_cancelled() {
                    return Err(ToolchainError::Cancelled);
                }
                checker.check_file(i);
            }
            checker.finish(&input.unresolved_imports)
        };
        for file in &files {
            syntax_errors(file, &mut diagnostics);
        }
        Ok(CheckedPackage {
            files,
            symbols,
            diagnostics,
        })
    }
}
