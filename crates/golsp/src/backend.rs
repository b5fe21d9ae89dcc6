//
// backend.rs
//
// LanguageServer implementation, diagnostics publishing and transports
//

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::Layer;
use tower_lsp::jsonrpc::Result;
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, ClientSocket, LanguageServer, LspService, Server};

use crate::config::{parse_server_config, DiagnosticsMode};
use crate::dispatch::{request_token, DispatchLayer, Dispatcher};
use crate::error::{respond, LspError};
use crate::handlers::{
    self, path_to_uri, uri_to_path, PartialResult, PartialResultParams, WorkspaceReference,
    WorkspaceReferencesParams,
};
use crate::state::ServerState;

const WATCHED_FILES_REGISTRATION: &str = "golsp-watched-files";

pub struct Backend {
    client: Client,
    state: Arc<ServerState>,
    /// Client can register file watchers dynamically
    watch_supported: AtomicBool,
}

impl Backend {
    pub fn new(client: Client) -> Self {
        Self::with_state(client, Arc::new(ServerState::default()))
    }

    pub fn with_state(client: Client, state: Arc<ServerState>) -> Self {
        Self {
            client,
            state,
            watch_supported: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Recompute diagnostics for `uri` after the debounce delay. Newer
    /// requests for the same document supersede this one.
    fn schedule_diagnostics(&self, uri: Url) {
        let config = self.state.config();
        if config.diagnostics_mode == DiagnosticsMode::Off {
            return;
        }
        let (token, sequence) = self.state.diagnostics.schedule(uri.clone());
        let delay = Duration::from_millis(config.diagnostics_debounce_ms);
        let client = self.client.clone();
        let state = self.state.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            publish_diagnostics(&client, &state, &uri, sequence, &token).await;
            state.diagnostics.complete(&uri, sequence);
        });
    }

    /// Re-run diagnostics for open documents, all of them or those in `dirs`.
    fn refresh_open_documents(&self, dirs: Option<&[PathBuf]>) {
        let paths = match dirs {
            Some(dirs) => dirs
                .iter()
                .flat_map(|dir| self.state.overlay().open_paths_in(dir))
                .collect(),
            None => self.state.overlay().open_paths(),
        };
        for path in paths {
            if let Some(uri) = path_to_uri(&path) {
                self.schedule_diagnostics(uri);
            }
        }
    }

    async fn register_file_watchers(&self) {
        let watchers = ["**/*.go", "**/go.mod", "**/go.work"]
            .into_iter()
            .map(|pattern| FileSystemWatcher {
                glob_pattern: GlobPattern::String(pattern.to_string()),
                kind: None,
            })
            .collect();
        let options = DidChangeWatchedFilesRegistrationOptions { watchers };
        let registration = Registration {
            id: WATCHED_FILES_REGISTRATION.to_string(),
            method: "workspace/didChangeWatchedFiles".to_string(),
            register_options: serde_json::to_value(options).ok(),
        };
        if let Err(err) = self.client.register_capability(vec![registration]).await {
            log::warn!("Failed to register file watchers: {}", err);
        }
    }

    /// `workspace/references`: references to a symbol named by package and
    /// name, streamed as `$/partialResult` batches when the client passes a
    /// partial result token.
    pub async fn workspace_references(
        &self,
        params: WorkspaceReferencesParams,
    ) -> Result<Vec<WorkspaceReference>> {
        let token = params.partial_result_token.clone();
        let client = self.client.clone();
        let result = handlers::workspace_references(&self.state, params, &request_token(), |batch| {
            let client = client.clone();
            let token = token.clone();
            async move {
                let Some(token) = token else {
                    return;
                };
                match serde_json::to_value(&batch) {
                    Ok(value) => {
                        client
                            .send_notification::<PartialResult>(PartialResultParams { token, value })
                            .await
                    }
                    Err(err) => log::error!("Failed to encode partial result: {}", err),
                }
            }
        })
        .await;
        respond(result.map(Some)).map(Option::unwrap_or_default)
    }
}

async fn publish_diagnostics(
    client: &Client,
    state: &ServerState,
    uri: &Url,
    sequence: u64,
    cancel: &CancellationToken,
) {
    let Some(path) = uri_to_path(uri) else {
        return;
    };
    let by_file = match handlers::unit_diagnostics(state, &path, cancel).await {
        Ok(by_file) => by_file,
        Err(LspError::Cancelled) => return,
        Err(err) if err.is_silent() => {
            log::debug!("No diagnostics for {}: {}", uri, err);
            vec![(path.clone(), Vec::new())]
        }
        Err(err) => {
            log::warn!("Diagnostics for {} failed: {}", uri, err);
            return;
        }
    };
    if cancel.is_cancelled() {
        return;
    }

    for (file, diagnostics) in by_file {
        let Some(file_uri) = path_to_uri(&file) else {
            continue;
        };
        if !state.diagnostics_gate.try_publish(&file_uri, sequence) {
            log::trace!("Skipping stale diagnostics for {} (sequence {})", file_uri, sequence);
            continue;
        }
        let version = state.overlay().version(&file);
        client.publish_diagnostics(file_uri, diagnostics, version).await;
    }
}

fn is_build_file(path: &Path) -> bool {
    matches!(
        path.file_name().and_then(|n| n.to_str()),
        Some("go.mod" | "go.work")
    )
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        log::info!("Initializing golsp {}", env!("CARGO_PKG_VERSION"));

        if let Some(options) = &params.initialization_options {
            let config = parse_server_config(options, &self.state.config());
            self.state.apply_config(config);
        }

        #[allow(deprecated)]
        let root = params
            .workspace_folders
            .as_ref()
            .and_then(|folders| folders.first())
            .map(|folder| folder.uri.clone())
            .or_else(|| params.root_uri.clone())
            .and_then(|uri| uri_to_path(&uri));
        if root.is_none() {
            log::info!("No workspace root; serving open documents only");
        }
        self.state.set_workspace_root(root);
        self.state.config().log_effective();

        let dynamic_watch = params
            .capabilities
            .workspace
            .as_ref()
            .and_then(|w| w.did_change_watched_files.as_ref())
            .and_then(|w| w.dynamic_registration)
            .unwrap_or(false);
        self.watch_supported.store(dynamic_watch, Ordering::Relaxed);

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::INCREMENTAL),
                        save: Some(TextDocumentSyncSaveOptions::Supported(true)),
                        ..Default::default()
                    },
                )),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                definition_provider: Some(OneOf::Left(true)),
                references_provider: Some(OneOf::Left(true)),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(vec![String::from(".")]),
                    ..Default::default()
                }),
                document_symbol_provider: Some(OneOf::Left(true)),
                signature_help_provider: Some(SignatureHelpOptions {
                    trigger_characters: Some(vec![String::from("("), String::from(",")]),
                    ..Default::default()
                }),
                workspace_symbol_provider: Some(OneOf::Left(true)),
                document_formatting_provider: Some(OneOf::Left(true)),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: String::from("golsp"),
                version: Some(String::from(env!("CARGO_PKG_VERSION"))),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        log::info!("golsp initialized");
        if self.state.start_warmup() {
            log::info!("Warming workspace index in the background");
        }
        if self.watch_supported.load(Ordering::Relaxed) {
            self.register_file_watchers().await;
        }
    }

    async fn shutdown(&self) -> Result<()> {
        log::info!("golsp shutting down");
        self.state.shutdown().await;
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let document = params.text_document;
        let Some(path) = uri_to_path(&document.uri) else {
            log::debug!("Ignoring non-file document {}", document.uri);
            return;
        };
        self.state
            .overlay()
            .open(&path, &document.text, document.version);
        self.schedule_diagnostics(document.uri);
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        let Some(path) = uri_to_path(&uri) else {
            return;
        };
        let applied = self.state.overlay().change(
            &path,
            params.text_document.version,
            &params.content_changes,
        );
        if let Err(err) = applied {
            log::error!("{}", LspError::from(err));
            return;
        }
        if self.state.config().diagnostics_mode == DiagnosticsMode::OnChange {
            self.schedule_diagnostics(uri);
        }
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        if self.state.config().diagnostics_mode == DiagnosticsMode::OnSave {
            self.schedule_diagnostics(params.text_document.uri);
        }
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        let Some(path) = uri_to_path(&uri) else {
            return;
        };
        self.state.diagnostics.cancel(&uri);
        self.state.overlay().close(&path);
        self.state.diagnostics_gate.clear(&uri);
        self.client.publish_diagnostics(uri, Vec::new(), None).await;

        // Siblings now see the file's disk content
        if let Some(dir) = path.parent() {
            self.refresh_open_documents(Some(&[dir.to_path_buf()]));
        }
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        let previous = self.state.config();
        let config = parse_server_config(&params.settings, &previous);
        let mode = config.diagnostics_mode;
        let index_enabled = config.global_index_enabled && !previous.global_index_enabled;
        let build_changed = self.state.apply_config(config);
        self.state.config().log_effective();

        // The index is rebuilt whatever the diagnostics mode
        if build_changed || index_enabled {
            self.state.start_warmup();
        }
        if mode == DiagnosticsMode::Off {
            self.state.diagnostics.cancel_all();
            return;
        }
        if build_changed {
            self.refresh_open_documents(None);
        }
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        let mut reset = false;
        let mut changed = Vec::new();
        for event in params.changes {
            let Some(path) = uri_to_path(&event.uri) else {
                continue;
            };
            if is_build_file(&path) {
                reset = true;
            } else if path.extension().is_some_and(|e| e == "go") {
                // Open buffers take precedence over the disk
                if self.state.overlay().is_open(&path) {
                    continue;
                }
                self.state.invalidate(&path);
                changed.push(path);
            }
        }

        if reset {
            log::info!("Module files changed, resetting caches");
            self.state.reset();
            self.state.start_warmup();
            self.refresh_open_documents(None);
        } else if !changed.is_empty() {
            let dirs = crate::loader::package_dirs(&changed);
            self.refresh_open_documents(Some(&dirs));
        }
    }

    async fn hover(&self, params: HoverParams) -> Result<Option<Hover>> {
        let position = params.text_document_position_params;
        respond(
            handlers::hover(
                &self.state,
                &position.text_document.uri,
                position.position,
                &request_token(),
            )
            .await,
        )
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        let position = params.text_document_position_params;
        respond(
            handlers::goto_definition(
                &self.state,
                &position.text_document.uri,
                position.position,
                &request_token(),
            )
            .await,
        )
    }

    async fn references(&self, params: ReferenceParams) -> Result<Option<Vec<Location>>> {
        let position = params.text_document_position;
        respond(
            handlers::references(
                &self.state,
                &position.text_document.uri,
                position.position,
                params.context.include_declaration,
                &request_token(),
            )
            .await,
        )
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let position = params.text_document_position;
        respond(
            handlers::completion(
                &self.state,
                &position.text_document.uri,
                position.position,
                &request_token(),
            )
            .await,
        )
    }

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> Result<Option<DocumentSymbolResponse>> {
        respond(
            handlers::document_symbol(&self.state, &params.text_document.uri, &request_token())
                .await,
        )
    }

    async fn signature_help(&self, params: SignatureHelpParams) -> Result<Option<SignatureHelp>> {
        let position = params.text_document_position_params;
        respond(
            handlers::signature_help(
                &self.state,
                &position.text_document.uri,
                position.position,
                &request_token(),
            )
            .await,
        )
    }

    async fn symbol(
        &self,
        params: WorkspaceSymbolParams,
    ) -> Result<Option<Vec<SymbolInformation>>> {
        respond(handlers::workspace_symbol(&self.state, &params.query, &request_token()).await)
    }

    async fn formatting(&self, params: DocumentFormattingParams) -> Result<Option<Vec<TextEdit>>> {
        respond(handlers::formatting(&self.state, &params.text_document.uri).await)
    }
}

/// A fresh server (its own state) wrapped in the dispatcher.
pub fn build_service() -> (Dispatcher<LspService<Backend>>, ClientSocket) {
    build_service_with_state(Arc::new(ServerState::default()))
}

/// A server over the given state, wrapped in the dispatcher.
pub fn build_service_with_state(
    state: Arc<ServerState>,
) -> (Dispatcher<LspService<Backend>>, ClientSocket) {
    let (service, socket) = LspService::build(move |client| Backend::with_state(client, state))
        .custom_method("workspace/references", Backend::workspace_references)
        .finish();
    (DispatchLayer.layer(service), socket)
}

pub async fn start_lsp() -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = build_service();
    Server::new(stdin, stdout, socket).serve(service).await;

    Ok(())
}

/// Accept connections on `addr` until the process is stopped. Each
/// connection gets its own server state.
pub async fn listen(addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;
    log::info!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        log::info!("Accepted connection from {}", peer);
        tokio::spawn(async move {
            let (read, write) = tokio::io::split(stream);
            let (service, socket) = build_service();
            Server::new(read, write, socket).serve(service).await;
            log::info!("Connection from {} closed", peer);
        });
    }
}
