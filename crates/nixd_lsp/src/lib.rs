mod ast_manager;
mod codec;
mod config;
mod convert;
mod diagnostics_mux;
mod dispatch;
mod drafts;
mod format;
mod ipc;
mod worker;
mod workers;

pub use config::Config;
pub use worker::{run_eval_worker, run_option_worker};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tower_lsp::jsonrpc::{Error as RpcError, Result};
use tower_lsp::lsp_types::request::{GotoDeclarationParams, GotoDeclarationResponse};
use tower_lsp::lsp_types::{
    CompletionList, CompletionOptions, CompletionParams, CompletionResponse,
    ConfigurationItem, DeclarationCapability, DidChangeConfigurationParams,
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DocumentFormattingParams, DocumentLink, DocumentLinkOptions, DocumentLinkParams,
    DocumentSymbol, DocumentSymbolParams, DocumentSymbolResponse, GotoDefinitionParams,
    GotoDefinitionResponse, Hover, HoverContents, HoverParams, HoverProviderCapability,
    InitializeParams, InitializeResult, InitializedParams, Location, MarkedString, MessageType,
    OneOf, Position, PrepareRenameResponse, Range, RenameOptions, RenameParams,
    ServerCapabilities, ServerInfo, SymbolKind, TextDocumentPositionParams,
    TextDocumentSyncCapability, TextDocumentSyncKind, TextDocumentSyncOptions,
    TextDocumentSyncSaveOptions, TextEdit, Url, WorkDoneProgressOptions, WorkspaceEdit,
};
use tower_lsp::{Client, LanguageServer, LspService, Server};

use nixd_syntax::{CompletionContext, SymbolEntry, SymbolEntryKind};

use crate::ast_manager::AstManager;
use crate::diagnostics_mux::DiagnosticsMux;
use crate::drafts::{Draft, DraftStore};
use crate::ipc::{AttrPathParams, EvalSnapshot, OptionDecl, OptionsSnapshot};
use crate::workers::{Worker, WorkerClient, WorkerEvent, WorkerKind, WorkerPool};

/// Wall-clock budgets for worker round trips. Late replies are dropped
/// by the dispatcher, never awaited past these.
const OPTION_DECLARATION_BUDGET: Duration = Duration::from_millis(20);
const OPTION_COMPLETION_BUDGET: Duration = Duration::from_millis(100);
const DEFINITION_BUDGET: Duration = Duration::from_secs(1);
const HOVER_BUDGET: Duration = Duration::from_secs(2);
const EVAL_COMPLETION_BUDGET: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub config: Config,
    /// Keep every worker alive and drain their finish signals before
    /// shutdown completes. Used by the test harness.
    pub wait_workers: bool,
}

struct Backend {
    client: Client,
    config: Arc<Mutex<Config>>,
    drafts: Arc<Mutex<DraftStore>>,
    ast: AstManager,
    workspace_version: Arc<AtomicU64>,
    eval_workers: Arc<Mutex<WorkerPool>>,
    option_workers: Arc<Mutex<WorkerPool>>,
    worker_events: mpsc::UnboundedSender<WorkerEvent>,
    finished: Arc<Semaphore>,
    spawned_workers: Arc<AtomicU64>,
    supports_pull_config: AtomicBool,
    wait_workers: bool,
}

impl Backend {
    async fn add_document(&self, uri: Url, text: String, version: Option<i64>) {
        let path = convert::path_from_uri(&uri);
        // The document changed, so whatever was reported for it is gone.
        self.client
            .publish_diagnostics(uri, Vec::new(), version.map(|v| v as i32))
            .await;

        let encoded = DraftStore::encode_version(version);
        let contents = {
            let mut drafts = self.drafts.lock().await;
            drafts.add(&path, &encoded, text);
            drafts
                .get(&path)
                .map(|draft| Arc::clone(&draft.contents))
        };
        if let Some(contents) = contents {
            self.ast
                .sched_parse(path, contents, version.unwrap_or(0));
        }
        self.update_workspace_version().await;
    }

    async fn remove_document(&self, uri: &Url) {
        let path = convert::path_from_uri(uri);
        self.drafts.lock().await.remove(&path);
        self.ast.evict(&path).await;
        self.client
            .publish_diagnostics(uri.clone(), Vec::new(), None)
            .await;
    }

    /// Every state-changing notification bumps the version exactly once
    /// and forks a fresh evaluator for the new state.
    async fn update_workspace_version(&self) {
        let version = self.workspace_version.fetch_add(1, Ordering::SeqCst) + 1;
        self.spawn_eval_worker(version).await;
    }

    async fn spawn_eval_worker(&self, version: u64) {
        let drafts = self.drafts.lock().await.snapshot();
        let snapshot = EvalSnapshot {
            workspace_version: version,
            drafts: drafts
                .into_iter()
                .map(|(path, draft)| ipc::DraftEntry {
                    path,
                    version: draft.numeric_version.unwrap_or(0),
                    text: (*draft.contents).clone(),
                })
                .collect(),
        };
        let Ok(params) = serde_json::to_value(&snapshot) else {
            return;
        };
        let capacity = self.config.lock().await.eval.workers;
        match Worker::spawn(
            WorkerKind::Eval,
            ipc::EVAL_SNAPSHOT,
            params,
            version,
            self.worker_events.clone(),
        )
        .await
        {
            Ok(worker) => {
                self.spawned_workers.fetch_add(1, Ordering::SeqCst);
                let mut pool = self.eval_workers.lock().await;
                pool.set_capacity(capacity);
                pool.push(worker);
            }
            Err(e) => tracing::warn!("cannot create eval worker: {e:#}"),
        }
    }

    async fn spawn_option_worker(&self) {
        let (enable, declarations_file) = {
            let config = self.config.lock().await;
            (config.options.enable, config.options.declarations.clone())
        };
        if !enable {
            return;
        }
        let declarations = declarations_file
            .as_deref()
            .map(|path| match load_option_declarations(path) {
                Ok(declarations) => declarations,
                Err(e) => {
                    tracing::warn!("cannot load option declarations: {e:#}");
                    HashMap::new()
                }
            })
            .unwrap_or_default();

        let version = self.workspace_version.load(Ordering::SeqCst);
        let snapshot = OptionsSnapshot {
            workspace_version: version,
            declarations,
        };
        let Ok(params) = serde_json::to_value(&snapshot) else {
            return;
        };
        match Worker::spawn(
            WorkerKind::Options,
            ipc::OPTIONS_SNAPSHOT,
            params,
            version,
            self.worker_events.clone(),
        )
        .await
        {
            Ok(worker) => {
                self.spawned_workers.fetch_add(1, Ordering::SeqCst);
                self.option_workers.lock().await.push(worker);
            }
            Err(e) => tracing::warn!("cannot create option worker: {e:#}"),
        }
    }

    async fn update_config(&self, new_config: Config) {
        *self.config.lock().await = new_config;
        self.spawn_option_worker().await;
        self.update_workspace_version().await;
    }

    async fn fetch_config(&self) {
        if !self.supports_pull_config.load(Ordering::SeqCst) {
            return;
        }
        let items = vec![ConfigurationItem {
            scope_uri: None,
            section: Some("nixd".to_string()),
        }];
        match self.client.configuration(items).await {
            Ok(mut values) => {
                if values.is_empty() {
                    return;
                }
                match serde_json::from_value::<Config>(values.remove(0)) {
                    Ok(config) => self.update_config(config).await,
                    Err(e) => tracing::warn!("client sent malformed configuration: {e}"),
                }
            }
            Err(e) => tracing::debug!("workspace/configuration failed: {e}"),
        }
    }

    async fn eval_clients(&self) -> Vec<WorkerClient> {
        self.eval_workers.lock().await.clients()
    }

    async fn option_clients(&self) -> Vec<WorkerClient> {
        self.option_workers.lock().await.clients()
    }

    async fn draft_for(&self, uri: &Url) -> Option<(String, Draft)> {
        let path = convert::path_from_uri(uri);
        let draft = self.drafts.lock().await.get(&path)?;
        Some((path, draft))
    }

    async fn options_completions(
        &self,
        draft: &Draft,
        position: Position,
        triggered_by_dot: bool,
    ) -> Option<CompletionList> {
        if !self.config.lock().await.options.enable {
            return None;
        }
        let mut attr_path = String::new();
        if triggered_by_dot {
            if let Some(offset) = drafts::offset_at(&draft.contents, position) {
                attr_path = attr_path_before(&draft.contents, offset);
            }
        }
        let params = serde_json::to_value(AttrPathParams { path: attr_path }).ok()?;
        let replies = dispatch::ask_wc(
            self.option_clients().await,
            ipc::OPTION_COMPLETION,
            params,
            OPTION_COMPLETION_BUDGET,
        )
        .await;
        let picked = dispatch::latest_match_or(replies, |v| !v.is_null(), Value::Null);
        serde_json::from_value(picked).ok()
    }

    async fn eval_completions(&self, params: &CompletionParams) -> Option<CompletionList> {
        let value = serde_json::to_value(params).ok()?;
        let replies = dispatch::ask_wc(
            self.eval_clients().await,
            ipc::COMPLETION,
            value,
            EVAL_COMPLETION_BUDGET,
        )
        .await;
        let picked = dispatch::latest_match_or(replies, |v| !v.is_null(), Value::Null);
        serde_json::from_value(picked).ok()
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        let pull_config = params
            .capabilities
            .workspace
            .as_ref()
            .and_then(|workspace| workspace.configuration)
            .unwrap_or(false);
        self.supports_pull_config
            .store(pull_config, Ordering::SeqCst);

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::INCREMENTAL),
                        save: Some(TextDocumentSyncSaveOptions::Supported(true)),
                        ..TextDocumentSyncOptions::default()
                    },
                )),
                declaration_provider: Some(DeclarationCapability::Simple(true)),
                definition_provider: Some(OneOf::Left(true)),
                document_link_provider: Some(DocumentLinkOptions {
                    resolve_provider: Some(false),
                    work_done_progress_options: WorkDoneProgressOptions::default(),
                }),
                document_symbol_provider: Some(OneOf::Left(true)),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                document_formatting_provider: Some(OneOf::Left(true)),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(vec![".".to_string()]),
                    ..CompletionOptions::default()
                }),
                rename_provider: Some(OneOf::Right(RenameOptions {
                    prepare_provider: Some(true),
                    work_done_progress_options: WorkDoneProgressOptions::default(),
                })),
                ..ServerCapabilities::default()
            },
            server_info: Some(ServerInfo {
                name: "nixd".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        })
    }

    async fn initialized(&self, _params: InitializedParams) {
        self.client
            .log_message(MessageType::INFO, "nixd initialized")
            .await;
        self.fetch_config().await;
    }

    async fn shutdown(&self) -> Result<()> {
        if self.wait_workers {
            let spawned = self.spawned_workers.load(Ordering::SeqCst) as u32;
            if spawned > 0 {
                let _ = self.finished.acquire_many(spawned).await;
            }
        }
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let uri = params.text_document.uri;
        let version = i64::from(params.text_document.version);
        self.add_document(uri, params.text_document.text, Some(version))
            .await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        let Some((path, draft)) = self.draft_for(&uri).await else {
            tracing::info!(
                "change for document that was never opened: {}",
                uri.as_str()
            );
            return;
        };

        let mut text = (*draft.contents).clone();
        for change in &params.content_changes {
            match drafts::apply_change(&text, change) {
                Ok(updated) => text = updated,
                Err(_) => {
                    // Better out of service than out of sync: drop the
                    // draft and let later requests answer neutrally.
                    tracing::warn!("failed to apply change to {path}; draft dropped");
                    self.remove_document(&uri).await;
                    self.update_workspace_version().await;
                    return;
                }
            }
        }
        let version = i64::from(params.text_document.version);
        self.add_document(uri, text, Some(version)).await;
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        self.remove_document(&params.text_document.uri).await;
        self.update_workspace_version().await;
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        if self.supports_pull_config.load(Ordering::SeqCst) {
            self.fetch_config().await;
            return;
        }
        let settings = params
            .settings
            .get("nixd")
            .cloned()
            .unwrap_or(params.settings);
        match serde_json::from_value::<Config>(settings) {
            Ok(config) => self.update_config(config).await,
            Err(e) => tracing::warn!("ignoring malformed configuration push: {e}"),
        }
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        let uri = params
            .text_document_position_params
            .text_document
            .uri
            .clone();
        let position = params.text_document_position_params.position;

        // Evaluated locations resolve through imports, so ask the eval
        // workers first and fall back to the static resolver.
        if let Ok(value) = serde_json::to_value(&params) {
            let replies = dispatch::ask_wc(
                self.eval_clients().await,
                ipc::DEFINITION,
                value,
                DEFINITION_BUDGET,
            )
            .await;
            if !replies.is_empty() {
                let picked =
                    dispatch::latest_match_or(replies, |v| !v.is_null(), Value::Null);
                if let Ok(location) = serde_json::from_value::<Location>(picked) {
                    return Ok(Some(GotoDefinitionResponse::Scalar(location)));
                }
            }
        }

        let Some((path, draft)) = self.draft_for(&uri).await else {
            tracing::info!("definition on unknown document {}", uri.as_str());
            return Ok(None);
        };
        let Some((file, _)) = self
            .ast
            .with_ast(&path, draft.numeric_version.unwrap_or(0))
            .await
        else {
            return Ok(None);
        };
        match file.definition(convert::position_from_lsp(position)) {
            Ok(span) => Ok(Some(GotoDefinitionResponse::Scalar(Location {
                uri,
                range: convert::span_to_range(span),
            }))),
            Err(e) => {
                // An error popup for every miss would be obnoxious.
                tracing::debug!("static definition: {e}");
                Ok(None)
            }
        }
    }

    async fn goto_declaration(
        &self,
        params: GotoDeclarationParams,
    ) -> Result<Option<GotoDeclarationResponse>> {
        if !self.config.lock().await.options.enable {
            return Ok(None);
        }
        let uri = &params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        let Some((_, draft)) = self.draft_for(uri).await else {
            return Ok(None);
        };
        let Some(offset) = drafts::offset_at(&draft.contents, position) else {
            return Ok(None);
        };
        let attr_path = attr_path_around(&draft.contents, offset);
        tracing::debug!("requesting option path {attr_path}");

        let Ok(value) = serde_json::to_value(AttrPathParams { path: attr_path }) else {
            return Ok(None);
        };
        let replies = dispatch::ask_wc(
            self.option_clients().await,
            ipc::OPTION_DECLARATION,
            value,
            OPTION_DECLARATION_BUDGET,
        )
        .await;
        let picked = dispatch::latest_match_or(replies, |v| !v.is_null(), Value::Null);
        Ok(serde_json::from_value::<Location>(picked)
            .ok()
            .map(GotoDeclarationResponse::Scalar))
    }

    async fn hover(&self, params: HoverParams) -> Result<Option<Hover>> {
        let Ok(value) = serde_json::to_value(&params) else {
            return Ok(None);
        };
        let replies =
            dispatch::ask_wc(self.eval_clients().await, ipc::HOVER, value, HOVER_BUDGET).await;
        let hovers: Vec<(u64, Option<Hover>)> = replies
            .into_iter()
            .map(|(version, reply)| (version, serde_json::from_value(reply).ok()))
            .collect();
        let picked = dispatch::latest_match_or(
            hovers,
            |hover| hover.as_ref().is_some_and(has_hover_content),
            None,
        );
        Ok(picked)
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let uri = params.text_document_position.text_document.uri.clone();
        let position = params.text_document_position.position;
        let Some((path, draft)) = self.draft_for(&uri).await else {
            return Err(visible_error(
                "requested completion list on unknown document",
            ));
        };
        let Some((file, _)) = self
            .ast
            .with_ast(&path, draft.numeric_version.unwrap_or(0))
            .await
        else {
            return Ok(None);
        };
        let triggered_by_dot = params
            .context
            .as_ref()
            .and_then(|context| context.trigger_character.as_deref())
            == Some(".");

        let response = match file.completion_context(convert::position_from_lsp(position)) {
            CompletionContext::AttrName => self
                .options_completions(&draft, position, triggered_by_dot)
                .await
                .map(CompletionResponse::List),
            CompletionContext::Value => {
                self.eval_completions(&params).await.map(CompletionResponse::List)
            }
            CompletionContext::Unknown => {
                let mut list = CompletionList {
                    is_incomplete: true,
                    items: Vec::new(),
                };
                if let Some(options) = self
                    .options_completions(&draft, position, triggered_by_dot)
                    .await
                {
                    list.items.extend(options.items);
                }
                if let Some(eval) = self.eval_completions(&params).await {
                    list.items.extend(eval.items);
                }
                Some(CompletionResponse::List(list))
            }
        };
        Ok(response)
    }

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> Result<Option<DocumentSymbolResponse>> {
        let Some((path, draft)) = self.draft_for(&params.text_document.uri).await else {
            return Ok(None);
        };
        let Some((file, _)) = self
            .ast
            .with_ast(&path, draft.numeric_version.unwrap_or(0))
            .await
        else {
            return Ok(None);
        };
        let symbols = file
            .document_symbols()
            .into_iter()
            .map(symbol_to_lsp)
            .collect();
        Ok(Some(DocumentSymbolResponse::Nested(symbols)))
    }

    async fn document_link(
        &self,
        params: DocumentLinkParams,
    ) -> Result<Option<Vec<DocumentLink>>> {
        let Some((path, draft)) = self.draft_for(&params.text_document.uri).await else {
            return Ok(None);
        };
        let Some((file, _)) = self
            .ast
            .with_ast(&path, draft.numeric_version.unwrap_or(0))
            .await
        else {
            return Ok(None);
        };
        let links = file
            .document_links()
            .into_iter()
            .filter_map(|(span, target)| {
                Some(DocumentLink {
                    range: convert::span_to_range(span),
                    target: Some(Url::from_file_path(target).ok()?),
                    tooltip: None,
                    data: None,
                })
            })
            .collect();
        Ok(Some(links))
    }

    async fn rename(&self, params: RenameParams) -> Result<Option<WorkspaceEdit>> {
        let uri = params.text_document_position.text_document.uri.clone();
        let position = params.text_document_position.position;
        let Some((path, draft)) = self.draft_for(&uri).await else {
            return Err(visible_error("rename on unknown document"));
        };
        let Some((file, _)) = self
            .ast
            .with_ast(&path, draft.numeric_version.unwrap_or(0))
            .await
        else {
            return Err(visible_error("no syntax tree available"));
        };
        let Some(edits) = file.rename(convert::position_from_lsp(position), &params.new_name)
        else {
            return Err(visible_error("no rename edits available"));
        };
        let edits: Vec<TextEdit> = edits
            .into_iter()
            .map(|(span, new_text)| TextEdit {
                range: convert::span_to_range(span),
                new_text,
            })
            .collect();
        Ok(Some(WorkspaceEdit {
            changes: Some(HashMap::from([(uri, edits)])),
            ..WorkspaceEdit::default()
        }))
    }

    async fn prepare_rename(
        &self,
        params: TextDocumentPositionParams,
    ) -> Result<Option<PrepareRenameResponse>> {
        let Some((path, draft)) = self.draft_for(&params.text_document.uri).await else {
            return Ok(None);
        };
        let Some((file, _)) = self
            .ast
            .with_ast(&path, draft.numeric_version.unwrap_or(0))
            .await
        else {
            return Ok(None);
        };
        match file.prepare_rename(convert::position_from_lsp(params.position)) {
            Some(span) => Ok(Some(PrepareRenameResponse::Range(convert::span_to_range(
                span,
            )))),
            None => Err(visible_error("no rename edits available")),
        }
    }

    async fn formatting(
        &self,
        params: DocumentFormattingParams,
    ) -> Result<Option<Vec<TextEdit>>> {
        let Some((_, draft)) = self.draft_for(&params.text_document.uri).await else {
            return Ok(None);
        };
        let command = self.config.lock().await.formatting.command.clone();
        match format::run_formatter(&command, &draft.contents).await {
            Ok(formatted) => Ok(Some(vec![TextEdit {
                range: Range::new(Position::new(0, 0), Position::new(u32::MAX, u32::MAX)),
                new_text: formatted,
            }])),
            Err(e) => {
                tracing::warn!("formatting failed: {e:#}");
                Err(visible_error(format!("no formatting response: {e:#}")))
            }
        }
    }
}

/// Forward worker notifications to the client, gated by the mux so
/// stale diagnostics never clobber fresh ones.
async fn pump_worker_events(
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    client: Client,
    mux: Arc<Mutex<DiagnosticsMux>>,
    finished: Arc<Semaphore>,
) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Diagnostics(batch) => {
                let version = batch.workspace_version;
                let publishable = mux.lock().await.apply(version, batch.diagnostics);
                match publishable {
                    Some(notifications) => {
                        for entry in notifications {
                            client
                                .publish_diagnostics(entry.uri, entry.diagnostics, None)
                                .await;
                        }
                    }
                    None => {
                        tracing::debug!("dropping stale diagnostics from worker v{version}");
                    }
                }
            }
            WorkerEvent::Finished => {
                finished.add_permits(1);
            }
        }
    }
}

pub async fn run(options: ServerOptions) {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = LspService::new(move |client| {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mux = Arc::new(Mutex::new(DiagnosticsMux::default()));
        let finished = Arc::new(Semaphore::new(0));
        tokio::spawn(pump_worker_events(
            events_rx,
            client.clone(),
            Arc::clone(&mux),
            Arc::clone(&finished),
        ));
        Backend {
            client,
            config: Arc::new(Mutex::new(options.config.clone())),
            drafts: Arc::new(Mutex::new(DraftStore::default())),
            ast: AstManager::new(),
            workspace_version: Arc::new(AtomicU64::new(0)),
            eval_workers: Arc::new(Mutex::new(WorkerPool::new(3, options.wait_workers))),
            option_workers: Arc::new(Mutex::new(WorkerPool::new(1, options.wait_workers))),
            worker_events: events_tx,
            finished,
            spawned_workers: Arc::new(AtomicU64::new(0)),
            supports_pull_config: AtomicBool::new(false),
            wait_workers: options.wait_workers,
        }
    });
    Server::new(stdin, stdout, socket).serve(service).await;
}

fn visible_error(message: impl Into<String>) -> RpcError {
    let mut error = RpcError::internal_error();
    error.message = message.into().into();
    error
}

fn has_hover_content(hover: &Hover) -> bool {
    match &hover.contents {
        HoverContents::Markup(markup) => !markup.value.is_empty(),
        HoverContents::Scalar(MarkedString::String(text)) => !text.is_empty(),
        _ => true,
    }
}

#[allow(deprecated)]
fn symbol_to_lsp(entry: SymbolEntry) -> DocumentSymbol {
    let kind = match entry.kind {
        SymbolEntryKind::Attribute => SymbolKind::FIELD,
        SymbolEntryKind::Function => SymbolKind::FUNCTION,
        SymbolEntryKind::Value => SymbolKind::VARIABLE,
    };
    let children: Vec<DocumentSymbol> =
        entry.children.into_iter().map(symbol_to_lsp).collect();
    DocumentSymbol {
        name: entry.name,
        detail: None,
        kind,
        tags: None,
        deprecated: None,
        range: convert::span_to_range(entry.span),
        selection_range: convert::span_to_range(entry.selection),
        children: if children.is_empty() {
            None
        } else {
            Some(children)
        },
    }
}

fn load_option_declarations(path: &str) -> anyhow::Result<HashMap<String, OptionDecl>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading option declarations from {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("parsing option declarations in {path}"))
}

const ATTR_PATH_SEPARATORS: &[char] = &['\r', '\n', '\t', ' ', ';'];

/// Expand outward from `offset` over everything that is not a separator.
/// Declaration requests use this to recover the attribute path under the
/// cursor.
fn attr_path_around(code: &str, offset: usize) -> String {
    let is_separator = |c: char| ATTR_PATH_SEPARATORS.contains(&c);
    let mut from = offset.min(code.len());
    while let Some(ch) = code[..from].chars().next_back() {
        if is_separator(ch) {
            break;
        }
        from -= ch.len_utf8();
    }
    let mut to = offset.min(code.len());
    while let Some(ch) = code[to..].chars().next() {
        if is_separator(ch) {
            break;
        }
        to += ch.len_utf8();
    }
    code[from..to].trim_matches(ATTR_PATH_SEPARATORS).to_string()
}

/// The token after the last space before `offset`. Option completion
/// inherits this split; attribute paths containing spaces defeat it.
/// TODO: derive the path from the attrpath node under the cursor once
/// completion carries the AST context this far.
fn attr_path_before(code: &str, offset: usize) -> String {
    let truncated = &code[..offset.min(code.len())];
    truncated
        .rsplit(' ')
        .next()
        .unwrap_or_default()
        .trim_matches(ATTR_PATH_SEPARATORS)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_path_expands_around_the_cursor() {
        let code = "  services.nginx.enable = true;\n";
        let offset = code.find("nginx").unwrap();
        assert_eq!(attr_path_around(code, offset), "services.nginx.enable");
    }

    #[test]
    fn attr_path_stops_at_separators() {
        let code = "foo bar.baz;qux";
        let offset = code.find("baz").unwrap();
        assert_eq!(attr_path_around(code, offset), "bar.baz");
    }

    #[test]
    fn attr_path_at_document_edges() {
        assert_eq!(attr_path_around("services", 0), "services");
        assert_eq!(attr_path_around("services", 8), "services");
        assert_eq!(attr_path_around("", 0), "");
    }

    #[test]
    fn attr_path_before_takes_the_last_word() {
        let code = "config = services.nginx.";
        assert_eq!(attr_path_before(code, code.len()), "services.nginx.");
    }

    #[test]
    fn hover_content_detection() {
        let empty = Hover {
            contents: HoverContents::Markup(tower_lsp::lsp_types::MarkupContent {
                kind: tower_lsp::lsp_types::MarkupKind::Markdown,
                value: String::new(),
            }),
            range: None,
        };
        assert!(!has_hover_content(&empty));
        let full = Hover {
            contents: HoverContents::Scalar(MarkedString::String("`x`".to_string())),
            range: None,
        };
        assert!(has_hover_content(&full));
    }
}
