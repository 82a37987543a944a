//! Worker-process entry points.
//!
//! A worker runs with its stdio rebound to controller-owned pipes. It
//! receives one bootstrap snapshot, reports diagnostics for it, signals
//! `finished`, and then answers requests against that frozen state until
//! the controller closes the pipe.

use std::collections::HashMap;

use anyhow::Result;
use serde_json::Value;
use tokio::io::BufReader;
use tower_lsp::lsp_types::{
    CompletionItem, CompletionItemKind, CompletionList, Documentation, Hover, HoverContents,
    Location, MarkupContent, MarkupKind, Position, Range, TextDocumentPositionParams, Url,
};

use nixd_syntax::ParsedFile;

use crate::codec;
use crate::convert;
use crate::ipc::{
    self, AttrPathParams, DiagnosticsBatch, EvalSnapshot, FileDiagnostics, OptionDecl,
    OptionsSnapshot,
};

pub async fn run_eval_worker() -> Result<()> {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut state: Option<EvalState> = None;

    while let Some(frame) = codec::read_frame(&mut reader).await? {
        let Some(method) = frame.get("method").and_then(Value::as_str) else {
            continue;
        };
        let method = method.to_string();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);

        if let Some(id) = frame.get("id").cloned() {
            let result = state
                .as_ref()
                .map_or(Value::Null, |s| s.handle(&method, &params));
            codec::write_frame(&mut stdout, &ipc::response_frame(id, result)).await?;
            continue;
        }

        if method == ipc::EVAL_SNAPSHOT {
            match serde_json::from_value::<EvalSnapshot>(params) {
                Ok(snapshot) => {
                    let loaded = EvalState::load(snapshot);
                    let batch = serde_json::to_value(loaded.diagnostics_batch())
                        .unwrap_or(Value::Null);
                    codec::write_frame(
                        &mut stdout,
                        &ipc::notification_frame(ipc::DIAGNOSTIC, batch),
                    )
                    .await?;
                    codec::write_frame(
                        &mut stdout,
                        &ipc::notification_frame(ipc::FINISHED, Value::Null),
                    )
                    .await?;
                    state = Some(loaded);
                }
                Err(e) => tracing::warn!("malformed eval snapshot: {e}"),
            }
        }
    }
    Ok(())
}

pub async fn run_option_worker() -> Result<()> {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut state: Option<OptionsState> = None;

    while let Some(frame) = codec::read_frame(&mut reader).await? {
        let Some(method) = frame.get("method").and_then(Value::as_str) else {
            continue;
        };
        let method = method.to_string();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);

        if let Some(id) = frame.get("id").cloned() {
            let result = state
                .as_ref()
                .map_or(Value::Null, |s| s.handle(&method, &params));
            codec::write_frame(&mut stdout, &ipc::response_frame(id, result)).await?;
            continue;
        }

        if method == ipc::OPTIONS_SNAPSHOT {
            match serde_json::from_value::<OptionsSnapshot>(params) {
                Ok(snapshot) => {
                    codec::write_frame(
                        &mut stdout,
                        &ipc::notification_frame(ipc::FINISHED, Value::Null),
                    )
                    .await?;
                    state = Some(OptionsState {
                        declarations: snapshot.declarations,
                    });
                }
                Err(e) => tracing::warn!("malformed options snapshot: {e}"),
            }
        }
    }
    Ok(())
}

/// Frozen evaluation state: every draft of the snapshot, parsed.
struct EvalState {
    workspace_version: u64,
    files: HashMap<String, ParsedFile>,
}

impl EvalState {
    fn load(snapshot: EvalSnapshot) -> EvalState {
        let files = snapshot
            .drafts
            .into_iter()
            .map(|draft| {
                let parsed = ParsedFile::parse_source(&draft.path, &draft.text);
                (draft.path, parsed)
            })
            .collect();
        EvalState {
            workspace_version: snapshot.workspace_version,
            files,
        }
    }

    fn diagnostics_batch(&self) -> DiagnosticsBatch {
        let mut diagnostics: Vec<FileDiagnostics> = self
            .files
            .iter()
            .filter_map(|(path, file)| {
                let uri = Url::from_file_path(path).ok()?;
                Some(FileDiagnostics {
                    uri,
                    diagnostics: file.diagnostics.iter().map(convert::diagnostic_to_lsp).collect(),
                })
            })
            .collect();
        diagnostics.sort_by(|a, b| a.uri.cmp(&b.uri));
        DiagnosticsBatch {
            workspace_version: self.workspace_version,
            diagnostics,
        }
    }

    fn handle(&self, method: &str, params: &Value) -> Value {
        match method {
            ipc::HOVER => self.hover(params),
            ipc::DEFINITION => self.definition(params),
            ipc::COMPLETION => self.completion(params),
            _ => Value::Null,
        }
    }

    fn file_at(&self, params: &Value) -> Option<(&ParsedFile, nixd_syntax::Position, Url)> {
        let position: TextDocumentPositionParams = serde_json::from_value(params.clone()).ok()?;
        let path = convert::path_from_uri(&position.text_document.uri);
        let file = self.files.get(&path)?;
        Some((
            file,
            convert::position_from_lsp(position.position),
            position.text_document.uri,
        ))
    }

    fn hover(&self, params: &Value) -> Value {
        let Some((file, pos, _)) = self.file_at(params) else {
            return Value::Null;
        };
        let Some(text) = file.hover(pos) else {
            return Value::Null;
        };
        let hover = Hover {
            contents: HoverContents::Markup(MarkupContent {
                kind: MarkupKind::Markdown,
                value: text,
            }),
            range: None,
        };
        serde_json::to_value(hover).unwrap_or(Value::Null)
    }

    fn definition(&self, params: &Value) -> Value {
        let Some((file, pos, uri)) = self.file_at(params) else {
            return Value::Null;
        };
        match file.definition(pos) {
            Ok(span) => serde_json::to_value(Location {
                uri,
                range: convert::span_to_range(span),
            })
            .unwrap_or(Value::Null),
            Err(e) => {
                tracing::debug!("worker definition: {e}");
                Value::Null
            }
        }
    }

    fn completion(&self, params: &Value) -> Value {
        let Some((file, pos, _)) = self.file_at(params) else {
            return Value::Null;
        };
        let items: Vec<CompletionItem> = file
            .scope_completions(pos)
            .into_iter()
            .map(|name| CompletionItem {
                label: name,
                kind: Some(CompletionItemKind::VARIABLE),
                ..CompletionItem::default()
            })
            .collect();
        if items.is_empty() {
            return Value::Null;
        }
        serde_json::to_value(CompletionList {
            is_incomplete: false,
            items,
        })
        .unwrap_or(Value::Null)
    }
}

/// Option declarations served by option workers.
struct OptionsState {
    declarations: HashMap<String, OptionDecl>,
}

impl OptionsState {
    fn handle(&self, method: &str, params: &Value) -> Value {
        match method {
            ipc::OPTION_DECLARATION => self.declaration(params),
            ipc::OPTION_COMPLETION => self.completion(params),
            _ => Value::Null,
        }
    }

    fn declaration(&self, params: &Value) -> Value {
        let Ok(params) = serde_json::from_value::<AttrPathParams>(params.clone()) else {
            return Value::Null;
        };
        let path = params.path.trim_end_matches('.');
        let Some(decl) = self.declarations.get(path) else {
            return Value::Null;
        };
        let Ok(uri) = Url::from_file_path(&decl.file) else {
            return Value::Null;
        };
        let position = Position::new(
            decl.line.saturating_sub(1),
            decl.column.saturating_sub(1),
        );
        serde_json::to_value(Location {
            uri,
            range: Range::new(position, position),
        })
        .unwrap_or(Value::Null)
    }

    fn completion(&self, params: &Value) -> Value {
        let Ok(params) = serde_json::from_value::<AttrPathParams>(params.clone()) else {
            return Value::Null;
        };
        let prefix = params.path.trim_end_matches('.');
        let mut items: Vec<CompletionItem> = self
            .declarations
            .iter()
            .filter(|(name, _)| prefix.is_empty() || name.starts_with(prefix))
            .map(|(name, decl)| CompletionItem {
                label: name.clone(),
                kind: Some(CompletionItemKind::PROPERTY),
                detail: decl.type_name.clone(),
                documentation: decl.description.clone().map(Documentation::String),
                ..CompletionItem::default()
            })
            .collect();
        items.sort_by(|a, b| a.label.cmp(&b.label));
        serde_json::to_value(CompletionList {
            is_incomplete: false,
            items,
        })
        .unwrap_or(Value::Null)
    }
}
