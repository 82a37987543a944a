//! Methods and payloads of the controller to worker channel.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_lsp::lsp_types::{Diagnostic, Url};

pub const EVAL_SNAPSHOT: &str = "nixd/ipc/eval";
pub const OPTIONS_SNAPSHOT: &str = "nixd/ipc/options";
pub const DIAGNOSTIC: &str = "nixd/ipc/diagnostic";
pub const FINISHED: &str = "nixd/ipc/finished";
pub const HOVER: &str = "nixd/ipc/textDocument/hover";
pub const DEFINITION: &str = "nixd/ipc/textDocument/definition";
pub const COMPLETION: &str = "nixd/ipc/textDocument/completion";
pub const OPTION_DECLARATION: &str = "nixd/ipc/option/textDocument/declaration";
pub const OPTION_COMPLETION: &str = "nixd/ipc/textDocument/completion/options";

/// One draft shipped to a worker at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftEntry {
    pub path: String,
    pub version: i64,
    pub text: String,
}

/// Bootstrap payload for an eval worker: the controller state it is a
/// snapshot of, stamped with the workspace version current at spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalSnapshot {
    pub workspace_version: u64,
    pub drafts: Vec<DraftEntry>,
}

/// One module option as read from the declarations index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionDecl {
    pub file: String,
    pub line: u32,
    #[serde(default)]
    pub column: u32,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "type")]
    pub type_name: Option<String>,
}

/// Bootstrap payload for an option worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsSnapshot {
    pub workspace_version: u64,
    pub declarations: HashMap<String, OptionDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDiagnostics {
    pub uri: Url,
    pub diagnostics: Vec<Diagnostic>,
}

/// Worker to controller diagnostics batch, tagged with the worker's
/// snapshot version so stale batches can be dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsBatch {
    pub workspace_version: u64,
    pub diagnostics: Vec<FileDiagnostics>,
}

/// Attribute path extracted around the cursor for option lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttrPathParams {
    pub path: String,
}

pub fn request_frame(id: u64, method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn notification_frame(method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

pub fn response_frame(id: Value, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}
