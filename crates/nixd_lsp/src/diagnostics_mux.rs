use tower_lsp::lsp_types::Url;

use crate::ipc::FileDiagnostics;

/// Serializes worker diagnostics against the workspace version so a
/// slow worker can never overwrite the report of a fresher one.
#[derive(Debug, Default)]
pub struct DiagnosticsMux {
    published_version: u64,
    published_uris: Vec<Url>,
}

impl DiagnosticsMux {
    /// Fold one worker batch in. Returns the notifications to emit, in
    /// order: clears for every previously published URI, then the new
    /// batch. `None` means the batch was stale and must be dropped.
    pub fn apply(
        &mut self,
        worker_version: u64,
        batch: Vec<FileDiagnostics>,
    ) -> Option<Vec<FileDiagnostics>> {
        if worker_version < self.published_version {
            return None;
        }
        self.published_version = worker_version;

        let mut out: Vec<FileDiagnostics> = self
            .published_uris
            .drain(..)
            .map(|uri| FileDiagnostics {
                uri,
                diagnostics: Vec::new(),
            })
            .collect();
        self.published_uris = batch.iter().map(|entry| entry.uri.clone()).collect();
        out.extend(batch);
        Some(out)
    }

    pub fn published_version(&self) -> u64 {
        self.published_version
    }
}
