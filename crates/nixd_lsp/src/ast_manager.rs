use std::collections::HashMap;
use std::sync::Arc;

use nixd_syntax::ParsedFile;
use tokio::sync::{oneshot, Mutex};

/// Parse scheduler and versioned AST cache.
///
/// Parses run as independent tasks; published trees are immutable and
/// handed out behind `Arc`. Per path, older parse results never replace
/// a newer published version, and waiters are satisfied by the first
/// published version at least as new as the one they asked for.
#[derive(Clone, Default)]
pub struct AstManager {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    cache: HashMap<String, Entry>,
    waiters: HashMap<String, Vec<Waiter>>,
}

struct Entry {
    version: i64,
    file: Arc<ParsedFile>,
}

struct Waiter {
    min_version: i64,
    tx: oneshot::Sender<(Arc<ParsedFile>, i64)>,
}

impl AstManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a parse of `contents` for `path`. The result is published
    /// under `version` once the parse completes.
    pub fn sched_parse(&self, path: String, contents: Arc<String>, version: i64) {
        let manager = self.clone();
        tokio::spawn(async move {
            let parse_path = path.clone();
            let parsed = tokio::task::spawn_blocking(move || {
                Arc::new(ParsedFile::parse_source(&parse_path, &contents))
            })
            .await;
            match parsed {
                Ok(file) => manager.publish(path, version, file).await,
                Err(e) => tracing::warn!("parse task for {path} failed: {e}"),
            }
        });
    }

    pub async fn publish(&self, path: String, version: i64, file: Arc<ParsedFile>) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.cache.get(&path) {
            if entry.version > version {
                tracing::debug!(
                    "discarding stale parse of {path} (have v{}, got v{version})",
                    entry.version
                );
                return;
            }
        }
        inner.cache.insert(
            path.clone(),
            Entry {
                version,
                file: Arc::clone(&file),
            },
        );

        if let Some(list) = inner.waiters.get_mut(&path) {
            let mut ready = Vec::new();
            let mut still_waiting = Vec::new();
            for waiter in list.drain(..) {
                if waiter.min_version <= version {
                    ready.push(waiter);
                } else {
                    still_waiting.push(waiter);
                }
            }
            *list = still_waiting;
            for waiter in ready {
                let _ = waiter.tx.send((Arc::clone(&file), version));
            }
        }
    }

    pub async fn evict(&self, path: &str) {
        let mut inner = self.inner.lock().await;
        inner.cache.remove(path);
        inner.waiters.remove(path);
    }

    /// Resolve once an AST for `(path, version)` or anything newer is
    /// published. Error-recovery trees count; callers always receive a
    /// best-effort tree.
    pub async fn with_ast(&self, path: &str, version: i64) -> Option<(Arc<ParsedFile>, i64)> {
        let rx = {
            let mut inner = self.inner.lock().await;
            if let Some(entry) = inner.cache.get(path) {
                if entry.version >= version {
                    return Some((Arc::clone(&entry.file), entry.version));
                }
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.entry(path.to_string()).or_default().push(Waiter {
                min_version: version,
                tx,
            });
            rx
        };
        rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(version: i64) -> Arc<ParsedFile> {
        Arc::new(ParsedFile::parse_source(
            "/ws/a.nix",
            &format!("let v = {version}; in v"),
        ))
    }

    #[tokio::test]
    async fn published_ast_resolves_immediately() {
        let manager = AstManager::new();
        manager.publish("/ws/a.nix".into(), 1, parsed(1)).await;
        let (_, version) = manager.with_ast("/ws/a.nix", 1).await.unwrap();
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn waiter_resolves_when_version_arrives() {
        let manager = AstManager::new();
        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.with_ast("/ws/a.nix", 2).await })
        };
        tokio::task::yield_now().await;
        manager.publish("/ws/a.nix".into(), 2, parsed(2)).await;
        let (_, version) = waiting.await.unwrap().unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn newer_version_satisfies_older_request() {
        let manager = AstManager::new();
        manager.publish("/ws/a.nix".into(), 5, parsed(5)).await;
        let (_, version) = manager.with_ast("/ws/a.nix", 3).await.unwrap();
        assert_eq!(version, 5);
    }

    #[tokio::test]
    async fn stale_parse_never_replaces_newer() {
        let manager = AstManager::new();
        manager.publish("/ws/a.nix".into(), 4, parsed(4)).await;
        manager.publish("/ws/a.nix".into(), 2, parsed(2)).await;
        let (_, version) = manager.with_ast("/ws/a.nix", 0).await.unwrap();
        assert_eq!(version, 4);
    }

    #[tokio::test]
    async fn waiter_ignores_too_old_publications() {
        let manager = AstManager::new();
        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.with_ast("/ws/a.nix", 3).await })
        };
        tokio::task::yield_now().await;
        manager.publish("/ws/a.nix".into(), 1, parsed(1)).await;
        assert!(!waiting.is_finished());
        manager.publish("/ws/a.nix".into(), 3, parsed(3)).await;
        let (_, version) = waiting.await.unwrap().unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn sched_parse_publishes() {
        let manager = AstManager::new();
        manager.sched_parse(
            "/ws/b.nix".into(),
            Arc::new("let x = 1; in x".to_string()),
            7,
        );
        let (file, version) = manager.with_ast("/ws/b.nix", 7).await.unwrap();
        assert_eq!(version, 7);
        assert!(file.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn eviction_forgets_the_path() {
        let manager = AstManager::new();
        manager.publish("/ws/a.nix".into(), 1, parsed(1)).await;
        manager.evict("/ws/a.nix").await;
        let inner = manager.inner.lock().await;
        assert!(inner.cache.is_empty());
    }
}
