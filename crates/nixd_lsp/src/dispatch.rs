//! Time-bounded broadcast-and-collect over a worker pool, and the
//! freshness-preferring reply selector.

use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;

use crate::workers::WorkerClient;

/// Ask every worker in the snapshot and collect whatever replies arrive
/// within `budget`. Each reply is tagged with the answering worker's
/// snapshot workspace version. Partial results are the norm; late
/// replies are simply discarded.
pub async fn ask_wc(
    clients: Vec<WorkerClient>,
    method: &str,
    params: Value,
    budget: Duration,
) -> Vec<(u64, Value)> {
    if clients.is_empty() {
        return Vec::new();
    }
    let expected = clients.len();

    let mut in_flight = FuturesUnordered::new();
    for client in clients {
        let version = client.workspace_version();
        let params = params.clone();
        let method = method.to_string();
        in_flight.push(async move {
            let rx = client.request(&method, params).await;
            (version, rx.await)
        });
    }

    let mut replies = Vec::new();
    let deadline = tokio::time::sleep(budget);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            next = in_flight.next() => {
                match next {
                    Some((version, Ok(result))) => replies.push((version, result)),
                    Some((_, Err(_))) => {
                        // Worker evicted or dead mid-request.
                    }
                    None => break,
                }
                if replies.len() == expected {
                    break;
                }
            }
        }
    }
    replies
}

/// The matching reply with the greatest workspace version, or `default`
/// when nothing matches. Version ties keep the earliest arrival, which
/// makes the choice stable for identical inputs within one run.
pub fn latest_match_or<T>(
    replies: Vec<(u64, T)>,
    matches: impl Fn(&T) -> bool,
    default: T,
) -> T {
    let mut best: Option<(u64, T)> = None;
    for (version, reply) in replies {
        if !matches(&reply) {
            continue;
        }
        match &best {
            Some((best_version, _)) if *best_version >= version => {}
            _ => best = Some((version, reply)),
        }
    }
    best.map(|(_, reply)| reply).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::dispatch_worker_frame;
    use tokio::sync::mpsc;

    #[test]
    fn latest_match_prefers_greatest_version() {
        let replies = vec![(1, "old"), (3, "new"), (2, "mid")];
        assert_eq!(latest_match_or(replies, |_| true, "none"), "new");
    }

    #[test]
    fn latest_match_skips_non_matching() {
        let replies = vec![(5, ""), (2, "usable")];
        assert_eq!(
            latest_match_or(replies, |r| !r.is_empty(), "none"),
            "usable"
        );
    }

    #[test]
    fn latest_match_falls_back_to_default() {
        let replies: Vec<(u64, &str)> = Vec::new();
        assert_eq!(latest_match_or(replies, |_| true, "fallback"), "fallback");
    }

    #[test]
    fn version_ties_keep_first_arrival() {
        let replies = vec![(2, "first"), (2, "second")];
        assert_eq!(latest_match_or(replies, |_| true, "none"), "first");
    }

    #[tokio::test]
    async fn collects_replies_from_all_workers() {
        let (client_a, mut rx_a, pending_a) = WorkerClient::for_tests(1);
        let (client_b, mut rx_b, pending_b) = WorkerClient::for_tests(2);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let answer_a = {
            let events = events_tx.clone();
            tokio::spawn(async move {
                let sent = rx_a.recv().await.unwrap();
                let id = sent["id"].as_u64().unwrap();
                let frame = serde_json::json!({ "id": id, "result": "from-a" });
                dispatch_worker_frame(frame, &pending_a, &events).await;
            })
        };
        let answer_b = {
            let events = events_tx.clone();
            tokio::spawn(async move {
                let sent = rx_b.recv().await.unwrap();
                let id = sent["id"].as_u64().unwrap();
                let frame = serde_json::json!({ "id": id, "result": "from-b" });
                dispatch_worker_frame(frame, &pending_b, &events).await;
            })
        };

        let replies = ask_wc(
            vec![client_a, client_b],
            "nixd/ipc/textDocument/hover",
            serde_json::json!({}),
            Duration::from_secs(5),
        )
        .await;
        answer_a.await.unwrap();
        answer_b.await.unwrap();

        assert_eq!(replies.len(), 2);
        let freshest = latest_match_or(replies, |_| true, Value::Null);
        assert_eq!(freshest, "from-b");
    }

    #[tokio::test]
    async fn deadline_bounds_the_wait() {
        let (client, _writer_rx, _pending) = WorkerClient::for_tests(1);
        let started = std::time::Instant::now();
        let replies = ask_wc(
            vec![client],
            "nixd/ipc/textDocument/hover",
            serde_json::json!({}),
            Duration::from_millis(30),
        )
        .await;
        assert!(replies.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn empty_pool_returns_immediately() {
        let replies = ask_wc(
            Vec::new(),
            "nixd/ipc/textDocument/hover",
            serde_json::json!({}),
            Duration::from_secs(10),
        )
        .await;
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn dead_worker_is_absorbed() {
        let (client, writer_rx, _pending) = WorkerClient::for_tests(1);
        drop(writer_rx);
        let replies = ask_wc(
            vec![client],
            "nixd/ipc/textDocument/hover",
            serde_json::json!({}),
            Duration::from_millis(50),
        )
        .await;
        assert!(replies.is_empty());
    }
}
