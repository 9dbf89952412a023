//! Prefix watches over Consul blocking queries.
//!
//! Consul has no change stream; a watch is a loop of blocking reads
//! against `/v1/kv/<prefix>?recurse&index=<last>`. Each response is a
//! full snapshot, so changes are recovered by diffing against the
//! previous snapshot's modify indexes. The first snapshot only seeds the
//! diff state; no events are emitted for history.

use keel_core::{StoreError, WatchEvent};
use keel_store::{WatchHandler, WatchSubscription};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::client::{parse_error, request_error, unexpected_status, ConsulShared};
use crate::wire::KvPair;

const INDEX_HEADER: &str = "X-Consul-Index";
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Client-side timeout margin past the server-side wait.
const WAIT_GRACE: Duration = Duration::from_secs(60);

pub(crate) fn spawn(
    shared: Arc<ConsulShared>,
    prefix: &str,
    handler: Arc<dyn WatchHandler>,
) -> WatchSubscription {
    let (stop_tx, stop_rx) = watch::channel(false);
    let prefix_owned = prefix.to_string();
    let task = tokio::spawn(run(shared, prefix_owned.clone(), handler, stop_rx));
    WatchSubscription::new(prefix_owned, stop_tx, task)
}

async fn run(
    shared: Arc<ConsulShared>,
    prefix: String,
    handler: Arc<dyn WatchHandler>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut last_index: u64 = 0;
    let mut snapshot: HashMap<String, u64> = HashMap::new();
    let mut seeded = false;
    let mut backoff = BACKOFF_BASE;

    loop {
        let outcome = tokio::select! {
            outcome = poll_once(&shared, &prefix, last_index) => outcome,
            _ = stop_rx.changed() => break,
        };

        match outcome {
            Ok((index, pairs)) => {
                backoff = BACKOFF_BASE;
                // Per the blocking query contract: reset when the index
                // goes backwards or degenerates to zero.
                last_index = if index == 0 || index < last_index {
                    0
                } else {
                    index
                };

                let (next, events) = apply_snapshot(&snapshot, pairs, index, seeded);
                snapshot = next;
                seeded = true;
                for event in events {
                    handler.on_event(event);
                }

                // A degenerate index means the next poll returns
                // immediately; pace it.
                if last_index == 0 {
                    if sleep_or_stop(BACKOFF_BASE, &mut stop_rx).await {
                        break;
                    }
                }
            }
            Err(err) => {
                handler.on_error(&err);
                if sleep_or_stop(backoff, &mut stop_rx).await {
                    break;
                }
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }
}

/// Sleep for `duration`, returning true when the stop signal fired.
async fn sleep_or_stop(duration: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = stop_rx.changed() => true,
    }
}

/// One blocking read. Returns the response's consul index and snapshot;
/// a missing prefix is an empty snapshot, not an error.
async fn poll_once(
    shared: &ConsulShared,
    prefix: &str,
    last_index: u64,
) -> Result<(u64, Vec<KvPair>), StoreError> {
    let wait = shared.config.wait;
    let mut request = shared
        .http
        .get(shared.kv_url(prefix))
        .timeout(wait + WAIT_GRACE)
        .query(&[("recurse", "")])
        .query(&[
            ("index", last_index.to_string()),
            ("wait", format!("{}s", wait.as_secs())),
        ]);
    request = shared.apply_auth(request);

    let response = request.send().await.map_err(request_error)?;
    let status = response.status();
    let header_index = response
        .headers()
        .get(INDEX_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    if status == StatusCode::NOT_FOUND {
        return Ok((header_index.unwrap_or(last_index), Vec::new()));
    }
    if !status.is_success() {
        return Err(unexpected_status(response).await);
    }
    let pairs: Vec<KvPair> = response.json().await.map_err(parse_error)?;
    Ok((header_index.unwrap_or(last_index), pairs))
}

/// Diff a snapshot against the previous one. Returns the new diff state
/// and the events to emit; with `emit` false the snapshot only seeds.
/// Deletes carry the response's commit index since the deleted key's own
/// final index is not observable from a snapshot.
fn apply_snapshot(
    previous: &HashMap<String, u64>,
    pairs: Vec<KvPair>,
    commit_index: u64,
    emit: bool,
) -> (HashMap<String, u64>, Vec<WatchEvent>) {
    let mut next = HashMap::with_capacity(pairs.len());
    let mut events = Vec::new();

    for pair in pairs {
        next.insert(pair.key.clone(), pair.modify_index);
        if emit && previous.get(&pair.key) != Some(&pair.modify_index) {
            match pair.into_entry() {
                Ok(entry) => events.push(WatchEvent::Put(entry)),
                Err(err) => debug!(error = %err, "skipping undecodable watch entry"),
            }
        }
    }
    if emit {
        for key in previous.keys() {
            if !next.contains_key(key) {
                events.push(WatchEvent::Delete {
                    key: key.clone(),
                    modify_index: commit_index,
                });
            }
        }
    }
    (next, events)
}

// ============================================================================
// TESTS
// ============================================================================
