//! Prefix watches over etcd's watch stream.
//!
//! Unlike Consul's poll-and-diff loop, etcd pushes events. A watch
//! opens a bidirectional stream with a single create request starting
//! at the current revision, then resumes from the last delivered
//! revision plus one after any disconnect, so no events are lost across
//! reconnects. Only a compaction can open a gap, and that is reported
//! through the handler's error path.

use futures_util::{stream, StreamExt};
use keel_core::{StoreError, WatchEvent};
use keel_store::{WatchHandler, WatchSubscription};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::client::{kv_to_entry, prefix_bounds, EtcdShared};
use crate::pb;
use crate::rpc::rpc_error;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

pub(crate) fn spawn(
    shared: Arc<EtcdShared>,
    prefix: &str,
    handler: Arc<dyn WatchHandler>,
) -> WatchSubscription {
    let (stop_tx, stop_rx) = watch::channel(false);
    let prefix_owned = prefix.to_string();
    let task = tokio::spawn(run(shared, prefix_owned.clone(), handler, stop_rx));
    WatchSubscription::new(prefix_owned, stop_tx, task)
}

async fn run(
    shared: Arc<EtcdShared>,
    prefix: String,
    handler: Arc<dyn WatchHandler>,
    mut stop_rx: watch::Receiver<bool>,
) {
    // Zero opens at the current revision; after the first response this
    // always holds the next revision to resume from.
    let mut resume_revision: i64 = 0;
    let mut backoff = BACKOFF_BASE;

    loop {
        let opened = tokio::select! {
            opened = open_stream(&shared, &prefix, resume_revision) => opened,
            _ = stop_rx.changed() => break,
        };

        let mut responses = match opened {
            Ok(responses) => responses,
            Err(err) => {
                handler.on_error(&err);
                if sleep_or_stop(backoff, &mut stop_rx).await {
                    break;
                }
                backoff = (backoff * 2).min(BACKOFF_MAX);
                continue;
            }
        };

        loop {
            let message = tokio::select! {
                message = responses.message() => message,
                _ = stop_rx.changed() => return,
            };
            match message {
                Ok(Some(response)) => {
                    backoff = BACKOFF_BASE;
                    if response.canceled {
                        if response.compact_revision > 0 {
                            // Events between our resume point and the
                            // compaction are gone for good.
                            handler.on_error(&StoreError::protocol(format!(
                                "watch on {prefix} fell behind a compaction at revision {}",
                                response.compact_revision
                            )));
                            resume_revision = response.compact_revision;
                        } else {
                            handler.on_error(&StoreError::protocol(format!(
                                "watch on {prefix} cancelled by the server: {}",
                                response.cancel_reason
                            )));
                        }
                        break;
                    }
                    if let Some(header) = &response.header {
                        if header.revision > 0 {
                            resume_revision = header.revision + 1;
                        }
                    }
                    for event in map_events(response.events) {
                        handler.on_event(event);
                    }
                }
                Ok(None) => {
                    // Server closed the stream; reconnect and resume.
                    break;
                }
                Err(status) => {
                    handler.on_error(&rpc_error(status));
                    break;
                }
            }
        }

        if sleep_or_stop(backoff, &mut stop_rx).await {
            break;
        }
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

/// Sleep for `duration`, returning true when the stop signal fired.
async fn sleep_or_stop(duration: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = stop_rx.changed() => true,
    }
}

async fn open_stream(
    shared: &EtcdShared,
    prefix: &str,
    start_revision: i64,
) -> Result<tonic::Streaming<pb::WatchResponse>, StoreError> {
    let (key, range_end) = prefix_bounds(prefix);
    let create = pb::WatchRequest {
        request_union: Some(pb::watch_request::RequestUnion::CreateRequest(
            pb::WatchCreateRequest {
                key,
                range_end,
                start_revision,
                progress_notify: true,
            },
        )),
    };
    // The outbound half stays open for the life of the watch; etcd
    // tears the stream down if the client half ends.
    let requests = stream::iter([create]).chain(stream::pending());
    let mut client = shared.watch.clone();
    client.watch(requests).await.map_err(rpc_error)
}

/// Convert raw events into watch events. Put events carry the full new
/// pair; delete events are tombstones whose `mod_revision` holds the
/// deletion revision.
fn map_events(events: Vec<pb::Event>) -> Vec<WatchEvent> {
    let mut mapped = Vec::with_capacity(events.len());
    for event in events {
        let Ok(event_type) = pb::EventType::try_from(event.r#type) else {
            debug!(raw = event.r#type, "skipping watch event of unknown type");
            continue;
        };
        let Some(kv) = event.kv else { continue };
        match event_type {
            pb::EventType::Put => match kv_to_entry(kv) {
                Ok(entry) => mapped.push(WatchEvent::Put(entry)),
                Err(err) => debug!(error = %err, "skipping undecodable watch event"),
            },
            pb::EventType::Delete => match String::from_utf8(kv.key) {
                Ok(key) => mapped.push(WatchEvent::Delete {
                    key,
                    modify_index: kv.mod_revision as u64,
                }),
                Err(_) => debug!("skipping watch tombstone with non-utf8 key"),
            },
        }
    }
    mapped
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn put_event(key: &str, value: &str, revision: i64) -> pb::Event {
        pb::Event {
            r#type: pb::EventType::Put as i32,
            kv: Some(pb::KeyValue {
                key: key.as_bytes().to_vec(),
                value: value.as_bytes().to_vec(),
                create_revision: revision,
                mod_revision: revision,
                version: 1,
                lease: 0,
            }),
            prev_kv: None,
        }
    }

    #[test]
    fn test_put_events_carry_the_new_pair() {
        let events = map_events(vec![put_event("keel/tenants/acme/a", "x", 9)]);
        assert_eq!(events.len(), 1);
        match &events[0] {
            WatchEvent::Put(entry) => {
                assert_eq!(entry.key, "keel/tenants/acme/a");
                assert_eq!(entry.value, b"x");
                assert_eq!(entry.modify_index, 9);
            }
            other => panic!("expected a put event, got {other:?}"),
        }
    }

    #[test]
    fn test_delete_tombstones_carry_the_deletion_revision() {
        let events = map_events(vec![pb::Event {
            r#type: pb::EventType::Delete as i32,
            kv: Some(pb::KeyValue {
                key: b"keel/tenants/acme/a".to_vec(),
                mod_revision: 12,
                ..Default::default()
            }),
            prev_kv: None,
        }]);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            WatchEvent::Delete { key, modify_index }
                if key == "keel/tenants/acme/a" && *modify_index == 12
        ));
    }

    #[test]
    fn test_undecodable_events_are_skipped() {
        let events = map_events(vec![
            pb::Event {
                r#type: pb::EventType::Put as i32,
                kv: Some(pb::KeyValue {
                    key: vec![0xff, 0xfe],
                    ..Default::default()
                }),
                prev_kv: None,
            },
            pb::Event {
                r#type: 42,
                kv: None,
                prev_kv: None,
            },
            put_event("keel/tenants/acme/ok", "v", 3),
        ]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key(), "keel/tenants/acme/ok");
    }
}
