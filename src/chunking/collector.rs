//! Stateful chunk-group reassembly for a single consumer (§4.3.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::envelope::{Envelope, HEADER_CHUNK_ID, HEADER_CHUNK_INDEX, HEADER_CHUNK_TOTAL};
use crate::time_provider::TimeProvider;

/// Default time a chunk group may sit incomplete before being discarded
/// (§3 Chunk Group, §8 scenario 4).
pub const DEFAULT_GROUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

struct Group {
    total: u32,
    slots: HashMap<u32, Envelope>,
    created_at: Instant,
}

/// Reassembles chunk groups into complete envelopes, one instance per
/// consumer. `collect` is the framework's only entry point: callers feed it
/// every envelope that arrives, chunked or not.
#[derive(Clone)]
pub struct ChunkCollector {
    groups: Arc<Mutex<HashMap<String, Group>>>,
    time_provider: Arc<dyn TimeProvider>,
    group_timeout: Duration,
}

impl ChunkCollector {
    /// Creates a collector using `time_provider` for its sweep clock and
    /// `group_timeout` as the max age of an incomplete group.
    #[must_use]
    pub fn new(time_provider: Arc<dyn TimeProvider>, group_timeout: Duration) -> Self {
        Self { groups: Arc::new(Mutex::new(HashMap::new())), time_provider, group_timeout }
    }

    /// Feeds one envelope through the collector.
    ///
    /// Returns `(envelope, true)` immediately for an unchunked envelope.
    /// For a chunk, returns `(chunk, false)` until the group completes, at
    /// which point it returns `(merged, true)` and forgets the group.
    pub async fn collect(&self, envelope: Envelope) -> (Envelope, bool) {
        let Some(chunk_id) = envelope.headers.get(HEADER_CHUNK_ID).map(str::to_string) else {
            return (envelope, true);
        };

        let Some(total) = envelope.headers.get(HEADER_CHUNK_TOTAL).and_then(|t| t.parse::<u32>().ok())
        else {
            return (envelope, true);
        };
        let Some(index) = envelope.headers.get(HEADER_CHUNK_INDEX).and_then(|i| i.parse::<u32>().ok())
        else {
            return (envelope, true);
        };

        let mut groups = self.groups.lock().await;
        let group = groups.entry(chunk_id.clone()).or_insert_with(|| Group {
            total,
            slots: HashMap::new(),
            created_at: self.time_provider.instant(),
        });

        // Duplicate index: keep the first, drop the new one (§4.3.3).
        group.slots.entry(index).or_insert(envelope);

        if group.slots.len() as u32 >= group.total {
            let group = groups.remove(&chunk_id).expect("just inserted above");
            (merge(group), true)
        } else {
            let chunk = group
                .slots
                .get(&index)
                .cloned()
                .expect("index was just inserted or already present");
            drop(groups);
            (chunk, false)
        }
    }

    /// Removes groups older than `group_timeout`, logging each at warn
    /// level (§4.3.3). Intended to be driven by a periodic task.
    pub async fn sweep(&self) {
        let mut groups = self.groups.lock().await;
        let now = self.time_provider.instant();
        let timeout = self.group_timeout;
        groups.retain(|chunk_id, group| {
            let expired = now.duration_since(group.created_at) > timeout;
            if expired {
                tracing::warn!(
                    chunk_id,
                    received = group.slots.len(),
                    total = group.total,
                    "chunk group timed out, discarding partial contents"
                );
            }
            !expired
        });
    }

    /// Runs [`Self::sweep`] on an interval until `shutdown` fires. Intended
    /// to be spawned as its own task (§9 Design Notes: explicit sweep, no
    /// lazy cleanup-on-insert).
    pub async fn run_sweeper(self, interval: Duration, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = &mut shutdown => break,
            }
        }
    }
}

fn merge(group: Group) -> Envelope {
    let mut indices: Vec<u32> = group.slots.keys().copied().collect();
    indices.sort_unstable();

    let first = group.slots.get(&indices[0]).expect("first index present");
    let mut merged = Envelope::new(first.message_type.clone(), first.source.clone(), Bytes::new());
    merged.correlation_id = first.correlation_id.clone();
    merged.destination = first.destination.clone();
    merged.trace_id = first.trace_id.clone();
    merged.headers = first.headers.without_chunk_headers();

    merged.payload = if indices.len() > 1 && merged.content_type() == "application/json" {
        merge_json_array(&group.slots, &indices).unwrap_or_else(|| concat_payloads(&group.slots, &indices))
    } else {
        concat_payloads(&group.slots, &indices)
    };

    merged.id = first.correlation_id.clone().unwrap_or_else(|| first.id.clone());
    merged
}

/// Byte-concatenates each chunk's payload in index order. Correct for text
/// and opaque-byte splits, where the splitter keeps delimiter bytes inside
/// the chunks themselves so concatenation reproduces the original payload.
fn concat_payloads(slots: &HashMap<u32, Envelope>, indices: &[u32]) -> Bytes {
    let mut payload = BytesMut::new();
    for index in indices {
        let chunk = slots.get(index).expect("index came from this group's keys");
        payload.extend_from_slice(&chunk.payload);
    }
    payload.freeze()
}

/// Structurally rejoins a JSON-array chunk group: each chunk's payload is a
/// standalone array (its contiguous slice of the original), so the merged
/// payload is their elements concatenated in index order and re-serialized
/// as one array, rather than the chunks' raw bytes (which would produce
/// `[...][...]`, not valid JSON).
fn merge_json_array(slots: &HashMap<u32, Envelope>, indices: &[u32]) -> Option<Bytes> {
    let mut elements = Vec::new();
    for index in indices {
        let chunk = slots.get(index).expect("index came from this group's keys");
        match serde_json::from_slice::<Value>(&chunk.payload).ok()? {
            Value::Array(items) => elements.extend(items),
            other => elements.push(other),
        }
    }
    serde_json::to_vec(&Value::Array(elements)).ok().map(Bytes::from)
}
