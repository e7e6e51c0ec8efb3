use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use fjall::{Config, Keyspace, KvSeparationOptions, PartitionCreateOptions, PartitionHandle};
use wiretap_core::error::StorageError;
use wiretap_core::flow::{Event, Flow, FlowId, RawHttp};
use wiretap_core::storage::FlowStore;

/// Flow store on a fjall keyspace.
///
/// Partitions:
/// - `flows`: flow id -> flow record (json)
/// - `by_time`: recency key -> flow id
/// - `flow_events`: `{flow_id}{seq}` -> event record (json)
/// - `raw_http`: flow id -> raw capture (json)
pub struct FjallFlowStore {
    keyspace: Keyspace,
    flows: PartitionHandle,
    by_time: PartitionHandle,
    flow_events: PartitionHandle,
    raw_http: PartitionHandle,
    /// Process-wide event sequence. Events for one flow are always appended
    /// by a single pipeline, so a shared counter keeps per-flow keys ordered.
    event_seq: AtomicU64,
}

fn backend(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn corrupt(e: impl std::fmt::Display) -> StorageError {
    StorageError::Corrupt(e.to_string())
}

/// Recency index key: complemented microseconds-since-epoch, then the flow
/// id as a tie-breaker. Complementing the timestamp makes the newest flow
/// sort first, so recency queries are a plain forward scan.
fn recency_key(flow: &Flow) -> Vec<u8> {
    let micros = flow
        .created_at
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as u64);
    let mut key = (!micros).to_be_bytes().to_vec();
    key.extend_from_slice(flow.id.as_bytes());
    key
}

fn event_key(flow_id: &FlowId, seq: u64) -> Vec<u8> {
    let mut key = flow_id.as_bytes().to_vec();
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn decode_flow_id(raw: &[u8]) -> Result<FlowId, StorageError> {
    <[u8; 16]>::try_from(raw)
        .map(FlowId)
        .map_err(|_| StorageError::Corrupt(format!("flow id of width {}", raw.len())))
}

impl FjallFlowStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        let keyspace = Config::new(path)
            .open()
            .map_err(|e| StorageError::Open(e.to_string()))?;

        // Record partitions hold json blobs and go through kv separation;
        // index partitions hold nothing but fixed-width keys.
        let partition = |name: &str, records: bool| {
            let options = if records {
                PartitionCreateOptions::default().with_kv_separation(KvSeparationOptions::default())
            } else {
                PartitionCreateOptions::default()
            };
            keyspace
                .open_partition(name, options)
                .map_err(|e| StorageError::Open(format!("partition {name}: {e}")))
        };

        let flows = partition("flows", true)?;
        let raw_http = partition("raw_http", true)?;
        let by_time = partition("by_time", false)?;
        let flow_events = partition("flow_events", false)?;

        Ok(Self {
            keyspace,
            flows,
            by_time,
            flow_events,
            raw_http,
            event_seq: AtomicU64::new(0),
        })
    }

    fn load_raw(&self, flow_id: &FlowId) -> Result<Option<RawHttp>, StorageError> {
        self.raw_http
            .get(flow_id.as_bytes())
            .map_err(backend)?
            .map(|value| serde_json::from_slice(&value).map_err(corrupt))
            .transpose()
    }

    fn store_raw(&self, flow_id: &FlowId, raw: &RawHttp) -> Result<(), StorageError> {
        let record = serde_json::to_vec(raw).map_err(backend)?;
        self.raw_http
            .insert(flow_id.as_bytes(), record)
            .map_err(backend)
    }
}

impl FlowStore for FjallFlowStore {
    fn save_flow(&self, flow: &Flow) -> Result<(), StorageError> {
        let record = serde_json::to_vec(flow).map_err(backend)?;

        // `created_at` never changes, so re-saving a flow overwrites both
        // keys in place and stays idempotent.
        let mut batch = self.keyspace.batch();
        batch.insert(&self.flows, flow.id.as_bytes(), record);
        batch.insert(&self.by_time, recency_key(flow), flow.id.as_bytes());
        batch.commit().map_err(backend)
    }

    fn get_flow(&self, id: &FlowId) -> Result<Option<Flow>, StorageError> {
        self.flows
            .get(id.as_bytes())
            .map_err(backend)?
            .map(|value| serde_json::from_slice(&value).map_err(corrupt))
            .transpose()
    }

    fn list_recent(&self, limit: usize, offset: usize) -> Result<Vec<Flow>, StorageError> {
        // Keys sort newest-first (see `recency_key`), so pagination is a
        // forward scan.
        let mut flows = Vec::new();
        for entry in self.by_time.iter().skip(offset).take(limit) {
            let (_key, value) = entry.map_err(backend)?;
            if let Some(flow) = self.get_flow(&decode_flow_id(&value)?)? {
                flows.push(flow);
            }
        }
        Ok(flows)
    }

    fn init_flow_events(&self, flow_id: &FlowId) -> Result<(), StorageError> {
        let stale = self
            .flow_events
            .prefix(flow_id.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        for (key, _value) in stale {
            self.flow_events.remove(key).map_err(backend)?;
        }
        Ok(())
    }

    fn add_event(&self, event: &Event) -> Result<(), StorageError> {
        let record = serde_json::to_vec(event).map_err(backend)?;
        let seq = self.event_seq.fetch_add(1, Ordering::SeqCst);
        self.flow_events
            .insert(event_key(&event.flow_id, seq), record)
            .map_err(backend)
    }

    fn get_events(&self, flow_id: &FlowId) -> Result<Vec<Event>, StorageError> {
        self.flow_events
            .prefix(flow_id.as_bytes())
            .map(|entry| {
                let (_key, value) = entry.map_err(backend)?;
                serde_json::from_slice(&value).map_err(corrupt)
            })
            .collect()
    }

    fn init_raw_http(&self, flow_id: &FlowId, request: &str) -> Result<(), StorageError> {
        self.store_raw(
            flow_id,
            &RawHttp {
                request: request.to_string(),
                response: None,
            },
        )
    }

    fn set_raw_http_response(&self, flow_id: &FlowId, response: &str) -> Result<(), StorageError> {
        let mut raw = self
            .load_raw(flow_id)?
            .ok_or_else(|| StorageError::MissingCapture(flow_id.to_string()))?;
        raw.response = Some(response.to_string());
        self.store_raw(flow_id, &raw)
    }

    fn delete_raw_http(&self, flow_id: &FlowId) -> Result<(), StorageError> {
        self.raw_http.remove(flow_id.as_bytes()).map_err(backend)
    }

    fn get_raw_http(&self, flow_id: &FlowId) -> Result<Option<RawHttp>, StorageError> {
        self.load_raw(flow_id)
    }
}
