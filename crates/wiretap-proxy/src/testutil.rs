//! In-memory test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use wiretap_core::error::StorageError;
use wiretap_core::flow::{Event, Flow, FlowId, Headers, RawHttp};
use wiretap_core::storage::FlowStore;

use crate::pipeline::ResponseMeta;

/// Mutex-backed [`FlowStore`] that also counts saves per flow.
#[derive(Default)]
pub struct MemStore {
    flows: Mutex<HashMap<FlowId, Flow>>,
    save_log: Mutex<Vec<FlowId>>,
    events: Mutex<Vec<Event>>,
    raw: Mutex<HashMap<FlowId, RawHttp>>,
}

impl MemStore {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn saves_for(&self, flow_id: &FlowId) -> usize {
        self.save_log
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == flow_id)
            .count()
    }

    pub fn flow(&self, flow_id: &FlowId) -> Option<Flow> {
        self.flows.lock().unwrap().get(flow_id).cloned()
    }
}

impl FlowStore for MemStore {
    fn save_flow(&self, flow: &Flow) -> Result<(), StorageError> {
        self.save_log.lock().unwrap().push(flow.id.clone());
        self.flows
            .lock()
            .unwrap()
            .insert(flow.id.clone(), flow.clone());
        Ok(())
    }

    fn get_flow(&self, id: &FlowId) -> Result<Option<Flow>, StorageError> {
        Ok(self.flows.lock().unwrap().get(id).cloned())
    }

    fn list_recent(&self, limit: usize, _offset: usize) -> Result<Vec<Flow>, StorageError> {
        Ok(self
            .flows
            .lock()
            .unwrap()
            .values()
            .take(limit)
            .cloned()
            .collect())
    }

    fn init_flow_events(&self, flow_id: &FlowId) -> Result<(), StorageError> {
        self.events.lock().unwrap().retain(|e| e.flow_id != *flow_id);
        Ok(())
    }

    fn add_event(&self, event: &Event) -> Result<(), StorageError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn get_events(&self, flow_id: &FlowId) -> Result<Vec<Event>, StorageError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.flow_id == *flow_id)
            .cloned()
            .collect())
    }

    fn init_raw_http(&self, flow_id: &FlowId, request: &str) -> Result<(), StorageError> {
        self.raw.lock().unwrap().insert(
            flow_id.clone(),
            RawHttp {
                request: request.to_string(),
                response: None,
            },
        );
        Ok(())
    }

    fn set_raw_http_response(&self, flow_id: &FlowId, response: &str) -> Result<(), StorageError> {
        let mut raw = self.raw.lock().unwrap();
        let entry = raw
            .get_mut(flow_id)
            .ok_or_else(|| StorageError::MissingCapture(flow_id.to_string()))?;
        entry.response = Some(response.to_string());
        Ok(())
    }

    fn delete_raw_http(&self, flow_id: &FlowId) -> Result<(), StorageError> {
        self.raw.lock().unwrap().remove(flow_id);
        Ok(())
    }

    fn get_raw_http(&self, flow_id: &FlowId) -> Result<Option<RawHttp>, StorageError> {
        Ok(self.raw.lock().unwrap().get(flow_id).cloned())
    }
}

/// A 200 OK text/plain meta with nothing special going on.
pub fn basic_meta() -> ResponseMeta {
    ResponseMeta {
        flow_id: FlowId::generate(),
        status: 200,
        reason: "OK".into(),
        headers: Headers::new(),
        content_type: Some("text/plain".into()),
        content_encoding: None,
        chunked_upstream: false,
        is_streaming: false,
        store_raw_http: false,
        verbose: false,
    }
}
