use crate::error::StorageError;
use crate::flow::{Event, Flow, FlowId, RawHttp};

/// Abstraction over flow storage backends.
///
/// Saves are idempotent per flow id; events under one flow id are a strictly
/// ordered append-only list.
pub trait FlowStore: Send + Sync {
    /// Persist a flow snapshot, overwriting any earlier state for the same id.
    fn save_flow(&self, flow: &Flow) -> Result<(), StorageError>;

    /// Retrieve a flow by id.
    fn get_flow(&self, id: &FlowId) -> Result<Option<Flow>, StorageError>;

    /// List recent flows (newest first), with pagination.
    fn list_recent(&self, limit: usize, offset: usize) -> Result<Vec<Flow>, StorageError>;

    /// Reset the event list for a flow (called once per streaming response).
    fn init_flow_events(&self, flow_id: &FlowId) -> Result<(), StorageError>;

    /// Append an event to its flow's list.
    fn add_event(&self, event: &Event) -> Result<(), StorageError>;

    /// Events for a flow, in append order.
    fn get_events(&self, flow_id: &FlowId) -> Result<Vec<Event>, StorageError>;

    /// Begin a raw HTTP capture with the canonicalised request string.
    fn init_raw_http(&self, flow_id: &FlowId, request: &str) -> Result<(), StorageError>;

    /// Attach the canonicalised response string to an existing capture.
    fn set_raw_http_response(&self, flow_id: &FlowId, response: &str) -> Result<(), StorageError>;

    /// Drop the raw capture for a flow.
    fn delete_raw_http(&self, flow_id: &FlowId) -> Result<(), StorageError>;

    /// Retrieve the raw capture for a flow.
    fn get_raw_http(&self, flow_id: &FlowId) -> Result<Option<RawHttp>, StorageError>;
}
