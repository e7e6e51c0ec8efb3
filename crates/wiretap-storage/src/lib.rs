mod fjall_store;

pub use fjall_store::FjallFlowStore;
