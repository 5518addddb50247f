pub mod batcher;
pub mod client;
pub mod serialize;

pub use batcher::GraphWriteBatcher;
pub use client::{GraphClient, HttpGraphClient, MemoryGraphClient, Statement};
pub use serialize::serialize_properties;
