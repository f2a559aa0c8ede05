//! Tributary-Client
//!
//! Tributary-Client -- parallel, resumable consumption of partitioned message logs

pub mod errors;

mod log_source;
pub use log_source::{
    Cursor, FetchResponse, LogSource, PartitionInfo, PartitionPage, SourceRecord, SourceResult,
};

mod in_memory_source;
pub use in_memory_source::InMemoryLogSource;

mod retry_manager;
pub use retry_manager::RetryManager;

mod receiver_options;
pub use receiver_options::ReceiverOptions;

mod partition_consumer;
pub use partition_consumer::PartitionConsumer;

mod log_receiver;
pub use log_receiver::LogReceiver;

#[cfg(test)]
mod partition_consumer_test;
