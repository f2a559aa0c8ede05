//! Tributary-Core
//!
//! Tributary-Core -- shared types for consuming and compacting partitioned message logs

pub mod errors;

pub mod position;
pub use position::{ChannelPosition, ShardPosition, StartFrom};

pub mod message;
pub use message::{Header, Key, Message, TextMessage};

pub mod interceptor;
pub use interceptor::InterceptorChain;

pub mod dispatcher;
pub use dispatcher::{MessageConsumer, MessageDispatcher};

pub mod stop_condition;
pub use stop_condition::StopCondition;

pub mod state;
pub use state::{
    ConcurrentMapStateRepository, StateRepository, StatefulMessageConsumer, TombstonePolicy,
};

#[cfg(test)]
mod dispatcher_test;
#[cfg(test)]
mod state_test;
