pub mod broker;
pub mod discovery;
pub mod error;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use broker::{Broker, MemoryBroker, RedisBroker, SessionStore};
pub use discovery::{FailureCounter, SessionDirectory};
pub use error::{Error, Result};
pub use sync::{
    Connection, ConnectionActor, ConnectionHandle, ConnectionLimits, Envelope, FanoutResult, Frame, Hub,
    HubConfig, HubState, HubStats, InstanceId, Notification, NotificationLevel, Registry, RetryPolicy,
    SessionId,
};
