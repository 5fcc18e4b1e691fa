// Module: sync

pub mod connection;
pub mod envelope;
pub mod hub;
pub mod policy;
pub mod registry;
pub mod relay;

pub use connection::{ConnectionActor, ConnectionHandle, ConnectionLimits, Frame};
pub use envelope::{Envelope, InstanceId, Notification, NotificationLevel, SessionId};
pub use hub::{Hub, HubConfig, HubState, HubStats};
pub use policy::RetryPolicy;
pub use registry::{Connection, FanoutResult, MessageSender, Registry, SendOutcome};
pub use relay::RelayPublisher;
