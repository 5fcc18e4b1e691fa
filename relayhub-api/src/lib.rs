// relayhub HTTP surface
//
// WebSocket accept path plus the liveness and statistics endpoints polled
// by the rest of the platform.

pub mod http;

pub use http::{create_router, AppState};
