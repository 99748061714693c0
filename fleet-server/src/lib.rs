//! Fleet server library: realtime hub, persistence, authorization, and
//! the HTTP surface. The binary in `main.rs` wires these together; they
//! are exposed as a library for integration tests.

pub mod auth;
pub mod config;
pub mod http;
pub mod hub;
pub mod store;
pub mod visibility;

pub use auth::{AuthKeys, AuthUser, Claims};
pub use config::ServerConfig;
pub use http::{router, AppState};
pub use hub::Hub;
pub use store::Db;
