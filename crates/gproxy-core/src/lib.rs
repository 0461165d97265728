pub mod auth;
pub mod bootstrap;
pub mod hooks;
pub mod proxy_engine;
pub mod request_id;
pub mod semantic;
pub mod snapshot_writer;
pub mod state;
pub mod upstream_client;
pub mod vrouter;

pub use auth::{
    AuthContext, AuthError, AuthKeyEntry, AuthProvider, AuthSnapshot, MemoryAuth, NoopAuth,
    UserEntry,
};
