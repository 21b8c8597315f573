pub mod connection;
pub mod server;
pub mod submission;

pub use connection::{ConnectionConfig, GREETING};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use submission::parse_submission;
