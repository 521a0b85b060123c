pub mod config;
pub mod error;
pub mod room;
pub mod server;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use room::RoomManager;
pub use server::{build_router, AppState};
