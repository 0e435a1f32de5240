pub mod auth;
pub mod config;
pub mod context;
pub mod paths;
pub mod storage;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5000;

pub use auth::*;
pub use config::*;
pub use context::*;
pub use paths::*;
pub use storage::*;
