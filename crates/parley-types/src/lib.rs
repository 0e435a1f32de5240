pub mod chat;
pub mod provider;

pub use chat::*;
pub use provider::*;
