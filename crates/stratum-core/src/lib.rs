pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod hooks;
pub mod types;

pub use config::StratumConfig;
pub use context::Context;
pub use error::{Result, StratumError};
pub use event::{EventBus, EventHandler, SubscriptionId};
pub use types::*;
