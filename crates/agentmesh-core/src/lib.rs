pub mod config;
pub mod error;
pub mod event;
pub mod path;
pub mod protocol;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{MeshError, Result};
pub use event::EventBus;
pub use types::*;
