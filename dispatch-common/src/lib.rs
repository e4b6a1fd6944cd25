pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod metrics_consts;
pub mod model;
pub mod store;
pub mod version;

pub use config::EngineConfig;
pub use error::{DispatchError, SetupError};
pub use model::*;
pub use store::{Store, StoreError, StoreResult, TopicListener};
pub use version::VersionSignal;
