pub mod config;
pub mod errors;
pub mod store;

pub use config::{AppConfig, ConfigError, LoadOptions, ReplyMode, StoreMode};
pub use errors::{ApplicationError, InterfaceError};
pub use store::{is_read_statement, DataStore, QueryOutcome};
