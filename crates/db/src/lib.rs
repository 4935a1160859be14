pub mod connection;
pub mod facade;
pub mod local;
pub mod mirror;

pub use connection::connect_with_settings;
pub use facade::StoreFacade;
pub use local::LocalStore;
pub use mirror::{AzCopy, BlobMirror, CopyCommand, RemoteLocation, SyncError};
