pub mod config;
pub mod path;
pub mod types;

pub use config::KeyflagConfig;
pub use path::{KeyPath, PathError};
pub use types::*;
