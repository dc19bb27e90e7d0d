pub mod types;

pub use types::{Config, LauncherError, Result};
