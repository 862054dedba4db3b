//! Shared types and error hierarchy for Ferry.

pub mod error;
pub mod message;
pub mod provider;
pub mod tool;
pub mod util;

pub use error::{ApiError, ConfigError, FerryError, ToolError};
pub use message::*;
pub use tool::*;
pub use util::{truncate_str, truncate_string};
