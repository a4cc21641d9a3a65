pub mod config;
pub mod error;
pub mod ids;
pub mod types;
pub mod util;

pub use config::{Config, PersistenceMode};
pub use error::BriefError;
pub use types::*;
