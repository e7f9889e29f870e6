pub mod config;
pub mod error;
pub mod params;
pub mod traits;
pub mod transport;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowError, Result};
pub use params::NodeParams;
pub use types::*;
