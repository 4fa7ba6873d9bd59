pub mod cloudwatch;
pub mod config;
pub mod error;
pub mod label;
pub mod logging;
pub mod mackerel;
pub mod metrics;
pub mod models;
pub mod relay;

pub use error::{RelayError, Result};
pub use label::Label;
