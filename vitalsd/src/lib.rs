pub mod alerts;
pub mod api;
pub mod config;
pub mod context;
pub mod db;
pub mod driver;
pub mod error;
pub mod history;
pub mod metrics;
pub mod processes;
pub mod remote;
pub mod sampler;
pub mod settings;
pub mod types;

pub use config::Config;
pub use context::Context;
pub use metrics::Metrics;
pub use types::MetricSnapshot;
