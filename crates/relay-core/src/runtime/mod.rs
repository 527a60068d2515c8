//! Relay runtime initialization and lifecycle management.
//!
//! Builds every core component from an [`AppConfig`](crate::config::AppConfig), seeds pools,
//! sources, rate limits and cache policies through the same validating paths the admin API
//! uses, and runs the background maintenance loop until shutdown.
//!
//! # Examples
//!
//! ```no_run
//! use relay_core::{config::AppConfig, runtime::RelayRuntime, types::FetchRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::load()?;
//!     let runtime = RelayRuntime::builder().with_config(config).build()?;
//!
//!     let result = runtime
//!         .orchestrator()
//!         .fetch(FetchRequest::get("https://api.example.com/v1/status"))
//!         .await?;
//!     println!("cached: {}", result.cached);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod components;
pub mod lifecycle;

pub use builder::{RelayRuntimeBuilder, RuntimeError};
pub use components::RelayComponents;
pub use lifecycle::{run_maintenance_pass, MaintenanceReport, RelayRuntime};
