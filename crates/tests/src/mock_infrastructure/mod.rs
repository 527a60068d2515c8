//! Reusable test infrastructure: mocked upstream APIs and gateway fixtures.
//!
//! ```ignore
//! use tests::mock_infrastructure::{build_runtime, dedicated_source, test_config, UpstreamMock};
//!
//! let mut upstream = UpstreamMock::new().await;
//! upstream.json("/v1/items", r#"{"items":[]}"#, 1).await;
//!
//! let mut config = test_config();
//! config.sources.push(dedicated_source("catalog", &upstream.url()));
//! let runtime = build_runtime(config);
//! ```

pub mod test_helpers;
pub mod upstream_mock;

pub use test_helpers::*;
pub use upstream_mock::UpstreamMock;
