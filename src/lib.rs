//! # renderd
//!
//! A headless-browser rendering service: a long-lived HTTP server that
//! drives a pool of real Chrome processes through each request's lifecycle
//! (navigation, scripted waits, human-like scrolling, detection sweeps,
//! artifact capture) and returns a structured result. Engineered to look
//! like a genuine interactive user to anti-bot systems while offering
//! predictable latency, bounded concurrency, and graceful degradation
//! under load.
//!
//! ## Architecture
//!
//! ```text
//! RateLimiter ─┐
//!              ├─► RenderPipeline ─► ContextBroker ─► BrowserPool ─► Chrome (CDP)
//! Validator ───┘                                         ▲
//!                                                        │ health ticker
//! ```
//!
//! - **BrowserPool** owns N long-lived Chrome processes, tracks per-process
//!   lease counts, replaces dead processes, and queues acquisitions FIFO.
//! - **ContextBroker** leases an isolated page with stealth scripts,
//!   fingerprint overrides, and headers applied before first navigation.
//! - **RenderPipeline** executes the per-request stages under a single
//!   wall-clock deadline with a structured error taxonomy.
//! - **DetectionSuite** classifies the loaded page as ok / captcha /
//!   blocked / challenge from one shared snapshot.
//! - **RateLimiter** performs fixed-window per-client admission.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use renderd::{BrowserPool, Config, ContextBroker, RenderMetrics, RenderPipeline};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env();
//!     let pool = BrowserPool::new(config.clone());
//!     pool.initialize().await?;
//!
//!     let pipeline = RenderPipeline::new(
//!         ContextBroker::new(pool.clone()),
//!         config,
//!         Arc::new(RenderMetrics::new()),
//!     );
//!
//!     let body: renderd::api::RenderRequestBody =
//!         serde_json::from_str(r#"{"url": "https://example.com"}"#)?;
//!     let request = renderd::api::validate(body).expect("valid request");
//!     let response = pipeline.execute(request).await;
//!     println!("success: {}", response.success);
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Wire schema for `/v1/render` and the request validator
pub mod api;

/// Browser pool management for concurrent Chrome instances
pub mod browser_pool;

/// Command-line interface and logging setup
pub mod cli;

/// Service configuration from environment and CLI
pub mod config;

/// Context brokering: fingerprint merge, proxy validation, page preparation
pub mod context;

/// Page classification: CAPTCHA walls and WAF block pages
pub mod detection;

/// Error types and the stable error-code taxonomy
pub mod error;

/// Render and pool counters
pub mod metrics;

/// Render pipeline state machine
pub mod pipeline;

/// Fixed-window per-client admission control
pub mod rate_limit;

/// Human-like scroll engine
pub mod scroll;

/// HTTP façade
pub mod server;

/// Fingerprint masking script and header sets
pub mod stealth;

#[cfg(test)]
mod tests;

pub use api::{validate, RenderRequest, RenderResponse};
pub use browser_pool::{AcquireOptions, BrowserPool, Lease, PoolCapacity};
pub use cli::{setup_logging, Cli};
pub use config::{Config, PoolSettings, RateLimitSettings};
pub use context::{BrowserSettings, ContextBroker, ProxySettings};
pub use detection::{detect_block, detect_captcha, PageSnapshot};
pub use error::{ErrorCode, RenderError};
pub use metrics::RenderMetrics;
pub use pipeline::RenderPipeline;
pub use rate_limit::RateLimiter;
pub use server::AppState;
