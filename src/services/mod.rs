//! Background Services Module
//!
//! Runs the engine's periodic work outside the ingestion and query paths.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  spawn / shutdown  ┌──────────────────┐  process()  ┌─────────────┐
//! │ ServiceManager  │───────────────────▶│ CollectorService │────────────▶│ BucketStore │
//! └─────────────────┘                    └──────────────────┘             └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use kuba_rollup::services::{ServiceConfig, ServiceManager};
//!
//! let manager = ServiceManager::new(ServiceConfig::default());
//! assert_eq!(manager.status().len(), 0);
//! ```

pub mod framework;

pub use framework::{Service, ServiceConfig, ServiceError, ServiceManager, ServiceStatus};
