//! Template-driven scan orchestration engine.
//!
//! The engine coordinates scanning a set of targets with a set of probe
//! templates: deduplicated target storage that spills to disk past a
//! memory budget, a continuous rate limiter shared by every worker,
//! positional checkpointing for interrupted runs, correlation of delayed
//! out-of-band interactions back to the probe that triggered them, and
//! periodic progress reporting.
//!
//! Protocol execution and template parsing stay outside: callers supply a
//! [`ProbeExecutor`] and a [`TemplateCatalog`] and receive matches through
//! a [`ResultSink`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use scanforge::{ScanConfig, ScanEngine, StandardWriter, Target, TemplateFilter};
//! # use scanforge::{StaticCatalog, Outcome, ProbeContext, ProbeExecutor, Template};
//! # struct MyProber;
//! # #[async_trait::async_trait]
//! # impl ProbeExecutor for MyProber {
//! #     async fn execute(&self, _: &Target, _: &Template, _: &ProbeContext)
//! #         -> scanforge::Result<Outcome> { Ok(Outcome::no_match()) }
//! # }
//! # async fn scan(catalog: StaticCatalog) -> scanforge::Result<()> {
//! let engine = ScanEngine::new(
//!     ScanConfig::default(),
//!     vec![Target::new("https://example.com")],
//!     &catalog,
//!     &TemplateFilter::default(),
//!     Arc::new(MyProber),
//!     Arc::new(StandardWriter::stdout()),
//! )?;
//! let found = engine.run().await?;
//! engine.close().await;
//! # let _ = found;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod interactions;
pub mod output;
pub mod progress;
pub mod ratelimit;
pub mod targets;

pub use catalog::{StaticCatalog, Template, TemplateCatalog, TemplateFilter};
pub use config::ScanConfig;
pub use engine::ScanEngine;
pub use error::{EngineError, Result};
pub use executor::{Outcome, ProbeContext, ProbeExecutor};
pub use output::{ResultSink, ScanResult, StandardWriter};
pub use targets::Target;
