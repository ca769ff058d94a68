//! # Page Analyzer
//!
//! A two-tier web page analyzer. A front-facing **scraping server** accepts
//! jobs from clients, fetches the target page and extracts its metadata, then
//! forwards the page to a back-end **processing server** that renders a
//! screenshot, analyzes the image, scores performance and audits the markup.
//! The scraping server merges both result sets into one response per job.
//!
//! ## Wire protocol
//!
//! All three roles speak the same framing: a 4-byte big-endian length
//! followed by a JSON message tagged by its `type` field. Binary fields such
//! as screenshots travel as base64 text.
//!
//! | Message | Direction |
//! |---------|-----------|
//! | `scrape_request` / `scrape_response` | client and scraping server |
//! | `analysis_request` / `analysis_response` | scraping and processing server |
//! | `heartbeat` | either direction |
//! | `error_reply` | rejection that keeps the connection open |
//!
//! Every scrape request gets exactly one response with status `ok`,
//! `partial` (some analyses missing) or `failed` (the page could not be
//! fetched).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use page_analyzer::{ClientConfig, ScrapeClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ScrapeClient::new(ClientConfig::default());
//!     let response = client.scrape("https://example.com").await?;
//!     println!("{}: {}", response.url, response.status);
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! page-analyzer processor -i 127.0.0.1 -p 9000 --max-workers 4
//! page-analyzer scraper -i 127.0.0.1 -p 8000 --proc-ip 127.0.0.1 --proc-port 9000
//! page-analyzer client -i 127.0.0.1 -p 8000 -u https://example.com --screenshot-out shot.png
//! ```

/// Length-prefixed JSON framing
pub mod codec;

/// Message catalog and correlation identifiers
pub mod protocol;

/// Page and analysis payload types
pub mod model;

/// Error types and error handling utilities
pub mod error;

/// Configuration for every role
pub mod config;

/// Framed TCP connections with a dedicated writer task
pub mod connection;

/// Peer liveness tracking
pub mod heartbeat;

/// Job lifecycle on the scraping server
pub mod job;

/// Bounded worker pool and concurrent analysis execution
pub mod worker;

/// The processing server
pub mod processing_server;

/// Multiplexed upstream link from the scraping server
pub mod processing_client;

/// The scraping server
pub mod scraping_server;

/// One-shot scrape client
pub mod client;

/// Analysis collaborators and their default implementations
pub mod plugins;

/// Command-line interface implementation
pub mod cli;

/// Performance metrics collection and monitoring
pub mod metrics;

/// Utility functions and helpers
pub mod utils;


pub use cli::*;
pub use client::*;
pub use codec::*;
pub use config::*;
pub use connection::*;
pub use error::*;
pub use heartbeat::*;
pub use job::*;
pub use self::metrics::*;
pub use model::*;
pub use plugins::{
    AnalysisPlugins, Extractor, Fetcher, ImageProcessor, PageAuditor, PerformanceScorer, ScrapePlugins,
    Screenshotter,
};
pub use processing_client::*;
pub use processing_server::*;
pub use protocol::*;
pub use scraping_server::*;
pub use utils::*;
pub use worker::*;
