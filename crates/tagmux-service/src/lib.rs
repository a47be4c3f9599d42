//! HTTP control surface and reading pipeline for the tagmux coordinator.
//!
//! This crate provides a service that:
//! - Registers the configured consumers with a [`tagmux_core::Coordinator`]
//! - Wraps every reading in a message envelope and streams it over WebSocket
//! - Exposes the safe-to-connect, restart and tag-listing controls over HTTP
//!
//! # REST API Endpoints
//!
//! - `GET|POST /sensortag/safe` - Allow connecting
//! - `GET /sensortag/isscanning` - Scan state
//! - `GET|POST /sensortag/restart` - Disconnect everything and rescan
//! - `GET /sensortag/tags` - Tags seen in the current scan session
//! - `GET /api/health` - Service health check
//! - `GET /api/consumers` - Consumer status
//! - `WS /api/ws` - Real-time reading messages
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/tagmux/service.toml`:
//!
//! ```toml
//! message_prefix = "b827eb0a1b2c."
//!
//! [server]
//! bind = "127.0.0.1:1880"
//!
//! [coordinator]
//! reconnect_backoff_ms = 5000
//! initially_safe = false
//!
//! [[consumers]]
//! name = "kitchen"
//! tags = ["B0:B4:48:C9:8A:83"]
//! temperature = true
//! humidity = true
//! light = true
//! light_period = 2000
//! ```
//!
//! Consumers are registered in file order; when two name the same tag the
//! earlier one gets it.

pub mod api;
pub mod config;
pub mod pipeline;
pub mod state;
pub mod ws;

pub use config::{Config, ConfigError, ConsumerConfig, CoordinatorSettings, ServerConfig};
pub use pipeline::Pipeline;
pub use state::{AppState, ReadingMessage};
