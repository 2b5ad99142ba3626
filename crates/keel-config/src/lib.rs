//! Keel Config
//!
//! This crate contains the serializable tuning knobs for a keel engine: how
//! long to wait before retrying a failed component, how quickly that delay
//! grows, and how long a stopping worker is given to exit.
//!
//! Configuration can be loaded from:
//! - JSON files (via CLI with `--config=engine.json`)
//! - Inline JSON strings
//!
//! Every field has a default, so an empty object is a valid configuration.
//!
//! ```json
//! {
//!   "error_delay_ms": 3000,
//!   "bounce_delay_ms": 10,
//!   "backoff_factor": 2.0,
//!   "max_delay_ms": 120000,
//!   "stop_grace_ms": 10000,
//!   "jitter": true
//! }
//! ```

mod engine;
mod error;

pub use engine::EngineConfig;
pub use error::ConfigError;
