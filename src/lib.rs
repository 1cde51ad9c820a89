//! Offline-first request interception and cache engine.
//!
//! standby sits between a client application and the network. Every outgoing
//! GET request is classified to a (tier, strategy) route and executed against
//! a set of named, versioned cache tiers; client writes that fail while
//! offline are queued durably and redelivered when connectivity returns.
//!
//! The crate is organized as:
//! - [`route`]: pure request classification
//! - [`tier`]: versioned cache tier storage
//! - [`strategy`]: the caching strategies themselves
//! - [`sync`]: the durable sync queue
//! - [`lifecycle`]: install/activate transitions and periodic maintenance
//! - [`engine`]: the facade tying everything together

pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod message;
pub mod net;
pub mod route;
pub mod strategy;
pub mod sync;
pub mod tier;

pub use config::Config;
pub use engine::Engine;
pub use error::EngineError;
pub use http::{RequestDescriptor, ResponseSnapshot};
pub use message::{ClientMessage, Notice};
pub use strategy::Strategy;
