//! Broadcast dispatch engine
//!
//! Delivers one message to every active recipient of a list through an
//! external transport:
//! - RateLimiter: global send-rate ceiling shared by all running broadcasts
//! - DispatchJob: live counters and cancellation signal of one broadcast
//! - JobRegistry: broadcasts currently executing
//! - Dispatcher: the sequential, paced dispatch loop
//! - BroadcastEngine: create, observe, cancel and list broadcasts

pub mod dispatch;
pub mod engine;
pub mod engine_metrics;
pub mod error;
pub mod job;
pub mod rate_limiter;
pub mod registry;
pub mod sink;

pub use dispatch::Dispatcher;
pub use engine::{BroadcastEngine, EngineConfig};
pub use error::BroadcastError;
pub use job::{CancelOutcome, DispatchJob};
pub use rate_limiter::RateLimiter;
pub use registry::JobRegistry;
pub use sink::{deliver, DeliveryError, DeliveryReceipt, MessagePayload, RecipientSink};

pub type Result<T> = std::result::Result<T, BroadcastError>;
