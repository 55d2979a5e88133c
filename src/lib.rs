//! Keel - distributed transaction & lifecycle engine.
//!
//! Keel mediates every state change that touches more than one persistent
//! store or external service. It is built from four cooperating components:
//!
//! - [`saga`]: multi-step workflows with per-step compensation, retries and
//!   timeouts.
//! - [`outbox`]: transactional outbox relay with at-least-once delivery.
//! - [`session`]: session and token lifecycle with rotation, reuse detection
//!   and revocation cascade.
//! - [`reconciler`]: periodic sweepers that expire, escalate and
//!   garbage-collect time-bound records.
//!
//! The shared invariant: no observable state change may produce an
//! inconsistent mix of durable writes, cache entries and downstream events.

pub mod bus;
pub mod cache;
pub mod compliance;
pub mod config;
pub mod dlq;
pub mod ids;
pub mod outbox;
pub mod reconciler;
pub mod saga;
pub mod session;
pub mod storage;
pub mod utils;

pub use bus::{BusError, EventEnvelope, MessageBus};
pub use outbox::{NewOutboxEvent, OutboxEvent, OutboxStatus};
pub use saga::{SagaDefinition, SagaOptions, SagaResult, SagaStatus};
pub use session::{AuthError, Session};
