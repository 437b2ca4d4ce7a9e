//! Messaging and shared-state plumbing for Conclave services.
//!
//! Agents and orchestrators never call each other directly: they publish
//! [`EventEnvelope`](conclave_core::EventEnvelope)s to topics on a
//! [`MessageBus`] and discover each other through the [`AgentRegistry`],
//! which lives in a [`StateStore`] shared by every participant.
//!
//! # Main types
//!
//! - [`MessageBus`]: Publish/subscribe abstraction with event-type routing.
//! - [`InMemoryMessageBus`]: In-process bus over bounded tokio channels.
//! - [`HttpMessageBus`]: Forwards selected topics to remote services over HTTP.
//! - [`StateStore`]: Key/value store with etag-based optimistic concurrency.
//! - [`SqliteStateStore`]: Store shared by every process on one host.
//! - [`AgentRegistry`]: Directory of agents sharing a bus.

/// Message bus trait, subscriptions and the in-memory implementation.
pub mod bus;
/// HTTP-forwarding bus.
pub mod http;
/// Agent metadata registry.
pub mod registry;
/// State stores.
pub mod state;

pub use bus::{
    dead_letter, Delivery, InMemoryMessageBus, MessageBus, RouteRule, Subscription,
    SubscriptionSet,
};
pub use http::HttpMessageBus;
pub use registry::{AgentMetadata, AgentRegistry};
pub use state::{
    load_json, save_json, InMemoryStateStore, SqliteStateStore, StateItem, StateStore,
    WriteCondition,
};
