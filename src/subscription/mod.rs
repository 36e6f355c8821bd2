//! Subscription module - pattern registrations and message routing.
//!
//! The [`SubscriptionRegistry`] maps compiled channel patterns to
//! subscriber-owned channels. Each inbound data message is delivered to
//! every matching subscription (fan-out).
//!
//! # Backpressure
//!
//! Delivery never blocks the read loop. Each subscriber channel is bounded
//! by its owner; when it is full the message is dropped for that subscriber
//! only and counted in [`SubscriptionInfo::dropped`]. Subscribers whose
//! receiver has been dropped are pruned on the next delivery attempt.

mod registry;

pub use registry::{RouteOutcome, SubscriptionId, SubscriptionInfo, SubscriptionRegistry};
