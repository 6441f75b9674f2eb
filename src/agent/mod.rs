//! Edge agent: periodic host sampling plus a resilient MQTT publisher.
//!
//! Two independent tasks share nothing but a channel:
//!
//! ```text
//! Sampler (interval timer) ──samples──▶ PublisherActor
//!                                          │ owns OfflineQueue
//!                                          │ DISCONNECTED → CONNECTING → CONNECTED
//!                                          ▼
//!                                    MQTT broker (QoS 1)
//! ```
//!
//! Sampling never blocks on the network: samples are handed to the publisher
//! over an unbounded channel and buffered in the bounded [`crate::queue::OfflineQueue`]
//! while the broker is unreachable. The publisher drains the queue in FIFO
//! order and only removes an entry once the broker acknowledged it.

pub mod backoff;
pub mod publisher;
pub mod sampler;
