//! Latency-aware placement controller
//!
//! A closed-loop placement engine for replicated applications spread over
//! geographically distant nodes: a scheduler explores nodes for pending
//! pods, per-pod sidecars measure real user latency, and a descheduler
//! evicts pods from nodes that miss the app's latency thresholds while a
//! routing manager steers every user to the pod found best for them.

pub mod config;
pub mod descheduler;
pub mod error;
pub mod k8s;
pub mod proxy;
pub mod router;
pub mod scheduler;
pub mod sidecar;
pub mod store;
