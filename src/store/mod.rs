//! Shared in-memory state: latency measurements, per-app thresholds and
//! user/cluster associations.
//!
//! The stores are constructed once at startup and handed to the scheduler
//! and descheduler as `Arc` handles.

pub mod associations;
pub mod measurements;
pub mod thresholds;

pub use associations::{AssociationMap, AssociationStore, ClusterInfo};
pub use measurements::{sorted_nodes_by_measurement, LatencySample, MeasurementMap, MeasurementStore};
pub use thresholds::ThresholdStore;
