//! Fire-response drone dispatch simulation.
//!
//! An incident source reports fires to a central [`dispatcher`], which
//! keeps them in severity order and hands each to an idle [`unit`]. Units
//! fly out, drop agent, refill at base when empty and report back; faulted
//! units hand their fire back for reassignment.

pub mod bounded_buffer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod incident;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod sim;
pub mod task_queue;
pub mod transport;
pub mod types;
pub mod unit;
pub mod worker_pool;
pub mod zones;
