//! Core port-mapping functionality
//!
//! This module contains the rule model, its persistence, and the logic that
//! drives a UPnP gateway to match the rule list:
//!
//! - [`mapping`]: Data structures for port-mapping rules
//! - [`store`]: The editable rule list and preset file load/save
//! - [`gateway`]: Gateway discovery and mapping calls
//! - [`engine`]: Reconciliation of the rule list against the gateway
//! - [`error`]: Error types for all of the above

pub mod engine;
pub mod error;
pub mod gateway;
pub mod mapping;
pub mod store;

#[cfg(test)]
pub mod test_helpers;
