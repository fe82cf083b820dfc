//! UPnP Manager
//!
//! Keeps a user-edited list of port-forwarding rules and drives a UPnP
//! gateway to match it.
//!
//! # Architecture
//!
//! - [`core`] - Rule model, rule file persistence, gateway access, reconciliation
//! - [`audit`] - Audit logging for gateway and file operations
//! - [`validators`] - Port parsing and description sanitization
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories)

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::engine::{MappingOutcome, ReconciliationEngine};
pub use core::error::{Error, Result};
pub use core::mapping::{PortMappingRule, Protocol};
pub use core::store::RuleStore;
