//! # Rate Limiting Feature
//!
//! Process-wide admission control against the remote API's shared budget.
//!
//! - **Version**: 2.0.0
//! - **Since**: 0.1.0
//! - **Toggleable**: false

pub mod governor;

pub use governor::{GlobalRateGovernor, GovernorConfig};
