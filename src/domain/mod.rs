//! Core domain types for the review workflow.
//!
//! This module contains pure domain types with no persistence dependencies:
//! - Review requests, stages and evidence records
//! - Rules, transitions, conditions and actions
//! - Notification intents

pub mod intent;
pub mod request;
pub mod rule;
