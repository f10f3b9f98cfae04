//! Request aggregate - domain model and state transitions.
//!
//! This module contains the core domain logic for review requests:
//! - Request, stage and evidence types
//! - The transition executor (submission and stage advancement)

pub mod state;
pub mod transitions;

// Re-export commonly used types
pub use state::*;
pub use transitions::TransitionOutcome;
