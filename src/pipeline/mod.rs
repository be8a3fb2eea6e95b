//! Query classification, routing, and capability execution.

pub mod router;
pub mod types;

pub use router::{CapabilitySet, QueryRouter};
pub use types::{Capability, CapabilityResult, DraftReply, InboundEvent, MediaRef};
