//! User profiles and the onboarding gate.

pub mod gate;
pub mod model;

pub use gate::{GateDecision, GateOutcome, ProfileGate};
pub use model::{Gender, OnboardingStep, UserProfile};
