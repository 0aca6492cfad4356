//! Data-collection consent gating.

pub mod gate;

pub use gate::ConsentGate;
