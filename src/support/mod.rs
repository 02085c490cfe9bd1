//! Injected ambient collaborators (clock, id factory, decimal helpers) used
//! across drift detection, reconciliation, and adjustment so tests can pin
//! time, randomness, and identifiers instead of observing wall-clock state.

pub mod clock;
pub mod decimal;
pub mod ids;

pub use clock::{Clock, SystemClock};
pub use ids::{RunIdFactory, UuidRunIdFactory};
