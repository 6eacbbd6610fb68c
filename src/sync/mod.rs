pub mod correlate;
pub mod engine;
pub mod executor;
pub mod preview;

pub use engine::{BatchOutcome, SyncEngine};
pub use executor::{HoursMap, SyncResult};
pub use preview::SyncPreview;

#[cfg(test)]
mod tests;
