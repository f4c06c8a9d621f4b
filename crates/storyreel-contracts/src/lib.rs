pub mod breakdown;
pub mod cache;
pub mod events;
pub mod recovery;
