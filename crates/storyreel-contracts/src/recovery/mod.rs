mod normalize;
mod repair;

pub use normalize::normalize;
pub use repair::{parse_with_repair, ParseFailure, MAX_REPAIR_PASSES};
