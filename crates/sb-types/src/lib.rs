pub mod distribution;
pub mod errors;
pub mod rollout;

pub use distribution::*;
pub use errors::*;
pub use rollout::*;
