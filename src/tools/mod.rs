pub mod cycle;
pub mod patterns;
pub mod snapshot;
