pub mod digest;
pub mod prober;

pub use prober::{probe, RtspUrl};
