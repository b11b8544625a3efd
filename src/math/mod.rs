pub mod binning;
pub mod interpolate;
pub mod stats;

pub use binning::*;
pub use interpolate::*;
pub use stats::*;
