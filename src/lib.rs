pub mod config;
pub mod data_io;
pub mod dataset;
pub mod error;
pub mod loss;
pub mod math;
pub mod network;
pub mod parallel;
pub mod time_utils;
pub mod training;
pub mod validation;

pub use error::{DincaeError, Result};
pub use time_utils::*;
