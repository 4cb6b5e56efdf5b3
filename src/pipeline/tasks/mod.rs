//! Individual task implementations, one module per family.

pub mod abi;
pub mod http;
pub mod json;
pub mod math;
pub mod misc;
pub mod strings;
