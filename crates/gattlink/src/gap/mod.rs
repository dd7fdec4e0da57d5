//! Generic Access Profile data: advertisement records and address types

pub mod advertisement;
pub mod constants;
pub mod types;

pub use constants::*;
pub use types::*;
