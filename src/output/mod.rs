//! Run report output

pub mod json;
pub mod text;
