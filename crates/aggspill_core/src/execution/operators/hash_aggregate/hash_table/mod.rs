pub mod base;
pub mod directory;
pub mod grouping;
