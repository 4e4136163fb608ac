pub mod cancel;
pub mod operators;
pub mod source;
