pub mod array;
pub mod batch;
pub mod datatype;
pub mod encoding;
pub mod hash;
pub mod row;
pub mod scalar;
