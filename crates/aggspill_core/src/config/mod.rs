pub mod aggregate;
pub mod settings;
