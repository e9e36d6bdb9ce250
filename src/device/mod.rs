pub mod btle;
pub mod constants;
pub mod transport;
pub mod types;
