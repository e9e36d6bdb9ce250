pub mod manager;
pub mod relay;
pub mod router;
