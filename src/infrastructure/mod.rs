// Infrastructure layer - External dependencies and adapters
pub mod config;
pub mod memory_transport;
pub mod serial_transport;
