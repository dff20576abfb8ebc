// Application layer - Protocol engine and connection lifecycle
pub mod command_encoder;
pub mod decoder;
pub mod device_session;
pub mod line_framer;
pub mod parameter_store;
pub mod transport;
