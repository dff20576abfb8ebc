// Domain layer - Protocol data models
pub mod command;
pub mod event;
pub mod parameters;
