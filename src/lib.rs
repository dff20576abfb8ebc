// Host-side client for the injector test bench serial protocol
pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;
