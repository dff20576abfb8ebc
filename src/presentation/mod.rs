// Presentation layer - Terminal front end
pub mod console;
