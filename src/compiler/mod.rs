pub mod registry;
pub mod loader;
pub mod inputs;
pub mod core;
