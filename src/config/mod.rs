pub mod settings;
pub mod strategies;
