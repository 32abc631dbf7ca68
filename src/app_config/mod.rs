pub mod env;
pub mod log;
pub mod redis;
pub mod settings;
