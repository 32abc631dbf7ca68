pub mod broker;
pub mod cache;
pub mod market;
pub mod model;
pub mod services;
pub mod strategy;
