pub mod cache;
pub mod chain;
pub mod constants;
pub mod egress;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod settings;

pub mod testing;

// Aggregation core
pub mod head;
pub mod multistream;
pub mod selector;
pub mod upstream;
