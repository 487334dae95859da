// carechat-common: wire protocol and shared domain types for the care chat gateway

pub mod content;
pub mod protocol;
pub mod types;
