//! Server-side tools: the registry, argument validation and the built-in document tools

pub mod registry;
pub mod tools;
