//! Wire-level API mappings shared by providers.

pub mod assistants;
pub mod openai;
