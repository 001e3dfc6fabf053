pub mod fixtures;
pub mod macros;
