pub mod config;
pub mod conversions;
pub mod offset;
pub mod pipeline;
pub mod table;
