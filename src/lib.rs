pub mod config;
pub mod errors;
pub mod import;
pub mod office;
pub mod report;
