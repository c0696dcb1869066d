pub mod config;
pub mod restore;
