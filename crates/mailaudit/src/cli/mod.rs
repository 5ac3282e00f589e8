//! CLI module for mailaudit

pub mod config;
pub mod error;
pub mod output;
pub mod scan;
pub mod status;
