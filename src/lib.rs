// src/lib.rs

pub mod config;
pub mod countries;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod process;
pub mod record;
pub mod run;
pub mod write;
