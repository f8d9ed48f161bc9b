// Needed for certain macros
#![recursion_limit = "256"]

pub mod cache;
pub mod cli;
pub mod http;
pub mod store;
pub mod tasks;
pub mod tollgate;
