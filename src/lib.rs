#![forbid(unsafe_code)]

pub mod acquire;
pub mod book;
pub mod browser;
pub mod cache;
pub mod cli;
pub mod error;
pub mod fetch;
pub mod intercept;
pub mod logging;
pub mod pagination;
pub mod session;
