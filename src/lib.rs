pub mod api;
pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod extract;
pub mod fs_util;
pub mod output;
pub mod restore;
pub mod resume;
pub mod store;
