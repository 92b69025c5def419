pub mod base;
pub mod config;
pub mod copyset;
pub mod docker;
pub mod error;
pub mod health;
pub mod installer;
pub mod launcher;
pub mod manifest;
pub mod meta;
pub mod native;
pub mod recipe;
pub mod sysdeps;
pub mod templates;
pub mod utils;
