//! Data models

pub mod credentials;
pub mod deployment;
pub mod route;
pub mod service;
