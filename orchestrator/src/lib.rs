//! vpsctl library
//!
//! Drives a single VPS toward a declared deployment of a Node.js web
//! application backed by PostgreSQL, supervised by PM2 and fronted by nginx.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod host;
pub mod logs;
pub mod models;
pub mod storage;
pub mod utils;
