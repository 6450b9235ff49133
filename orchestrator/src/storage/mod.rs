//! On-host configuration and state files

pub mod envfile;
pub mod layout;
pub mod settings;
