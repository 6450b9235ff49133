//! Command implementations behind the CLI

pub mod inspect;
pub mod options;
pub mod run;
