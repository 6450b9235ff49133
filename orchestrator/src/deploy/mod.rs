//! Deployment pipeline components

pub mod builder;
pub mod certificate;
pub mod credentials;
pub mod database;
pub mod fixer;
pub mod fsm;
pub mod orchestrator;
pub mod prereqs;
pub mod proxy;
pub mod status;
pub mod supervisor;
pub mod verifier;
