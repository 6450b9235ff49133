//! Integration tests, driven against an in-memory host

mod common;
mod test_proxy;
mod test_status;
