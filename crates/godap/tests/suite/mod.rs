// Consolidated integration test suite, compiled by `tests/tests.rs`.
mod bridge_errors;
mod bridge_launch;
mod bridge_remote;
mod proxy;
