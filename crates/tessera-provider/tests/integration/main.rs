//! Integration tests for tessera-provider
//!
//! Uses wiremock to simulate the REST object store and runs the same
//! provider contract against every adapter.

mod common;

mod test_contract;
mod test_object_store;
