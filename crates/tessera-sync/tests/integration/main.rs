//! Integration tests for tessera-sync
//!
//! Full synchronization rounds between devices sharing in-memory providers.
//! Every device gets its own sync root and state directory.

mod common;

mod test_rounds;
