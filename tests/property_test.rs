// tests/property_test.rs

//! Property-based tests for the controller.
//!
//! These tests use property-based testing to verify invariants that must
//! hold regardless of input values: persisted-state round-trips, ID
//! counter monotonicity, and role-assignment soundness.

mod property {
    pub mod assignment_test;
    pub mod roundtrip_test;
}
