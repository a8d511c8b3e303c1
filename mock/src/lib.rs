//! Mock types for testing.

pub mod serial;
