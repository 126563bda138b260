//! Test doubles for the domain traits.

mod mocks;

pub use mocks::{MockAuthorizationService, MockConfig, MockTelemetrySink, MockTipProbe};
