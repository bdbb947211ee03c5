pub mod bridge;
pub mod broker;
pub mod executor;
pub mod homeassistant;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod providers;
pub mod readiness;
