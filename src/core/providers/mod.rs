pub mod advantage_air;
pub mod error;
pub mod huawei;
pub mod registry;
pub mod traits;
pub mod zeversolar;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{DeviceError, ProviderError};
pub use registry::ProviderManager;
pub use traits::{Observations, Provider};
