pub mod driver;
pub mod error;
pub mod native;
pub mod opentofu;
pub mod registry;

pub use driver::{
    ApplyResult, DestroyResult, Driver, DriverMetadata, ImportMapping, ImportResult,
    PlanResult, RetryPolicy,
};
pub use error::DriverError;
pub use native::NativeDriver;
pub use opentofu::OpenTofuDriver;
pub use registry::DriverRegistry;
