pub mod backend;
pub mod error;
pub mod fs;
pub mod memory;
pub mod state;
pub mod store;

pub use backend::Backend;
pub use error::StoreError;
pub use fs::FsBackend;
pub use memory::MemoryBackend;
pub use state::{
    ComponentState, DatacenterState, EnvironmentRef, EnvironmentState,
    ExternalState, InstanceState, ResourceState, StateRecordError,
    input_digest, SCHEMA_VERSION,
};
pub use store::{keys, StateStore};
