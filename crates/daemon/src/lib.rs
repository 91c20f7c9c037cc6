pub mod credentials;
#[cfg(feature = "fuse")]
pub mod fuse;
pub mod process;
pub mod service_config;

pub use process::{spawn_service, start_service, ServiceError, ShutdownHandle};
pub use service_config::Config as ServiceConfig;
