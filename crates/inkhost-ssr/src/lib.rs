pub mod catalog;
pub mod coordinator;
pub mod readiness;
pub mod registry;
pub mod supervisor;

pub use catalog::ThemeCatalog;
pub use coordinator::ActivationCoordinator;
pub use registry::RuntimeRegistry;
pub use supervisor::{ProcessSupervisor, SupervisorConfig};
