use std::sync::Arc;

use inkhost_ssr::{ActivationCoordinator, ProcessSupervisor, ThemeCatalog};

/// Scope under which activation state is kept. The platform runs
/// single-tenant today; the catalog schema is per-scope already.
pub const ADMIN_SCOPE: u32 = 1;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: ProcessSupervisor,
    pub coordinator: ActivationCoordinator,
    pub catalog: Arc<dyn ThemeCatalog>,
    /// Shared upstream client for the reverse proxy.
    pub http: reqwest::Client,
    /// Port handed to a runtime when the start request names none.
    pub default_ssr_port: u16,
}
