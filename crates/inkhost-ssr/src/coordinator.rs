use std::sync::Arc;

use inkhost_runtime::SsrError;

use crate::catalog::ThemeCatalog;
use crate::supervisor::ProcessSupervisor;

/// Enforces the single-active-runtime policy: "switch to theme X" converges
/// the registry and the persisted current-theme flag onto X, with rollback on
/// partial failure.
///
/// The sequence is not atomic across the catalog and the registry; the proxy
/// tolerates the window by requiring both to agree before forwarding.
#[derive(Clone)]
pub struct ActivationCoordinator {
    supervisor: ProcessSupervisor,
    catalog: Arc<dyn ThemeCatalog>,
}

impl ActivationCoordinator {
    pub fn new(supervisor: ProcessSupervisor, catalog: Arc<dyn ThemeCatalog>) -> Self {
        Self {
            supervisor,
            catalog,
        }
    }

    /// Switches the active SSR theme to `theme`, started on `port` if it is
    /// not already running.
    pub async fn activate(&self, scope: u32, theme: &str, port: u16) -> Result<(), SsrError> {
        let installed = self
            .catalog
            .is_installed(scope, theme)
            .await
            .map_err(SsrError::Catalog)?;
        if !installed {
            return Err(SsrError::NotInstalled(theme.to_string()));
        }

        // Converging on the target matters more than perfect cleanup of
        // stragglers; stop failures for other themes do not abort the switch.
        for other in self.supervisor.list_running() {
            if other != theme {
                if let Err(e) = self.supervisor.stop(&other).await {
                    tracing::warn!(theme = %other, error = %e, "failed to stop previous runtime");
                }
            }
        }

        // Persist before ensuring the process runs: the proxy treats the flag
        // as the primary signal, and a start we may have to undo is cheaper
        // than a flag pointing at nothing we can roll back.
        let previous = self
            .catalog
            .current_theme(scope)
            .await
            .map_err(SsrError::Catalog)?;
        self.catalog
            .set_current_theme(scope, theme)
            .await
            .map_err(SsrError::ActivationPersistFailed)?;

        if !self.supervisor.is_running(theme) {
            if let Err(start_err) = self.supervisor.start(theme, port).await {
                // Undo the flag flip so the proxy never points at a theme
                // that failed to come up.
                let rollback = match previous.as_deref() {
                    Some(prev) => self.catalog.set_current_theme(scope, prev).await,
                    None => self.catalog.clear_current_theme(scope).await,
                };
                if let Err(e) = rollback {
                    tracing::warn!(
                        scope,
                        theme,
                        error = %e,
                        "activation rollback failed, persisted state may be inconsistent"
                    );
                }
                return Err(start_err);
            }
        }

        self.check_single_current(scope).await;
        tracing::info!(scope, theme, port, "ssr theme activated");
        Ok(())
    }

    /// Returns the scope to the built-in renderer. The flag is cleared FIRST
    /// so the proxy stops forwarding even if stopping the processes fails;
    /// deactivation fails safe toward not proxying.
    pub async fn deactivate(&self, scope: u32) -> Result<(), SsrError> {
        self.catalog
            .clear_current_theme(scope)
            .await
            .map_err(SsrError::ActivationPersistFailed)?;

        if let Err(e) = self.supervisor.stop_all().await {
            tracing::warn!(scope, error = %e, "stop sweep after deactivation failed");
        }

        match self.catalog.current_theme_count(scope).await {
            Ok(0) => {}
            Ok(n) => {
                tracing::warn!(scope, current = n, "themes still flagged current after deactivation")
            }
            Err(e) => tracing::warn!(scope, error = %e, "post-deactivation consistency check failed"),
        }

        tracing::info!(scope, "switched back to built-in renderer");
        Ok(())
    }

    /// Advisory only: the catalog may be touched outside this flow, so an
    /// unexpected count is logged, never raised.
    async fn check_single_current(&self, scope: u32) {
        match self.catalog.current_theme_count(scope).await {
            Ok(1) => {}
            Ok(n) => tracing::warn!(scope, current = n, "expected exactly one current theme"),
            Err(e) => tracing::warn!(scope, error = %e, "post-switch consistency check failed"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::readiness::ProbeConfig;
    use crate::supervisor::SupervisorConfig;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use std::sync::RwLock;
    use std::time::Duration;

    #[derive(Default)]
    struct MemoryCatalog {
        installed: RwLock<HashSet<(u32, String)>>,
        current: RwLock<HashMap<u32, String>>,
        fail_persist: RwLock<bool>,
    }

    impl MemoryCatalog {
        fn install(&self, scope: u32, theme: &str) {
            self.installed
                .write()
                .unwrap()
                .insert((scope, theme.to_string()));
        }

        fn set_fail_persist(&self, fail: bool) {
            *self.fail_persist.write().unwrap() = fail;
        }

        fn current_of(&self, scope: u32) -> Option<String> {
            self.current.read().unwrap().get(&scope).cloned()
        }
    }

    #[async_trait]
    impl ThemeCatalog for MemoryCatalog {
        async fn is_installed(&self, scope: u32, theme: &str) -> anyhow::Result<bool> {
            Ok(self
                .installed
                .read()
                .unwrap()
                .contains(&(scope, theme.to_string())))
        }

        async fn current_theme(&self, scope: u32) -> anyhow::Result<Option<String>> {
            Ok(self.current_of(scope))
        }

        async fn set_current_theme(&self, scope: u32, theme: &str) -> anyhow::Result<()> {
            if *self.fail_persist.read().unwrap() {
                anyhow::bail!("catalog write refused");
            }
            self.current
                .write()
                .unwrap()
                .insert(scope, theme.to_string());
            Ok(())
        }

        async fn clear_current_theme(&self, scope: u32) -> anyhow::Result<()> {
            if *self.fail_persist.read().unwrap() {
                anyhow::bail!("catalog write refused");
            }
            self.current.write().unwrap().remove(&scope);
            Ok(())
        }

        async fn current_theme_count(&self, scope: u32) -> anyhow::Result<usize> {
            Ok(usize::from(self.current.read().unwrap().contains_key(&scope)))
        }
    }

    fn test_supervisor(themes_dir: &Path) -> ProcessSupervisor {
        let mut cfg = SupervisorConfig::new(themes_dir);
        cfg.runtime_command = "sh".to_string();
        cfg.stop_timeout = Duration::from_secs(3);
        cfg.probe = ProbeConfig {
            interval: Duration::from_millis(50),
            request_timeout: Duration::from_millis(100),
            max_wait: Duration::from_millis(200),
        };
        ProcessSupervisor::new(cfg)
    }

    fn install_theme_files(themes_dir: &Path, name: &str) {
        let dir = themes_dir.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("server.js"), "sleep 30\n").unwrap();
    }

    const SCOPE: u32 = 1;

    #[tokio::test]
    async fn switching_converges_on_the_target() {
        let tmp = tempfile::tempdir().unwrap();
        install_theme_files(tmp.path(), "theme-a");
        install_theme_files(tmp.path(), "theme-b");

        let catalog = Arc::new(MemoryCatalog::default());
        catalog.install(SCOPE, "theme-a");
        catalog.install(SCOPE, "theme-b");

        let supervisor = test_supervisor(tmp.path());
        let coord = ActivationCoordinator::new(supervisor.clone(), catalog.clone());

        coord.activate(SCOPE, "theme-a", 3001).await.unwrap();
        assert!(supervisor.is_running("theme-a"));
        assert_eq!(catalog.current_of(SCOPE).as_deref(), Some("theme-a"));

        coord.activate(SCOPE, "theme-b", 3002).await.unwrap();
        assert!(!supervisor.is_running("theme-a"));
        assert!(supervisor.is_running("theme-b"));
        assert_eq!(catalog.current_of(SCOPE).as_deref(), Some("theme-b"));
        assert_eq!(supervisor.list_running(), vec!["theme-b".to_string()]);

        coord.deactivate(SCOPE).await.unwrap();
    }

    #[tokio::test]
    async fn uninstalled_target_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MemoryCatalog::default());
        let supervisor = test_supervisor(tmp.path());
        let coord = ActivationCoordinator::new(supervisor, catalog);

        let err = coord.activate(SCOPE, "ghost", 3001).await.unwrap_err();
        assert!(matches!(err, SsrError::NotInstalled(_)));
    }

    #[tokio::test]
    async fn persist_failure_leaves_nothing_started() {
        let tmp = tempfile::tempdir().unwrap();
        install_theme_files(tmp.path(), "theme-a");

        let catalog = Arc::new(MemoryCatalog::default());
        catalog.install(SCOPE, "theme-a");
        catalog.set_fail_persist(true);

        let supervisor = test_supervisor(tmp.path());
        let coord = ActivationCoordinator::new(supervisor.clone(), catalog.clone());

        let err = coord.activate(SCOPE, "theme-a", 3001).await.unwrap_err();
        assert!(matches!(err, SsrError::ActivationPersistFailed(_)));
        assert!(!supervisor.is_running("theme-a"));
        assert_eq!(catalog.current_of(SCOPE), None);
    }

    #[tokio::test]
    async fn start_failure_rolls_the_flag_back() {
        let tmp = tempfile::tempdir().unwrap();
        install_theme_files(tmp.path(), "theme-a");
        // theme-b exists in the catalog but has no runtime files on disk,
        // so the supervisor start will fail after the flag already flipped.
        let catalog = Arc::new(MemoryCatalog::default());
        catalog.install(SCOPE, "theme-a");
        catalog.install(SCOPE, "theme-b");

        let supervisor = test_supervisor(tmp.path());
        let coord = ActivationCoordinator::new(supervisor.clone(), catalog.clone());

        coord.activate(SCOPE, "theme-a", 3001).await.unwrap();
        let err = coord.activate(SCOPE, "theme-b", 3002).await.unwrap_err();
        assert!(matches!(err, SsrError::NotInstalled(_)));
        assert_eq!(catalog.current_of(SCOPE).as_deref(), Some("theme-a"));
        assert!(!supervisor.is_running("theme-b"));
    }

    #[tokio::test]
    async fn start_failure_with_no_previous_theme_clears_the_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Arc::new(MemoryCatalog::default());
        catalog.install(SCOPE, "theme-b");

        let supervisor = test_supervisor(tmp.path());
        let coord = ActivationCoordinator::new(supervisor, catalog.clone());

        let err = coord.activate(SCOPE, "theme-b", 3002).await.unwrap_err();
        assert!(matches!(err, SsrError::NotInstalled(_)));
        assert_eq!(catalog.current_of(SCOPE), None);
    }

    #[tokio::test]
    async fn activating_a_running_theme_does_not_restart_it() {
        let tmp = tempfile::tempdir().unwrap();
        install_theme_files(tmp.path(), "theme-a");
        let catalog = Arc::new(MemoryCatalog::default());
        catalog.install(SCOPE, "theme-a");

        let supervisor = test_supervisor(tmp.path());
        let coord = ActivationCoordinator::new(supervisor.clone(), catalog.clone());

        coord.activate(SCOPE, "theme-a", 3001).await.unwrap();
        let pid_before = supervisor.registry().get("theme-a").unwrap().pid;

        coord.activate(SCOPE, "theme-a", 3001).await.unwrap();
        let pid_after = supervisor.registry().get("theme-a").unwrap().pid;
        assert_eq!(pid_before, pid_after);
    }

    #[tokio::test]
    async fn deactivation_clears_flag_and_stops_runtimes() {
        let tmp = tempfile::tempdir().unwrap();
        install_theme_files(tmp.path(), "theme-a");
        let catalog = Arc::new(MemoryCatalog::default());
        catalog.install(SCOPE, "theme-a");

        let supervisor = test_supervisor(tmp.path());
        let coord = ActivationCoordinator::new(supervisor.clone(), catalog.clone());

        coord.activate(SCOPE, "theme-a", 3001).await.unwrap();
        coord.deactivate(SCOPE).await.unwrap();

        assert_eq!(catalog.current_of(SCOPE), None);
        assert!(supervisor.list_running().is_empty());
    }
}
