use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use inkhost_runtime::{RuntimeStatusInfo, SsrError, ThemeRuntimeStatus};
use tokio::process::Command;

use crate::readiness::{self, ProbeConfig};
use crate::registry::{RuntimeEntry, RuntimeRegistry};

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

fn stop_timeout_from_env() -> Duration {
    Duration::from_millis(
        env_u64("INKHOST_STOP_TIMEOUT_MS")
            .map(|v| v.clamp(1_000, 60_000))
            .unwrap_or(5_000),
    )
}

/// How the supervisor spawns and supervises theme runtimes.
///
/// `runtime_command` and `entry_point` exist so tests can stand in a shell
/// script for the real `node server.js` runtime.
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub themes_dir: PathBuf,
    pub upstream_api_url: String,
    pub runtime_command: String,
    pub entry_point: String,
    pub stop_timeout: Duration,
    pub probe: ProbeConfig,
}

impl SupervisorConfig {
    pub fn new(themes_dir: impl Into<PathBuf>) -> Self {
        Self {
            themes_dir: themes_dir.into(),
            upstream_api_url: "http://localhost:8091".to_string(),
            runtime_command: "node".to_string(),
            entry_point: "server.js".to_string(),
            stop_timeout: Duration::from_secs(5),
            probe: ProbeConfig::default(),
        }
    }

    pub fn from_env(themes_dir: impl Into<PathBuf>) -> Self {
        let mut cfg = Self::new(themes_dir);
        if let Ok(v) = std::env::var("INKHOST_UPSTREAM_API") {
            cfg.upstream_api_url = v;
        }
        if let Ok(v) = std::env::var("INKHOST_RUNTIME_COMMAND") {
            cfg.runtime_command = v;
        }
        if let Ok(v) = std::env::var("INKHOST_RUNTIME_ENTRY") {
            cfg.entry_point = v;
        }
        cfg.stop_timeout = stop_timeout_from_env();
        cfg.probe = ProbeConfig::from_env();
        cfg
    }
}

fn valid_theme_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the host process dies, the runtime must not linger and keep its port.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn terminate_group(pgid: i32) {
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
}

#[cfg(unix)]
fn kill_group(pgid: i32) {
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn terminate_group(_pgid: i32) {}

#[cfg(not(unix))]
fn kill_group(_pgid: i32) {}

fn read_version_file(theme_dir: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(theme_dir.join("version.txt")).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Owns the theme-name -> OS-process mapping and the safe start/stop of those
/// processes. All registry mutation goes through [`RuntimeRegistry`]; the
/// child handle itself lives in the per-instance reaper task.
#[derive(Clone)]
pub struct ProcessSupervisor {
    registry: RuntimeRegistry,
    config: Arc<SupervisorConfig>,
    http: reqwest::Client,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            registry: RuntimeRegistry::default(),
            config: Arc::new(config),
            http: reqwest::Client::new(),
        }
    }

    pub fn registry(&self) -> &RuntimeRegistry {
        &self.registry
    }

    pub fn themes_dir(&self) -> &Path {
        &self.config.themes_dir
    }

    fn theme_dir(&self, theme: &str) -> PathBuf {
        self.config.themes_dir.join(theme)
    }

    /// Spawns the runtime for `theme` on `port`.
    ///
    /// Returns once the process is spawned, not once it serves traffic:
    /// readiness is probed by a detached task and is advisory only.
    pub async fn start(&self, theme: &str, port: u16) -> Result<(), SsrError> {
        if !valid_theme_name(theme) {
            return Err(SsrError::NotInstalled(theme.to_string()));
        }

        let theme_dir = self.theme_dir(theme);
        let entry_path = theme_dir.join(&self.config.entry_point);
        if !entry_path.is_file() {
            return Err(SsrError::NotInstalled(theme.to_string()));
        }

        // Reserve the registry slot before spawning so a concurrent start for
        // the same theme fails instead of racing us into a second process.
        let reservation = RuntimeEntry {
            pid: None,
            pgid: None,
            port,
            started_at: Utc::now(),
        };
        if self.registry.try_insert(theme, reservation).is_err() {
            return Err(SsrError::AlreadyRunning(theme.to_string()));
        }

        let mut cmd = Command::new(&self.config.runtime_command);
        // The entry point is passed relative with cwd set to the theme dir:
        // the runtime's module resolution is directory-relative.
        cmd.arg(&self.config.entry_point)
            .current_dir(&theme_dir)
            .env("PORT", port.to_string())
            .env("HOSTNAME", "0.0.0.0")
            .env("API_URL", &self.config.upstream_api_url)
            .stdin(Stdio::null());

        // Append runtime output to a per-theme log file; losing the log file
        // must not prevent the theme from starting.
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(theme_dir.join("ssr.log"))
            .and_then(|f| Ok((f.try_clone()?, f)))
        {
            Ok((out, err)) => {
                cmd.stdout(Stdio::from(out)).stderr(Stdio::from(err));
            }
            Err(e) => {
                tracing::warn!(theme, error = %e, "could not open ssr.log, discarding runtime output");
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session so stop can signal the whole process tree.
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                self.registry.remove(theme);
                return Err(SsrError::SpawnFailed {
                    theme: theme.to_string(),
                    source: e,
                });
            }
        };

        let pid = child.id();
        let pgid = pid.map(|p| p as i32);
        self.registry.set_process(theme, pid, pgid);

        tracing::info!(theme, port, pid, "ssr runtime started");

        // Reaper: sole writer that clears an instance on unexpected exit.
        // Pid-guarded so it cannot delete an entry a later start re-created.
        {
            let registry = self.registry.clone();
            let theme = theme.to_string();
            tokio::spawn(async move {
                let status = child.wait().await;
                let removed = registry.remove_if_pid(&theme, pid);
                match status {
                    Ok(st) => {
                        tracing::info!(theme, exit_code = st.code(), removed, "ssr runtime exited")
                    }
                    Err(e) => {
                        tracing::warn!(theme, error = %e, removed, "wait on ssr runtime failed")
                    }
                }
            });
        }

        readiness::spawn_probe(
            self.registry.clone(),
            self.http.clone(),
            theme.to_string(),
            pid,
            port,
            self.config.probe.clone(),
        );

        Ok(())
    }

    /// Graceful-then-forced stop. Blocks at most the configured stop timeout
    /// before escalating to SIGKILL; the registry entry is gone when this
    /// returns, whichever way termination went.
    pub async fn stop(&self, theme: &str) -> Result<(), SsrError> {
        let entry = self
            .registry
            .get(theme)
            .ok_or_else(|| SsrError::NotRunning(theme.to_string()))?;

        if let Some(pgid) = entry.pgid {
            terminate_group(pgid);
        }

        // The reaper removes the entry when the process exits; poll for that
        // rather than holding any lock across the wait.
        let deadline = tokio::time::Instant::now() + self.config.stop_timeout;
        while tokio::time::Instant::now() < deadline {
            if !self.registry.is_running(theme) {
                tracing::info!(theme, "ssr runtime stopped");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if let Some(pgid) = entry.pgid {
            tracing::warn!(theme, "graceful stop timed out, sending SIGKILL");
            kill_group(pgid);
        }

        // Idempotent with the reaper: whoever gets there first wins.
        self.registry.remove(theme);
        tracing::info!(theme, "ssr runtime stopped (forced)");
        Ok(())
    }

    /// Stops every running runtime. Individual failures are logged and do not
    /// abort the sweep; the registry is empty afterwards.
    pub async fn stop_all(&self) -> Result<(), SsrError> {
        for theme in self.registry.list_running() {
            if let Err(e) = self.stop(&theme).await {
                tracing::warn!(theme, error = %e, "stop during sweep failed, continuing");
                self.registry.remove(&theme);
            }
        }
        Ok(())
    }

    pub fn is_running(&self, theme: &str) -> bool {
        self.registry.is_running(theme)
    }

    /// Port of a running theme, 0 when not running.
    pub fn port(&self, theme: &str) -> u16 {
        self.registry.port(theme)
    }

    pub fn list_running(&self) -> Vec<String> {
        self.registry.list_running()
    }

    /// Merged filesystem + registry view of one theme.
    pub fn status(&self, theme: &str) -> RuntimeStatusInfo {
        if !valid_theme_name(theme) {
            return RuntimeStatusInfo::not_installed(theme);
        }

        let theme_dir = self.theme_dir(theme);
        let meta = match std::fs::metadata(&theme_dir) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return RuntimeStatusInfo::not_installed(theme);
            }
            Err(_) => {
                let mut info = RuntimeStatusInfo::not_installed(theme);
                info.status = ThemeRuntimeStatus::Error;
                return info;
            }
        };

        let mut info = RuntimeStatusInfo {
            name: theme.to_string(),
            status: ThemeRuntimeStatus::Installed,
            version: read_version_file(&theme_dir),
            port: None,
            installed_at: meta.modified().ok().map(chrono::DateTime::from),
            started_at: None,
        };

        if let Some(entry) = self.registry.get(theme) {
            info.status = ThemeRuntimeStatus::Running;
            info.port = Some(entry.port);
            info.started_at = Some(entry.started_at);
        }

        info
    }

    /// Scans the themes root for directories carrying the runtime entry point.
    pub fn list_installed(&self) -> Vec<RuntimeStatusInfo> {
        let entries = match std::fs::read_dir(&self.config.themes_dir) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };

        let mut out = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if entry.path().join(&self.config.entry_point).is_file() {
                out.push(self.status(name));
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
