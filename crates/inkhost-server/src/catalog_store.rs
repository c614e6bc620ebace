use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

use anyhow::Context;
use async_trait::async_trait;
use inkhost_ssr::ThemeCatalog;
use serde::{Deserialize, Serialize};

/// On-disk activation state, one current theme per scope. Kept tiny so the
/// whole file can be rewritten atomically on every change.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ActivationFile {
    current: HashMap<u32, String>,
}

/// File-backed [`ThemeCatalog`]. Install state is read straight off the
/// themes directory; the current-theme flag lives in `activation.json` under
/// the data directory and survives host restarts.
pub struct JsonCatalog {
    themes_dir: PathBuf,
    entry_point: String,
    state_path: PathBuf,
    cache: RwLock<ActivationFile>,
}

impl JsonCatalog {
    pub fn open(
        themes_dir: impl Into<PathBuf>,
        entry_point: impl Into<String>,
        data_dir: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        let state_path = data_dir.as_ref().join("activation.json");
        let state = match fs::read(&state_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", state_path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ActivationFile::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", state_path.display()));
            }
        };

        Ok(Self {
            themes_dir: themes_dir.into(),
            entry_point: entry_point.into(),
            state_path,
            cache: RwLock::new(state),
        })
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, ActivationFile> {
        self.cache.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutates the cached state and persists it, rolling the cache back if
    /// the write does not land. Callers observing an error can rely on the
    /// old state still being served.
    fn update<F>(&self, apply: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut ActivationFile),
    {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        let before = cache.current.clone();
        apply(&mut cache);

        if let Err(e) = persist(&self.state_path, &cache) {
            cache.current = before;
            return Err(e);
        }
        Ok(())
    }
}

fn persist(path: &Path, state: &ActivationFile) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(state).context("serializing activation state")?;
    let tmp = path.with_extension("json.tmp");
    if let Err(e) = fs::write(&tmp, json) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("writing {}", tmp.display()));
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("replacing {}", path.display()));
    }
    Ok(())
}

#[async_trait]
impl ThemeCatalog for JsonCatalog {
    async fn is_installed(&self, _scope: u32, theme: &str) -> anyhow::Result<bool> {
        // Same criterion the supervisor uses: an entry point on disk.
        Ok(self.themes_dir.join(theme).join(&self.entry_point).is_file())
    }

    async fn current_theme(&self, scope: u32) -> anyhow::Result<Option<String>> {
        Ok(self.read_cache().current.get(&scope).cloned())
    }

    async fn set_current_theme(&self, scope: u32, theme: &str) -> anyhow::Result<()> {
        self.update(|state| {
            state.current.insert(scope, theme.to_string());
        })
    }

    async fn clear_current_theme(&self, scope: u32) -> anyhow::Result<()> {
        self.update(|state| {
            state.current.remove(&scope);
        })
    }

    async fn current_theme_count(&self, scope: u32) -> anyhow::Result<usize> {
        Ok(usize::from(self.read_cache().current.contains_key(&scope)))
    }
}
