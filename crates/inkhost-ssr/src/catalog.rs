use async_trait::async_trait;

/// Seam to the persistent theme catalog, which owns installation records and
/// the per-scope "current theme" flag.
///
/// The store guarantees at most one current theme per scope;
/// `set_current_theme` is transactional (clear-all then set). The
/// orchestrator only consumes these as lookups and flips.
#[async_trait]
pub trait ThemeCatalog: Send + Sync {
    async fn is_installed(&self, scope: u32, theme: &str) -> anyhow::Result<bool>;

    /// The theme currently flagged as active for this scope, if any.
    async fn current_theme(&self, scope: u32) -> anyhow::Result<Option<String>>;

    async fn set_current_theme(&self, scope: u32, theme: &str) -> anyhow::Result<()>;

    async fn clear_current_theme(&self, scope: u32) -> anyhow::Result<()>;

    /// Number of records flagged current; used only for the advisory
    /// post-switch consistency check.
    async fn current_theme_count(&self, scope: u32) -> anyhow::Result<usize>;
}
