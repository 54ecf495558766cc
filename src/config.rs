use std::path::{Path, PathBuf};

/// Default number of concurrently-resident provider sessions.
pub const DEFAULT_MAX_SLOTS: usize = 4;

/// Daemon configuration: state root plus the defaults new agents inherit.
#[derive(Debug, Clone)]
pub struct SubstratConfig {
    /// Root of all daemon state (`agents/`, `workspaces/`, `daemon.sock`).
    pub root: PathBuf,
    /// Multiplexer slot budget.
    pub max_slots: usize,
    /// Provider for agents created without an explicit provider.
    pub default_provider: String,
    /// Model for agents created without an explicit model.
    pub default_model: String,
}

impl SubstratConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_slots: DEFAULT_MAX_SLOTS,
            default_provider: "cli-agent".into(),
            default_model: String::new(),
        }
    }

    pub fn with_max_slots(mut self, max_slots: usize) -> Self {
        self.max_slots = max_slots;
        self
    }

    pub fn with_defaults(
        mut self,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        self.default_provider = provider.into();
        self.default_model = model.into();
        self
    }

    /// Per-agent state directories live here, one per session uuid.
    pub fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.root.join("workspaces")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root.join("daemon.sock")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for SubstratConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".substrat"))
    }
}
