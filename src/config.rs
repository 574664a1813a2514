use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::task::Role;
use crate::{mlog_debug, Error, Result};

fn default_slots() -> HashMap<String, usize> {
    let mut slots = HashMap::new();
    slots.insert(Role::Architect.to_string(), 1);
    slots.insert(Role::Developer.to_string(), 3);
    slots.insert(Role::Tester.to_string(), 2);
    slots.insert(Role::Integrator.to_string(), 1);
    slots
}

fn default_agent_timeout_secs() -> u64 {
    600
}

fn default_command_timeout_secs() -> u64 {
    300
}

fn default_retry_budget() -> u32 {
    2
}

fn default_stall_threshold() -> u32 {
    3
}

fn default_bisection_budget() -> u32 {
    8
}

fn default_max_rounds() -> u32 {
    100
}

fn default_max_cost_units() -> u64 {
    200
}

fn default_integration_branch() -> String {
    "integration".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Agent slot count per role name.
    #[serde(default = "default_slots")]
    pub slots: HashMap<String, usize>,
    /// Agent timeout in seconds; per-role overrides win.
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    #[serde(default)]
    pub role_timeout_secs: HashMap<String, u64>,
    /// Timeout for build and test commands, in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Retries a task gets before it is blocked.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Rounds without progress before the run is declared deadlocked.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: u32,
    /// Probe validations allowed per composition bisection.
    #[serde(default = "default_bisection_budget")]
    pub bisection_budget: u32,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Total assignment attempts allowed per run.
    #[serde(default = "default_max_cost_units")]
    pub max_cost_units: u64,
    #[serde(default = "default_integration_branch")]
    pub integration_branch: String,
    /// Command used to run agents (program only; the prompt is appended).
    pub agent_command: Option<String>,
    #[serde(default)]
    pub agent_args: Vec<String>,
    /// Build command, program first.
    #[serde(default)]
    pub build_command: Vec<String>,
    /// Test command, program first.
    #[serde(default)]
    pub test_command: Vec<String>,
    /// Where task worktrees live; defaults to ~/.maestro/worktrees.
    pub worktree_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            agent_timeout_secs: default_agent_timeout_secs(),
            role_timeout_secs: HashMap::new(),
            command_timeout_secs: default_command_timeout_secs(),
            retry_budget: default_retry_budget(),
            stall_threshold: default_stall_threshold(),
            bisection_budget: default_bisection_budget(),
            max_rounds: default_max_rounds(),
            max_cost_units: default_max_cost_units(),
            integration_branch: default_integration_branch(),
            agent_command: None,
            agent_args: Vec::new(),
            build_command: Vec::new(),
            test_command: Vec::new(),
            worktree_dir: None,
        }
    }
}

impl Config {
    pub fn maestro_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".maestro"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("maestro.toml"))
    }

    pub fn snapshot_path() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("run.json"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::maestro_dir()?.join("worktrees")),
        }
    }

    /// Slot count for a role.
    pub fn slots_for(&self, role: Role) -> usize {
        self.slots.get(&role.to_string()).copied().unwrap_or(0)
    }

    /// Agent timeout for a role, honoring per-role overrides.
    pub fn timeout_for(&self, role: Role) -> Duration {
        let secs = self
            .role_timeout_secs
            .get(&role.to_string())
            .copied()
            .unwrap_or(self.agent_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn effective_agent_command(&self) -> &str {
        self.agent_command.as_deref().unwrap_or("claude")
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        mlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            mlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::maestro_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        mlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let dir = Self::maestro_dir()?;
        let worktrees = self.worktrees_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        if !worktrees.exists() {
            fs::create_dir_all(&worktrees)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
