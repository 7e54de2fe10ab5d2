//! Application configuration
//!
//! Endpoints, destination paths and network limits shared by the client,
//! the batch generator and the file service.

use std::path::PathBuf;
use std::time::Duration;

/// Default webserver serving the index and artifact files.
pub const DEFAULT_SERVER_URL: &str = "https://webserver-ecru.vercel.app";

/// External catalog search endpoint (not owned by this system).
pub const SEARCH_ENDPOINT: &str = "https://store.steampowered.com/api/storesearch";

/// Extension carried by every artifact file.
pub const ARTIFACT_EXT: &str = "lua";

/// Bounded timeout for index / search / download requests.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the interactive client and patch commands
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Base URL of the patch webserver
    pub server_url: String,

    /// Destination directory the third-party app loads patches from
    pub plugin_dir: PathBuf,

    /// Executable relaunched by the restart action
    pub app_exe: PathBuf,

    /// Process image name killed by the restart action
    pub app_process: String,

    /// Override for the per-user cache directory (mainly for tests)
    pub cache_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_url: std::env::var("LUAPATCH_SERVER")
                .unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string()),
            plugin_dir: PathBuf::from("C:/Program Files (x86)/Steam/config/stplug-in"),
            app_exe: PathBuf::from("C:/Program Files (x86)/Steam/Steam.exe"),
            app_process: "steam.exe".to_string(),
            cache_dir: None,
        }
    }
}

impl AppConfig {
    /// URL of the remote index document
    pub fn index_url(&self) -> String {
        format!("{}/api/games_index.json", self.server_url.trim_end_matches('/'))
    }

    /// URL of a single artifact
    pub fn artifact_url(&self, id: &str) -> String {
        format!(
            "{}/lua/{}.{}",
            self.server_url.trim_end_matches('/'),
            id,
            ARTIFACT_EXT
        )
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.is_empty() {
            return Err(ConfigError::MissingServerUrl);
        }
        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            return Err(ConfigError::InvalidServerUrl(self.server_url.clone()));
        }
        if self.plugin_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingPluginDir);
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Server URL is required")]
    MissingServerUrl,

    #[error("Server URL must be http(s): {0}")]
    InvalidServerUrl(String),

    #[error("Plugin destination directory is required")]
    MissingPluginDir,
}
