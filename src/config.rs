use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::model::UserProfile;

pub const DEFAULT_CONFIG_PATH: &str = "config/converse.json";

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_auth_secret() -> String {
    "dev-secret".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Shared secret for the built-in token verifier. Deployments that
    /// plug in their own verifier can ignore it.
    #[serde(default = "default_auth_secret")]
    pub auth_secret: String,
    /// Users seeded into the in-memory directory at startup.
    #[serde(default)]
    pub seed_users: Vec<UserProfile>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            auth_secret: default_auth_secret(),
            seed_users: Vec::new(),
        }
    }
}

pub fn load_config(path: &str) -> AppConfig {
    let path = Path::new(path);
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Failed to parse config file {}: {err}", path.display());
                AppConfig::default()
            }
        },
        Err(err) => {
            log::info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            AppConfig::default()
        }
    }
}
