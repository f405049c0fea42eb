use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::errors::{MaskError, Result};

/// Environment variable carrying the DeepCell access token.
pub const ACCESS_TOKEN_ENV: &str = "DEEPCELL_ACCESS_TOKEN";

/// Location of the config file relative to the home directory.
pub const DEFAULT_CONFIG_PATH: &str = ".config/pymask.toml";

/// The parts of the process environment mask generation depends on.
///
/// Captured once in `main` and passed down, so library code never reads
/// process-wide state.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub access_token: Option<String>,
    pub home_dir: Option<PathBuf>,
}

impl Environment {
    pub fn from_process() -> Self {
        Self {
            access_token: std::env::var(ACCESS_TOKEN_ENV)
                .ok()
                .filter(|token| !token.is_empty()),
            home_dir: dirs::home_dir(),
        }
    }

    fn default_config_path(&self) -> Option<PathBuf> {
        self.home_dir
            .as_ref()
            .map(|home| home.join(DEFAULT_CONFIG_PATH))
    }
}

/// DeepCell API token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(rename = "API")]
    api: Option<ApiSection>,
    #[serde(rename = "MODEL")]
    model: Option<ModelSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiSection {
    #[serde(rename = "KEY")]
    key: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelSection {
    #[serde(rename = "PATH")]
    pub path: Option<PathBuf>,
    #[serde(rename = "ASSET")]
    pub asset: Option<String>,
}

/// Everything resolved from the environment and the config file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub access_token: AccessToken,
    pub model: ModelSection,
}

impl Settings {
    /// Resolves the access token and the optional `[MODEL]` section.
    ///
    /// The environment token wins over `API.KEY`. Without one, the config file
    /// (explicit, or `~/.config/pymask.toml`) must exist and hold `API.KEY`.
    pub fn resolve(config_file: Option<&Path>, env: &Environment) -> Result<Self> {
        let config_path = config_file
            .map(Path::to_path_buf)
            .or_else(|| env.default_config_path());

        let file = match &config_path {
            Some(path) if path.is_file() => Some(read_config(path)?),
            _ => None,
        };

        let access_token = match (&env.access_token, &file, &config_path) {
            (Some(token), _, _) => {
                tracing::debug!("using access token from {ACCESS_TOKEN_ENV}");
                AccessToken::new(token.clone())
            }
            (None, Some(file), Some(path)) => {
                let key = file
                    .api
                    .as_ref()
                    .and_then(|api| api.key.clone())
                    .filter(|key| !key.is_empty())
                    .ok_or_else(|| MaskError::MissingField {
                        field: "API.KEY".to_string(),
                        path: path.clone(),
                    })?;
                tracing::debug!(path = %path.display(), "using access token from config file");
                AccessToken::new(key)
            }
            (None, _, path) => {
                let path = path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("~").join(DEFAULT_CONFIG_PATH));
                return Err(MaskError::file_not_found("Config file", path));
            }
        };

        Ok(Self {
            access_token,
            model: file.and_then(|f| f.model).unwrap_or_default(),
        })
    }
}

fn read_config(path: &Path) -> Result<ConfigFile> {
    let text = fs::read_to_string(path).map_err(|e| MaskError::FileSystem {
        path: path.to_path_buf(),
        operation: "read config file".to_string(),
        source: e,
    })?;
    toml::from_str(&text).map_err(|e| MaskError::ConfigParse {
        path: path.to_path_buf(),
        source: e,
    })
}
