use std::path::PathBuf;

use config::{Config as Cfg, Environment, File, Map};
use serde::Deserialize;

use crate::error::CoreError;

#[derive(Debug, Deserialize, Clone)]
pub struct CoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub temporary: bool,
    #[serde(default = "default_sequence_padding")]
    pub sequence_padding: usize,
    #[serde(default = "default_transfer_document_type")]
    pub transfer_document_type: String,
    #[serde(default = "default_branch_code")]
    pub default_branch_code: String,
    #[serde(default = "default_privileged_roles")]
    pub privileged_roles: Vec<String>,
    #[serde(default = "default_scrap_threshold_percent")]
    pub scrap_threshold_percent: u64,
    #[serde(default)]
    pub dispatch_requires_approval: bool,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("stock_control.db")
}

fn default_sequence_padding() -> usize {
    4
}

fn default_transfer_document_type() -> String {
    "STN".to_string()
}

fn default_branch_code() -> String {
    "HO".to_string()
}

fn default_privileged_roles() -> Vec<String> {
    vec!["admin".to_string()]
}

fn default_scrap_threshold_percent() -> u64 {
    7
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            temporary: false,
            sequence_padding: default_sequence_padding(),
            transfer_document_type: default_transfer_document_type(),
            default_branch_code: default_branch_code(),
            privileged_roles: default_privileged_roles(),
            scrap_threshold_percent: default_scrap_threshold_percent(),
            dispatch_requires_approval: false,
            log_filter: default_log_filter(),
        }
    }
}

impl CoreConfig {
    /// Defaults, then an optional `stock_control` file, then `STOCK__*` environment variables.
    pub fn load() -> Result<Self, CoreError> {
        dotenvy::dotenv().ok();
        Self::load_with_env(None)
    }

    /// `vars` replaces the process environment when given.
    fn load_with_env(vars: Option<Map<String, String>>) -> Result<Self, CoreError> {
        let env = Environment::with_prefix("STOCK")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("privileged_roles")
            .source(vars);

        let config = Cfg::builder()
            .add_source(File::with_name("stock_control").required(false))
            .add_source(env)
            .build()?;

        let config: CoreConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Throw-away database, used by tests and demos.
    pub fn temporary() -> Self {
        Self {
            temporary: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.sequence_padding == 0 || self.sequence_padding > 12 {
            return Err(CoreError::Config(format!(
                "sequence_padding must be between 1 and 12, got {}",
                self.sequence_padding
            )));
        }
        if self.transfer_document_type.trim().is_empty() {
            return Err(CoreError::Config(
                "transfer_document_type must not be empty".into(),
            ));
        }
        if self.default_branch_code.trim().is_empty() {
            return Err(CoreError::Config("default_branch_code must not be empty".into()));
        }
        if self.privileged_roles.is_empty() {
            return Err(CoreError::Config(
                "at least one privileged role is required".into(),
            ));
        }
        Ok(())
    }
}
