// Process-wide worker configuration, read once from the environment.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::constants::{variables, DEFAULT_PLUGIN_GRACE_PERIOD, PLUGIN_HANDSHAKE_TIMEOUT};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("{name} is not a valid URL: {value:?} ({source})")]
    InvalidUrl {
        name: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("{name} must be a number of milliseconds, got {value:?}")]
    InvalidDuration { name: &'static str, value: String },
}

/// Worker configuration.
///
/// Built once at startup and never mutated while steps run; every step
/// execution reads the same snapshot.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Identity presented to plugins.
    pub worker_id: String,

    /// Human readable worker name.
    pub worker_name: String,

    /// Callback endpoint handed to plugins so they can reach back to the worker.
    pub api_endpoint: String,

    /// Disable TLS verification on plugin callback channels.
    pub tls_skip_verify: bool,

    /// Where provisioning stages plugin binaries, one file per action name.
    pub plugin_dir: PathBuf,

    /// Root of the local artifact store.
    pub artifact_dir: PathBuf,

    /// How long a killed plugin gets to be reaped.
    pub plugin_grace_period: Duration,

    /// Bound on the plugin handshake.
    pub plugin_handshake_timeout: Duration,

    /// Emit diagnostics as JSON.
    pub log_json: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        let name = default_worker_name();
        let tmp = std::env::temp_dir();
        Self {
            worker_id: name.clone(),
            worker_name: name,
            api_endpoint: String::new(),
            tls_skip_verify: false,
            plugin_dir: tmp.clone(),
            artifact_dir: tmp.join("cds-artifacts"),
            plugin_grace_period: DEFAULT_PLUGIN_GRACE_PERIOD,
            plugin_handshake_timeout: PLUGIN_HANDSHAKE_TIMEOUT,
            log_json: false,
        }
    }
}

impl WorkerSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`, which returns the value of an
    /// environment variable if it is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(name) = non_empty(variables::WORKER_NAME) {
            settings.worker_id = name.clone();
            settings.worker_name = name;
        }
        if let Some(id) = non_empty(variables::WORKER_ID) {
            settings.worker_id = id;
        }
        if let Some(api) = non_empty(variables::API) {
            url::Url::parse(&api).map_err(|source| SettingsError::InvalidUrl {
                name: variables::API,
                value: api.clone(),
                source,
            })?;
            settings.api_endpoint = api.trim_end_matches('/').to_string();
        }
        // Any non-empty value counts, "false" included.
        settings.tls_skip_verify = lookup(variables::SKIP_VERIFY).is_some_and(|v| !v.is_empty());
        if let Some(dir) = non_empty(variables::PLUGIN_DIR) {
            settings.plugin_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty(variables::ARTIFACT_DIR) {
            settings.artifact_dir = PathBuf::from(dir);
        }
        if let Some(ms) = non_empty(variables::PLUGIN_GRACE_PERIOD_MS) {
            let millis: u64 = ms.trim().parse().map_err(|_| SettingsError::InvalidDuration {
                name: variables::PLUGIN_GRACE_PERIOD_MS,
                value: ms.clone(),
            })?;
            settings.plugin_grace_period = Duration::from_millis(millis);
        }
        settings.log_json = non_empty(variables::LOG_JSON)
            .and_then(|v| worker_sdk::StringUtil::convert_to_bool(&v))
            .unwrap_or(false);

        Ok(settings)
    }

    /// On-disk location of the plugin binary for `plugin_name`.
    ///
    /// `None` when the name is not a single plain file name (separators,
    /// `..` and absolute paths would leave `plugin_dir`).
    pub fn plugin_binary_path(&self, plugin_name: &str) -> Option<PathBuf> {
        let mut components = Path::new(plugin_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if name == plugin_name => Some(self.plugin_dir.join(name)),
            _ => None,
        }
    }

    pub fn with_plugin_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.plugin_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_artifact_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.artifact_dir = dir.as_ref().to_path_buf();
        self
    }
}

fn default_worker_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(vars: &[(&str, &str)]) -> Result<WorkerSettings, SettingsError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerSettings::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn tls_verification_is_on_by_default() {
        let settings = settings_from(&[]).unwrap();
        assert!(!settings.tls_skip_verify);
    }

    #[test]
    fn any_non_empty_skip_verify_disables_verification() {
        assert!(settings_from(&[("CDS_SKIP_VERIFY", "1")]).unwrap().tls_skip_verify);
        assert!(settings_from(&[("CDS_SKIP_VERIFY", "false")]).unwrap().tls_skip_verify);
        assert!(!settings_from(&[("CDS_SKIP_VERIFY", "")]).unwrap().tls_skip_verify);
    }

    #[test]
    fn worker_identity_and_endpoint() {
        let settings = settings_from(&[
            ("CDS_NAME", "builder-7"),
            ("CDS_API", "https://cds.example.com/"),
        ])
        .unwrap();
        assert_eq!(settings.worker_name, "builder-7");
        assert_eq!(settings.worker_id, "builder-7");
        assert_eq!(settings.api_endpoint, "https://cds.example.com");

        let settings = settings_from(&[("CDS_NAME", "builder-7"), ("CDS_WORKER_ID", "42")]).unwrap();
        assert_eq!(settings.worker_id, "42");
    }

    #[test]
    fn invalid_api_is_rejected() {
        let err = settings_from(&[("CDS_API", "not a url")]).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidUrl { .. }));
    }

    #[test]
    fn plugin_paths_and_grace_period() {
        let settings = settings_from(&[
            ("CDS_PLUGIN_DIR", "/var/lib/cds/plugins"),
            ("CDS_PLUGIN_GRACE_PERIOD_MS", "250"),
        ])
        .unwrap();
        assert_eq!(
            settings.plugin_binary_path("plugin-venom"),
            Some(PathBuf::from("/var/lib/cds/plugins/plugin-venom"))
        );
        assert_eq!(settings.plugin_grace_period, Duration::from_millis(250));

        let err = settings_from(&[("CDS_PLUGIN_GRACE_PERIOD_MS", "soon")]).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidDuration { .. }));
    }

    #[test]
    fn plugin_names_stay_inside_the_plugin_dir() {
        let settings = WorkerSettings::default().with_plugin_dir("/var/lib/cds/plugins");
        for name in ["/bin/sh", "../x", "../../../../bin/sh", "a/b", "./tool", "..", ".", ""] {
            assert_eq!(settings.plugin_binary_path(name), None, "{name:?}");
        }
        assert!(settings.plugin_binary_path("custom-tool").is_some());
    }
}
