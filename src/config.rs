use std::time::Duration;

/// Per-backend runtime configuration loaded from environment variables.
pub struct Config {
    pub docker: DockerBackendConfig,
    pub morph: MorphBackendConfig,
    pub daemon: DaemonBackendConfig,
}

#[derive(Debug, Clone)]
pub struct DockerBackendConfig {
    /// Workspace image run for every docker sandbox.
    pub image: String,
}

impl Default for DockerBackendConfig {
    fn default() -> Self {
        Self {
            image: "manaflow-workspace:latest".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MorphBackendConfig {
    pub api_base_url: String,
    pub api_key: String,
    /// Snapshot booted when the sandbox config names none.
    pub default_snapshot_id: String,
    pub ready_timeout: Duration,
    /// When the VM's own hostnames are directly reachable, terminal
    /// addressing skips the proxy rewrite.
    pub direct_vm_hosts: bool,
}

impl Default for MorphBackendConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://cloud.morph.so/api".to_string(),
            api_key: String::new(),
            default_snapshot_id: "snap_manaflow_base".to_string(),
            ready_timeout: Duration::from_secs(120),
            direct_vm_hosts: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaemonBackendConfig {
    /// Control-plane base URL.
    pub base_url: String,
    pub ready_timeout: Duration,
}

impl Default for DaemonBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:39300".to_string(),
            ready_timeout: Duration::from_secs(120),
        }
    }
}

impl Config {
    /// Load `.env` (if present) into the process environment. Intended for
    /// the embedding binary's startup, before `from_env()`.
    pub fn load_dotenv() {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }
    }

    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("MANAFLOW_DOCKER_IMAGE").ok().as_deref(),
            std::env::var("MORPH_BASE_URL").ok().as_deref(),
            std::env::var("MORPH_API_KEY").ok().as_deref(),
            std::env::var("MORPH_SNAPSHOT_ID").ok().as_deref(),
            std::env::var("MANAFLOW_DAEMON_URL").ok().as_deref(),
            std::env::var("MANAFLOW_DIRECT_VM_HOSTS").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env
    /// vars). Used directly in tests to avoid mutating process-global
    /// environment.
    pub fn from_raw_values(
        docker_image: Option<&str>,
        morph_base_url: Option<&str>,
        morph_api_key: Option<&str>,
        morph_snapshot_id: Option<&str>,
        daemon_base_url: Option<&str>,
        direct_vm_hosts: Option<&str>,
    ) -> Self {
        let mut docker = DockerBackendConfig::default();
        if let Some(image) = docker_image.filter(|s| !s.is_empty()) {
            docker.image = image.to_string();
        }

        let mut morph = MorphBackendConfig::default();
        if let Some(base) = morph_base_url.filter(|s| !s.is_empty()) {
            morph.api_base_url = base.to_string();
        }
        if let Some(key) = morph_api_key.filter(|s| !s.is_empty()) {
            morph.api_key = key.to_string();
        }
        if let Some(snapshot) = morph_snapshot_id.filter(|s| !s.is_empty()) {
            morph.default_snapshot_id = snapshot.to_string();
        }
        morph.direct_vm_hosts = matches!(direct_vm_hosts, Some("1") | Some("true"));

        let mut daemon = DaemonBackendConfig::default();
        if let Some(base) = daemon_base_url.filter(|s| !s.is_empty()) {
            daemon.base_url = base.to_string();
        }

        Config {
            docker,
            morph,
            daemon,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = Config::from_raw_values(None, None, None, None, None, None);
        assert_eq!(config.docker.image, "manaflow-workspace:latest");
        assert_eq!(config.morph.api_base_url, "https://cloud.morph.so/api");
        assert_eq!(config.daemon.base_url, "http://127.0.0.1:39300");
        assert!(!config.morph.direct_vm_hosts);
    }

    #[test]
    fn empty_strings_fall_back_to_defaults() {
        let config = Config::from_raw_values(Some(""), Some(""), None, None, Some(""), None);
        assert_eq!(config.docker.image, "manaflow-workspace:latest");
        assert_eq!(config.daemon.base_url, "http://127.0.0.1:39300");
    }

    #[test]
    fn explicit_values_override() {
        let config = Config::from_raw_values(
            Some("registry.local/workspace:dev"),
            Some("https://morph.example/api"),
            Some("mk_test"),
            Some("snap_custom"),
            Some("http://daemon.internal:39300"),
            Some("true"),
        );
        assert_eq!(config.docker.image, "registry.local/workspace:dev");
        assert_eq!(config.morph.api_base_url, "https://morph.example/api");
        assert_eq!(config.morph.api_key, "mk_test");
        assert_eq!(config.morph.default_snapshot_id, "snap_custom");
        assert_eq!(config.daemon.base_url, "http://daemon.internal:39300");
        assert!(config.morph.direct_vm_hosts);
    }

    #[test]
    fn direct_vm_hosts_accepts_one_and_true_only() {
        for (value, expected) in [("1", true), ("true", true), ("yes", false), ("0", false)] {
            let config = Config::from_raw_values(None, None, None, None, None, Some(value));
            assert_eq!(config.morph.direct_vm_hosts, expected, "value {value}");
        }
    }

    #[test]
    fn dotenv_file_feeds_raw_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "MANAFLOW_DOCKER_IMAGE=from-dotenv:latest\n").unwrap();

        // Parse the file without touching the process environment.
        let vars: Vec<(String, String)> = dotenvy::from_path_iter(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let image = vars
            .iter()
            .find(|(k, _)| k == "MANAFLOW_DOCKER_IMAGE")
            .map(|(_, v)| v.as_str());

        let config = Config::from_raw_values(image, None, None, None, None, None);
        assert_eq!(config.docker.image, "from-dotenv:latest");
    }
}
