//! Configuration read from the process environment.
//!
//! Every module receives a [`Settings`] instead of reading variables
//! directly, so tests can describe any host without touching the real
//! environment.

use std::{env, path::PathBuf, sync::Once, time::Duration};

/// Default time limit for every invocation of the container CLI.
pub const DEFAULT_CLI_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Operating system of the host running the export.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostOs {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl HostOs {
    pub fn current() -> Self {
        match env::consts::OS {
            "linux" => HostOs::Linux,
            "macos" => HostOs::MacOs,
            "windows" => HostOs::Windows,
            _ => HostOs::Other,
        }
    }
}

/// Inputs that select the runtime, credentials and extraction mode.
#[derive(Clone, Debug)]
pub struct Settings {
    pub os: HostOs,

    /// `DOCKER_HOST`.
    pub docker_host: Option<String>,

    /// `DOCKER_CMD`. CLI binary used for the fallback path.
    pub docker_cmd: Option<String>,

    /// `DOCKER_USE_CLI`.
    pub use_cli: bool,

    /// `CONTAINERD_ADDRESS`.
    pub containerd_address: Option<String>,

    /// `XDG_RUNTIME_DIR`.
    pub xdg_runtime_dir: Option<PathBuf>,

    /// `DOCKER_AUTH_CONFIG`.
    pub auth_config: Option<String>,

    /// `DOCKER_USER`.
    pub user: Option<String>,

    /// `DOCKER_PASSWORD`.
    pub password: Option<String>,

    /// `DOCKER_EMAIL`.
    pub email: Option<String>,

    /// `DOCKER_SERVER_ADDRESS`. Registry used for credentials when the
    /// image reference does not include one.
    pub server_address: Option<String>,

    /// `DOCKER_CONFIG`. Directory with `config.json`.
    pub config_dir: Option<PathBuf>,

    /// `DOCKER_CERT_PATH`.
    pub cert_path: Option<PathBuf>,

    /// `DOCKER_TLS_VERIFY`.
    pub tls_verify: Option<String>,

    /// `NON_STRICT_TAR_EXTRACT`.
    pub non_strict_tar: bool,

    pub home_dir: Option<PathBuf>,

    /// Parent for the temporary export directories. The system default
    /// is used when `None`.
    pub tmp_dir: Option<PathBuf>,

    pub cli_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            os: HostOs::current(),
            docker_host: None,
            docker_cmd: None,
            use_cli: false,
            containerd_address: None,
            xdg_runtime_dir: None,
            auth_config: None,
            user: None,
            password: None,
            email: None,
            server_address: None,
            config_dir: None,
            cert_path: None,
            tls_verify: None,
            non_strict_tar: false,
            home_dir: None,
            tmp_dir: None,
            cli_timeout: DEFAULT_CLI_TIMEOUT,
        }
    }
}

impl Settings {
    /// Read the settings from the environment variables of the process.
    pub fn from_env() -> Self {
        let settings = Settings {
            os: HostOs::current(),
            docker_host: var("DOCKER_HOST"),
            docker_cmd: var("DOCKER_CMD"),
            use_cli: flag("DOCKER_USE_CLI"),
            containerd_address: var("CONTAINERD_ADDRESS"),
            xdg_runtime_dir: var("XDG_RUNTIME_DIR").map(PathBuf::from),
            auth_config: var("DOCKER_AUTH_CONFIG"),
            user: var("DOCKER_USER"),
            password: var("DOCKER_PASSWORD"),
            email: var("DOCKER_EMAIL"),
            server_address: var("DOCKER_SERVER_ADDRESS"),
            config_dir: var("DOCKER_CONFIG").map(PathBuf::from),
            cert_path: var("DOCKER_CERT_PATH").map(PathBuf::from),
            tls_verify: env::var("DOCKER_TLS_VERIFY").ok(),
            non_strict_tar: flag("NON_STRICT_TAR_EXTRACT"),
            home_dir: dirs::home_dir(),
            tmp_dir: None,
            cli_timeout: DEFAULT_CLI_TIMEOUT,
        };

        if settings.non_strict_tar {
            static WARNING: Once = Once::new();
            WARNING.call_once(|| {
                tracing::warn!(
                    "Extracting container images and tar files in non-strict mode could lead to security risks!"
                );
            });
        }

        settings
    }

    /// Directory with the Docker CLI configuration.
    pub fn docker_config_dir(&self) -> Option<PathBuf> {
        self.config_dir
            .clone()
            .or_else(|| self.home_dir.as_ref().map(|h| h.join(".docker")))
    }

    /// Binary for the CLI fallback, when no desktop wrapper overrides it.
    pub fn cli_command(&self) -> &str {
        self.docker_cmd.as_deref().unwrap_or("docker")
    }

    /// `true` if `DOCKER_HOST` points to a remote daemon.
    pub fn remote_docker_host(&self) -> bool {
        self.docker_host
            .as_deref()
            .is_some_and(|h| h.starts_with("tcp://") || h.starts_with("ssh://"))
    }
}

/// Non-empty value of an environment variable.
fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Boolean flags are enabled with `true` or `1`.
fn flag(name: &str) -> bool {
    matches!(env::var(name).as_deref(), Ok("true" | "1"))
}

#[test]
fn remote_hosts() {
    let mut settings = Settings::default();
    assert!(!settings.remote_docker_host());

    settings.docker_host = Some("unix:///var/run/docker.sock".into());
    assert!(!settings.remote_docker_host());

    settings.docker_host = Some("ssh://builder@10.0.0.2".into());
    assert!(settings.remote_docker_host());

    settings.docker_host = Some("tcp://127.0.0.1:2376".into());
    assert!(settings.remote_docker_host());
}

#[test]
fn docker_config_location() {
    let settings = Settings {
        home_dir: Some("/home/u".into()),
        ..Settings::default()
    };
    assert_eq!(
        settings.docker_config_dir(),
        Some(PathBuf::from("/home/u/.docker"))
    );

    let settings = Settings {
        config_dir: Some("/etc/docker-cfg".into()),
        ..settings
    };
    assert_eq!(
        settings.docker_config_dir(),
        Some(PathBuf::from("/etc/docker-cfg"))
    );
}
