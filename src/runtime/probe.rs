use std::{path::PathBuf, time::Duration};

use bollard::{Docker, API_DEFAULT_VERSION};

use super::{Endpoint, RuntimeKind, RuntimeSession, TlsMaterial};
use crate::{HostOs, Settings};

/// Timeout, in seconds, for requests sent by the API client.
const CLIENT_TIMEOUT: u64 = 120;

/// Maximum time to wait for the response of a ping.
const PING_TIMEOUT: Duration = Duration::from_secs(10);

const WINDOWS_PIPE: &str = "//./pipe/docker_engine";

const WINDOWS_LOCAL_HTTP: &str = "http://localhost:2375";

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("API client error: {0}")]
    Client(#[from] bollard::errors::Error),

    #[error("Unsupported endpoint: {0}")]
    Unsupported(String),

    #[error("No response from {0}")]
    Timeout(Endpoint),

    #[error("No container runtime found.")]
    NotFound,
}

/// Endpoint to probe.
#[derive(Debug, PartialEq)]
pub(super) struct Candidate {
    pub kind: RuntimeKind,
    pub endpoint: Endpoint,
    pub tls: Option<TlsMaterial>,
}

impl Candidate {
    fn new(kind: RuntimeKind, endpoint: Endpoint) -> Self {
        Candidate {
            kind,
            endpoint,
            tls: None,
        }
    }
}

/// Endpoints for every runtime, in the order they are probed.
pub(super) fn probe_table(settings: &Settings) -> Vec<Candidate> {
    let mut table = Vec::new();
    let windows = settings.os == HostOs::Windows;

    match settings.docker_host.as_deref() {
        Some(host) => match Endpoint::parse(host) {
            Some(endpoint) => {
                let tls = match endpoint {
                    Endpoint::Http(_) => TlsMaterial::from_settings(settings),
                    _ => None,
                };

                if tls.as_ref().is_some_and(|t| !t.verify) {
                    tracing::info!(host, "TLS Verification disabled");
                }

                table.push(Candidate {
                    kind: RuntimeKind::DockerRoot,
                    endpoint,
                    tls,
                });
            }

            None => tracing::debug!(host, "DOCKER_HOST can't be used with the API client"),
        },

        None if windows => table.push(Candidate::new(
            RuntimeKind::DockerRoot,
            Endpoint::NamedPipe(WINDOWS_PIPE.to_owned()),
        )),

        None => table.push(Candidate::new(
            RuntimeKind::DockerRoot,
            Endpoint::Unix("/var/run/docker.sock".into()),
        )),
    }

    if windows {
        table.push(Candidate::new(
            RuntimeKind::DockerWindowsTls,
            Endpoint::Http(WINDOWS_LOCAL_HTTP.to_owned()),
        ));

        return table;
    }

    if let Some(home) = &settings.home_dir {
        let path = home.join(".docker").join("run").join("docker.sock");
        table.push(Candidate::new(RuntimeKind::DockerRootless, Endpoint::Unix(path)));
    }

    if let Some(dir) = &settings.xdg_runtime_dir {
        let path = dir.join("docker.sock");
        table.push(Candidate::new(RuntimeKind::DockerRootless, Endpoint::Unix(path)));
    }

    if let Some(dir) = &settings.xdg_runtime_dir {
        let path = dir.join("podman").join("podman.sock");
        table.push(Candidate::new(RuntimeKind::PodmanRootless, Endpoint::Unix(path)));
    }

    if let Some(path) = user_podman_socket() {
        table.push(Candidate::new(RuntimeKind::PodmanRootless, Endpoint::Unix(path)));
    }

    table.push(Candidate::new(
        RuntimeKind::PodmanRoot,
        Endpoint::Unix("/run/podman/podman.sock".into()),
    ));

    // The same socket can appear twice if `XDG_RUNTIME_DIR` is `/run/user/<uid>`.
    let mut seen = Vec::new();
    table.retain(|c| {
        if seen.contains(&c.endpoint) {
            false
        } else {
            seen.push(c.endpoint.clone());
            true
        }
    });

    table
}

#[cfg(unix)]
fn user_podman_socket() -> Option<PathBuf> {
    let uid = rustix::process::getuid().as_raw();
    Some(format!("/run/user/{uid}/podman/podman.sock").into())
}

#[cfg(not(unix))]
fn user_podman_socket() -> Option<PathBuf> {
    None
}

/// Probe every endpoint, and return a session for the first one that
/// answers a ping.
pub(super) async fn find_runtime(settings: &Settings) -> Result<RuntimeSession, ConnectError> {
    for candidate in probe_table(settings) {
        if let Endpoint::Unix(path) = &candidate.endpoint {
            if !path.exists() {
                tracing::debug!(kind = %candidate.kind, path = %path.display(), "socket not found");
                continue;
            }
        }

        match ping(&candidate).await {
            Ok(client) => {
                log_detected(candidate.kind);

                return Ok(RuntimeSession {
                    kind: candidate.kind,
                    endpoint: candidate.endpoint,
                    tls: candidate.tls,
                    client,
                });
            }

            Err(err) => {
                tracing::debug!(
                    kind = %candidate.kind,
                    endpoint = %candidate.endpoint,
                    %err,
                    "runtime probe failed",
                );
            }
        }
    }

    Err(ConnectError::NotFound)
}

async fn ping(candidate: &Candidate) -> Result<Docker, ConnectError> {
    let client = connect(&candidate.endpoint, candidate.tls.as_ref())?;

    match tokio::time::timeout(PING_TIMEOUT, client.ping()).await {
        Ok(response) => {
            response?;
            Ok(client)
        }

        Err(_) => Err(ConnectError::Timeout(candidate.endpoint.clone())),
    }
}

/// Create an API client for `endpoint`.
///
/// No request is sent to the daemon.
pub(crate) fn connect(endpoint: &Endpoint, tls: Option<&TlsMaterial>) -> Result<Docker, ConnectError> {
    match (endpoint, tls) {
        #[cfg(unix)]
        (Endpoint::Unix(path), _) => {
            let path = path
                .to_str()
                .ok_or_else(|| ConnectError::Unsupported(path.display().to_string()))?;

            Ok(Docker::connect_with_unix(
                path,
                CLIENT_TIMEOUT,
                API_DEFAULT_VERSION,
            )?)
        }

        #[cfg(windows)]
        (Endpoint::NamedPipe(pipe), _) => Ok(Docker::connect_with_named_pipe(
            pipe,
            CLIENT_TIMEOUT,
            API_DEFAULT_VERSION,
        )?),

        #[cfg(feature = "tls")]
        (Endpoint::Http(url), Some(tls)) => Ok(Docker::connect_with_ssl(
            url,
            &tls.key,
            &tls.cert,
            &tls.ca,
            CLIENT_TIMEOUT,
            API_DEFAULT_VERSION,
        )?),

        #[cfg(not(feature = "tls"))]
        (Endpoint::Http(url), Some(_)) => Err(ConnectError::Unsupported(format!(
            "{url} requires the `tls` feature"
        ))),

        (Endpoint::Http(url), None) => Ok(Docker::connect_with_http(
            url,
            CLIENT_TIMEOUT,
            API_DEFAULT_VERSION,
        )?),

        #[allow(unreachable_patterns)]
        (other, _) => Err(ConnectError::Unsupported(other.to_string())),
    }
}

fn log_detected(kind: RuntimeKind) {
    match kind {
        RuntimeKind::DockerRoot => tracing::debug!(
            "Docker service in root mode detected. Consider switching to rootless mode to improve security. See https://docs.docker.com/engine/security/rootless/"
        ),

        RuntimeKind::DockerRootless => tracing::debug!("Docker service in rootless mode detected."),

        RuntimeKind::DockerWindowsTls => tracing::debug!("Docker desktop on Windows detected."),

        RuntimeKind::PodmanRootless => tracing::debug!("Podman in rootless mode detected."),

        RuntimeKind::PodmanRoot => tracing::info!(
            "Podman in root mode detected. Consider switching to rootless mode to improve security. See https://github.com/containers/podman/blob/main/docs/tutorials/rootless_tutorial.md"
        ),

        RuntimeKind::ContainerdUnsupported | RuntimeKind::None => (),
    }
}

#[cfg(unix)]
#[test]
fn probe_order_on_linux() {
    let settings = Settings {
        os: HostOs::Linux,
        home_dir: Some("/home/u".into()),
        xdg_runtime_dir: Some("/tmp/xdg".into()),
        ..Settings::default()
    };

    let table = probe_table(&settings);
    let kinds: Vec<_> = table.iter().map(|c| c.kind).collect();

    assert_eq!(
        kinds,
        [
            RuntimeKind::DockerRoot,
            RuntimeKind::DockerRootless,
            RuntimeKind::DockerRootless,
            RuntimeKind::PodmanRootless,
            RuntimeKind::PodmanRootless,
            RuntimeKind::PodmanRoot,
        ]
    );

    assert_eq!(table[0].endpoint, Endpoint::Unix("/var/run/docker.sock".into()));
    assert_eq!(table[1].endpoint, Endpoint::Unix("/home/u/.docker/run/docker.sock".into()));
    assert_eq!(table[2].endpoint, Endpoint::Unix("/tmp/xdg/docker.sock".into()));
    assert_eq!(table[3].endpoint, Endpoint::Unix("/tmp/xdg/podman/podman.sock".into()));
}

#[test]
fn probe_order_on_windows() {
    let settings = Settings {
        os: HostOs::Windows,
        ..Settings::default()
    };

    let table = probe_table(&settings);

    assert_eq!(
        table,
        [
            Candidate::new(
                RuntimeKind::DockerRoot,
                Endpoint::NamedPipe(WINDOWS_PIPE.into())
            ),
            Candidate::new(
                RuntimeKind::DockerWindowsTls,
                Endpoint::Http(WINDOWS_LOCAL_HTTP.into())
            ),
        ]
    );
}

#[test]
fn docker_host_with_certificates() {
    let settings = Settings {
        os: HostOs::Linux,
        docker_host: Some("tcp://10.0.0.2:2376".into()),
        cert_path: Some("/certs".into()),
        ..Settings::default()
    };

    let table = probe_table(&settings);

    assert_eq!(table[0].kind, RuntimeKind::DockerRoot);
    assert_eq!(table[0].endpoint, Endpoint::Http("tcp://10.0.0.2:2376".into()));
    assert!(table[0].tls.as_ref().is_some_and(|t| t.verify));
}
