//! Find a container runtime with a Docker-compatible API.
//!
//! Endpoints are probed in a fixed order, and the first one that answers
//! a ping is used for the lifetime of the [`RuntimeLocator`].

mod desktop;
mod probe;

use std::{fmt, path::PathBuf, sync::Arc};

use tokio::sync::OnceCell;

use crate::{HostOs, Settings};

pub use desktop::{DesktopKind, DesktopWrapper};
pub use probe::ConnectError;

/// Runtime behind a [`RuntimeSession`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RuntimeKind {
    DockerRoot,
    DockerRootless,
    DockerWindowsTls,
    PodmanRootless,
    PodmanRoot,
    ContainerdUnsupported,
    None,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::DockerRoot => "docker-root",
            RuntimeKind::DockerRootless => "docker-rootless",
            RuntimeKind::DockerWindowsTls => "docker-windows-tls",
            RuntimeKind::PodmanRootless => "podman-rootless",
            RuntimeKind::PodmanRoot => "podman-root",
            RuntimeKind::ContainerdUnsupported => "containerd-unsupported",
            RuntimeKind::None => "none",
        }
    }

    pub fn is_podman(&self) -> bool {
        matches!(self, RuntimeKind::PodmanRoot | RuntimeKind::PodmanRootless)
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a daemon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    NamedPipe(String),
    Http(String),
}

impl Endpoint {
    /// Parse the value of `DOCKER_HOST`.
    ///
    /// Return `None` for schemes that can't be used with the API client,
    /// like `ssh://`.
    pub fn parse(host: &str) -> Option<Endpoint> {
        if let Some(path) = host.strip_prefix("unix://") {
            return Some(Endpoint::Unix(path.into()));
        }

        if let Some(path) = host.strip_prefix("npipe://") {
            return Some(Endpoint::NamedPipe(path.to_owned()));
        }

        if ["tcp://", "http://", "https://"]
            .iter()
            .any(|scheme| host.starts_with(scheme))
        {
            return Some(Endpoint::Http(host.to_owned()));
        }

        if host.starts_with('/') {
            return Some(Endpoint::Unix(host.into()));
        }

        None
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::NamedPipe(pipe) => write!(f, "npipe://{pipe}"),
            Endpoint::Http(url) => f.write_str(url),
        }
    }
}

/// Client certificates for a daemon listening on TCP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,

    /// `false` when `DOCKER_TLS_VERIFY` is set to an empty string.
    pub verify: bool,
}

impl TlsMaterial {
    /// Certificates in `DOCKER_CERT_PATH`, if it is set.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let dir = settings.cert_path.as_ref()?;

        Some(TlsMaterial {
            cert: dir.join("cert.pem"),
            key: dir.join("key.pem"),
            ca: dir.join("ca.pem"),
            verify: settings.tls_verify.as_deref() != Some(""),
        })
    }
}

/// Connection to a daemon that answered a ping.
#[derive(Clone, Debug)]
pub struct RuntimeSession {
    pub kind: RuntimeKind,
    pub endpoint: Endpoint,
    pub tls: Option<TlsMaterial>,
    pub client: bollard::Docker,
}

/// Locate the container runtime of the host.
///
/// The first successful probe is stored, and reused by later calls.
/// Failures are not stored, so the next call probes again.
pub struct RuntimeLocator {
    settings: Arc<Settings>,
    session: OnceCell<RuntimeSession>,
    desktop: OnceCell<Option<DesktopWrapper>>,
}

impl RuntimeLocator {
    pub fn new(settings: Arc<Settings>) -> Self {
        RuntimeLocator {
            settings,
            session: OnceCell::new(),
            desktop: OnceCell::new(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn settings_arc(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// `true` if the host only provides containerd, which has no
    /// compatible API.
    pub fn containerd_only(&self) -> bool {
        let settings = &self.settings;

        if settings.docker_host.is_some() {
            return false;
        }

        settings.containerd_address.is_some()
            || settings.xdg_runtime_dir.as_ref().is_some_and(|dir| {
                dir.join("containerd-rootless").join("api.sock").exists()
            })
    }

    /// Desktop application (like Rancher Desktop or Colima) running the
    /// containers in a virtual machine. Only detected on macOS.
    pub async fn desktop(&self) -> Option<&DesktopWrapper> {
        self.desktop
            .get_or_init(|| desktop::detect(&self.settings))
            .await
            .as_ref()
    }

    /// Return the session for the first runtime that answers a ping.
    ///
    /// Concurrent callers wait for the same probe.
    pub async fn connect(&self) -> Option<&RuntimeSession> {
        if self.containerd_only() {
            return None;
        }

        if self.desktop().await.is_some_and(|d| d.containerd) {
            return None;
        }

        let result = self
            .session
            .get_or_try_init(|| probe::find_runtime(&self.settings))
            .await;

        match result {
            Ok(session) => Some(session),
            Err(err) => {
                tracing::debug!(%err, "no runtime available");
                self.report_failure().await;
                None
            }
        }
    }

    /// Kind of the runtime of the host.
    ///
    /// [`RuntimeKind::ContainerdUnsupported`] if only containerd is
    /// available, and [`RuntimeKind::None`] if no runtime answered.
    pub async fn kind(&self) -> RuntimeKind {
        if self.containerd_only() || self.desktop().await.is_some_and(|d| d.containerd) {
            return RuntimeKind::ContainerdUnsupported;
        }

        self.connect().await.map_or(RuntimeKind::None, |session| session.kind)
    }

    /// Log some guidance when no runtime was found.
    async fn report_failure(&self) {
        match self.settings.os {
            HostOs::Windows => {
                tracing::warn!(
                    "Ensure Docker for Desktop is running as an administrator with 'Exposing daemon on TCP without TLS' setting turned on."
                );
            }

            HostOs::MacOs => {
                if self.desktop().await.is_none() {
                    tracing::warn!(
                        "Ensure Podman Desktop (open-source) or Docker for Desktop (May require subscription) is running."
                    );
                }
            }

            HostOs::Linux | HostOs::Other => {
                tracing::warn!("Ensure docker/podman service or Docker for Desktop is running.");
                tracing::info!(
                    "Check if the post-installation steps were performed correctly as per this documentation https://docs.docker.com/engine/install/linux-postinstall/"
                );
            }
        }
    }
}

#[test]
fn parse_docker_host() {
    assert_eq!(
        Endpoint::parse("unix:///var/run/docker.sock"),
        Some(Endpoint::Unix("/var/run/docker.sock".into()))
    );

    assert_eq!(
        Endpoint::parse("npipe:////./pipe/docker_engine"),
        Some(Endpoint::NamedPipe("//./pipe/docker_engine".into()))
    );

    assert_eq!(
        Endpoint::parse("tcp://10.0.0.2:2376"),
        Some(Endpoint::Http("tcp://10.0.0.2:2376".into()))
    );

    assert_eq!(Endpoint::parse("ssh://builder@10.0.0.2"), None);
}

#[test]
fn runtime_names() {
    assert_eq!(RuntimeKind::DockerRootless.to_string(), "docker-rootless");
    assert_eq!(RuntimeKind::ContainerdUnsupported.to_string(), "containerd-unsupported");
    assert!(RuntimeKind::PodmanRoot.is_podman());
}

#[test]
fn containerd_detection() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir(tmp.path().join("containerd-rootless")).unwrap();
    std::fs::write(tmp.path().join("containerd-rootless/api.sock"), "").unwrap();

    let settings = Settings {
        xdg_runtime_dir: Some(tmp.path().to_owned()),
        ..Settings::default()
    };

    assert!(RuntimeLocator::new(Arc::new(settings.clone())).containerd_only());

    // DOCKER_HOST has precedence.
    let settings = Settings {
        docker_host: Some("unix:///var/run/docker.sock".into()),
        ..settings
    };

    assert!(!RuntimeLocator::new(Arc::new(settings)).containerd_only());

    let settings = Settings {
        containerd_address: Some("/run/containerd/containerd.sock".into()),
        ..Settings::default()
    };

    assert!(RuntimeLocator::new(Arc::new(settings)).containerd_only());
}

#[test]
fn tls_from_cert_path() {
    let settings = Settings {
        cert_path: Some("/certs".into()),
        tls_verify: Some(String::new()),
        ..Settings::default()
    };

    let tls = TlsMaterial::from_settings(&settings).unwrap();
    assert_eq!(tls.ca, PathBuf::from("/certs/ca.pem"));
    assert!(!tls.verify);

    assert_eq!(TlsMaterial::from_settings(&Settings::default()), None);
}
