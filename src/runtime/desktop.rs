use std::{path::Path, time::Duration};

use crate::{process, HostOs, Settings};

/// Time limit for the helper commands of the desktop applications.
const DETECT_TIMEOUT: Duration = Duration::from_secs(30);

const RANCHER_LIMACTL: &str =
    "/Applications/Rancher Desktop.app/Contents/Resources/resources/darwin/lima/bin/limactl";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DesktopKind {
    RancherDesktop,
    Colima,
}

/// Desktop application that runs the containers in a virtual machine.
///
/// The API socket of these applications is not reliable, so the CLI is
/// always used when one is detected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesktopWrapper {
    pub kind: DesktopKind,

    /// `true` if the application runs containerd instead of Docker.
    pub containerd: bool,
}

impl DesktopWrapper {
    /// Command to use for the CLI backend, if it is not `docker`.
    pub fn cli_command(&self) -> Option<&'static str> {
        self.containerd.then_some("nerdctl")
    }
}

pub(super) async fn detect(settings: &Settings) -> Option<DesktopWrapper> {
    if settings.os != HostOs::MacOs {
        return None;
    }

    if let Some(desktop) = detect_rancher_desktop(settings).await {
        return Some(desktop);
    }

    detect_colima().await
}

async fn detect_rancher_desktop(settings: &Settings) -> Option<DesktopWrapper> {
    let lima_home = settings.home_dir.as_ref().map(|home| {
        home.join("Library")
            .join("Application Support")
            .join("rancher-desktop")
            .join("lima")
    });

    let installed = Path::new(RANCHER_LIMACTL).exists() || lima_home.is_some_and(|p| p.exists());

    if !installed {
        return None;
    }

    match process::run_checked("rdctl", &["list-settings"], None, DETECT_TIMEOUT).await {
        Ok(_) => {
            tracing::debug!("Rancher Desktop found!");

            Some(DesktopWrapper {
                kind: DesktopKind::RancherDesktop,
                containerd: true,
            })
        }

        Err(err) => {
            if err.to_string().contains("connection refused") {
                tracing::warn!(
                    "Ensure Rancher Desktop is running. To start from the command line, type the command 'rdctl start'"
                );
            } else {
                tracing::debug!(%err, "rdctl is not available");
            }

            None
        }
    }
}

async fn detect_colima() -> Option<DesktopWrapper> {
    let stdout = process::run_checked("colima", &["version"], None, DETECT_TIMEOUT)
        .await
        .ok()?;

    if !stdout.contains("colima version") {
        return None;
    }

    tracing::warn!(
        "Colima is known to have issues with volume mounts, which might result in incomplete BOM. Use it with caution!"
    );

    Some(DesktopWrapper {
        kind: DesktopKind::Colima,
        containerd: stdout.contains("runtime: containerd"),
    })
}

#[tokio::test]
async fn no_desktop_outside_macos() {
    let settings = Settings {
        os: HostOs::Linux,
        ..Settings::default()
    };

    assert_eq!(detect(&settings).await, None);
}
