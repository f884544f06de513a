use std::{io, path::Path, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use super::{is_platform_error, report_platform_mismatch, BackendError, ImageBackend, ImageRequest};
use crate::{process, Settings};

/// Backend that runs the container CLI.
pub struct CliBackend {
    program: String,
    settings: Arc<Settings>,
}

impl CliBackend {
    pub fn new(program: impl Into<String>, settings: Arc<Settings>) -> Self {
        CliBackend {
            program: program.into(),
            settings,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, BackendError> {
        process::run_checked(&self.program, args, None, self.settings.cli_timeout).await
    }

    /// `true` if `image` is in the local cache of the runtime.
    async fn is_cached(&self, image: &str) -> bool {
        match self.run(&["images", "--format=json"]).await {
            Ok(stdout) => local_names(&stdout).iter().any(|name| name == image),
            Err(err) => {
                tracing::debug!(%err, "unable to list local images");
                false
            }
        }
    }

    async fn pull_image(&self, request: &ImageRequest) {
        let mut args = vec!["pull"];

        if let Some(platform) = request.platform() {
            args.extend(["--platform", platform]);
        }

        args.push(request.full_name.as_str());

        if let Err(err) = self.run(&args).await {
            self.report_pull_error(&err);
        }
    }

    fn report_pull_error(&self, err: &BackendError) {
        match err {
            BackendError::Command { stderr, .. } if stderr.contains("docker daemon is not running") => {
                tracing::warn!(
                    "Ensure Docker for Desktop is running as an administrator with 'Exposing daemon on TCP without TLS' setting turned on."
                );
            }

            BackendError::Command { stderr, .. } if is_platform_error(stderr) => {
                report_platform_mismatch();
            }

            BackendError::Command { stderr, .. } if stderr.contains("not found") => {
                tracing::warn!(
                    "Set the environment variable DOCKER_CMD to use an alternative command such as nerdctl or podman."
                );
            }

            BackendError::Io(e, _) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(
                    program = %self.program,
                    "Set the environment variable DOCKER_CMD to use an alternative command such as nerdctl or podman."
                );
            }

            err => tracing::warn!(%err, "pull failed"),
        }
    }

    async fn inspect(&self, image: &str) -> Option<Value> {
        let stdout = match self.run(&["inspect", image]).await {
            Ok(stdout) => stdout,
            Err(err) => {
                tracing::warn!(%err, "inspect failed");
                return None;
            }
        };

        match serde_json::from_str(&stdout) {
            Ok(Value::Array(mut items)) => match items.len() {
                0 => None,
                _ => Some(items.swap_remove(0)),
            },

            Ok(value) => Some(value),

            Err(err) => {
                tracing::debug!(%err, program = %self.program, "invalid inspect output");
                None
            }
        }
    }
}

/// Names (`repository:tag`) in the output of `images --format=json`.
///
/// Docker and nerdctl print one object per line, with `Repository` and
/// `Tag`. Podman prints an array of objects, with a `Names` list.
fn local_names(stdout: &str) -> Vec<String> {
    let stdout = stdout.trim();

    let images: Vec<Value> = if stdout.starts_with('[') {
        serde_json::from_str(stdout).unwrap_or_default()
    } else {
        stdout
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    };

    let mut names = Vec::new();

    for image in &images {
        if let (Some(repo), Some(tag)) = (image["Repository"].as_str(), image["Tag"].as_str()) {
            names.push(format!("{repo}:{tag}"));
        }

        if let Some(list) = image["Names"].as_array() {
            names.extend(list.iter().filter_map(Value::as_str).map(str::to_owned));
        }
    }

    names
}

#[async_trait]
impl ImageBackend for CliBackend {
    fn name(&self) -> &str {
        &self.program
    }

    async fn probe(&self) -> bool {
        match self.run(&["--version"]).await {
            Ok(version) => {
                tracing::debug!(program = %self.program, version = version.trim(), "CLI found");
                true
            }

            Err(err) => {
                tracing::debug!(%err, "CLI is not available");
                false
            }
        }
    }

    async fn pull(&self, request: &ImageRequest) -> Option<Value> {
        if !self.is_cached(&request.full_name).await {
            self.pull_image(request).await;
        }

        self.inspect(&request.full_name).await
    }

    async fn export(&self, image: &str, dest: &Path) -> Result<(), BackendError> {
        let dest = dest
            .to_str()
            .ok_or_else(|| BackendError::Io(io::ErrorKind::InvalidInput.into(), dest.into()))?;

        tracing::info!("About to export image {image} to {dest} using {} cli", self.program);

        self.run(&["save", "-o", dest, image]).await?;
        Ok(())
    }

    async fn remove(&self, image: &str, force: bool) -> Result<(), BackendError> {
        let mut args = vec!["rmi"];

        if force {
            args.push("--force");
        }

        args.push(image);

        self.run(&args).await?;
        Ok(())
    }
}

#[test]
fn names_from_image_lists() {
    let docker = r#"{"Containers":"N/A","Repository":"debian","Tag":"latest"}
{"Repository":"ghcr.io/owner/tool","Tag":"1.0"}
not json
"#;

    assert_eq!(local_names(docker), ["debian:latest", "ghcr.io/owner/tool:1.0"]);

    let podman = r#"[{"Id":"abc","Names":["docker.io/library/debian:latest","localhost/dev:1"]}]"#;

    assert_eq!(
        local_names(podman),
        ["docker.io/library/debian:latest", "localhost/dev:1"]
    );

    assert!(local_names("").is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn missing_program() {
    let backend = CliBackend::new("/nonexistent/docker", Arc::new(Settings::default()));

    assert!(!backend.probe().await);
    assert_eq!(backend.pull(&ImageRequest::new("debian")).await, None);
}
