//! Strategies to pull, inspect and export images.
//!
//! [`ApiBackend`] talks to a daemon with a Docker-compatible API.
//! [`CliBackend`] runs the container CLI (`docker`, `podman` or
//! `nerdctl`) when the API can't be used.

mod api;
mod cli;

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{ImageReference, DOCKER_HUB_REGISTRY};

pub use api::ApiBackend;
pub use cli::CliBackend;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("Command '{command}' failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Command '{0}' did not finish in {1:?}")]
    Timeout(String, Duration),

    #[error("I/O error on {1}: {0}")]
    Io(io::Error, PathBuf),

    #[error("Pull failed: {0}")]
    Pull(String),

    #[error("The platform of the image is not supported: {0}")]
    PlatformMismatch(String),
}

impl BackendError {
    /// `true` if the daemon could not pull the image because it has no
    /// variant for the requested platform.
    pub fn is_platform_mismatch(&self) -> bool {
        matches!(self, BackendError::PlatformMismatch(_))
    }
}

/// Messages of the daemon when the platform of an image is not available.
const PLATFORM_ERRORS: &[&str] = &[
    "no match for platform in manifest",
    "Error choosing an image from manifest list",
];

pub(crate) fn is_platform_error(message: &str) -> bool {
    PLATFORM_ERRORS.iter().any(|e| message.contains(e))
}

/// Log the guidance for images built for another platform.
pub(crate) fn report_platform_mismatch() {
    tracing::warn!("You may have to enable experimental settings in docker to support this platform!");
    tracing::warn!(
        "To scan windows images, run the export on a windows server with hyper-v and docker installed. Switch to windows containers in your docker settings."
    );
}

/// Names derived from an image reference to look up and pull an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRequest {
    pub reference: ImageReference,

    /// The requested name, without the `--platform=` prefix, with
    /// `:latest` appended if it has no tag or digest.
    pub full_name: String,

    /// `full_name` for non-Hub registries, or `<repo>:<tag>` for Docker
    /// Hub images.
    pub repo_with_tag: String,
}

impl ImageRequest {
    pub fn new(name: &str) -> Self {
        let name = name.trim();
        let reference = ImageReference::parse(name);

        let image = match name.strip_prefix("--platform=") {
            Some(rest) => rest.split_once(' ').map_or("", |(_, image)| image).trim(),
            None => name,
        };

        let full_name = if reference.has_version() {
            image.to_owned()
        } else {
            format!("{image}:latest")
        };

        let repo_with_tag = if !reference.registry.is_empty() && reference.registry != DOCKER_HUB_REGISTRY {
            full_name.clone()
        } else if reference.tag.is_empty() {
            format!("{}:latest", reference.repo)
        } else {
            format!("{}:{}", reference.repo, reference.tag)
        };

        ImageRequest {
            reference,
            full_name,
            repo_with_tag,
        }
    }

    /// Requested platform, if any.
    pub fn platform(&self) -> Option<&str> {
        Some(self.reference.platform.as_str()).filter(|p| !p.is_empty())
    }
}

/// Operations needed to get an image archive from a runtime.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Return `true` if the backend can be used.
    async fn probe(&self) -> bool;

    /// Make sure the image is available in the runtime, and return its
    /// inspect data.
    ///
    /// Failures are logged, and return `None`.
    async fn pull(&self, request: &ImageRequest) -> Option<Value>;

    /// Write the archive of the image (as in `docker save`) to `dest`.
    async fn export(&self, image: &str, dest: &Path) -> Result<(), BackendError>;

    /// Remove the image from the runtime.
    async fn remove(&self, image: &str, force: bool) -> Result<(), BackendError>;
}

#[test]
fn image_request_names() {
    let request = ImageRequest::new("debian");
    assert_eq!(request.full_name, "debian:latest");
    assert_eq!(request.repo_with_tag, "debian:latest");

    let request = ImageRequest::new("debian:jessie");
    assert_eq!(request.full_name, "debian:jessie");
    assert_eq!(request.repo_with_tag, "debian:jessie");

    let request = ImageRequest::new("ghcr.io/owner/tool");
    assert_eq!(request.full_name, "ghcr.io/owner/tool:latest");
    assert_eq!(request.repo_with_tag, "ghcr.io/owner/tool:latest");

    let request = ImageRequest::new("--platform=linux/arm64 ubuntu@sha256:abc123");
    assert_eq!(request.full_name, "ubuntu@sha256:abc123");
    assert_eq!(request.platform(), Some("linux/arm64"));
    assert_eq!(ImageRequest::new("debian").platform(), None);
}
