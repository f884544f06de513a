//! Make an image available in the local runtime.

use std::sync::Arc;

use serde_json::Value;

use crate::{
    backend::{ApiBackend, CliBackend, ImageBackend, ImageRequest},
    credentials::CredentialStore,
    runtime::RuntimeLocator,
    HostOs,
};

/// Image found (or pulled) by a backend.
pub(crate) struct FetchedImage {
    pub request: ImageRequest,
    pub backend: Box<dyn ImageBackend>,
    pub inspect: Value,
}

/// Find images in the local runtime, and pull them when they are missing.
pub struct ImageFetcher {
    locator: Arc<RuntimeLocator>,
    credentials: Arc<CredentialStore>,
}

impl ImageFetcher {
    pub fn new(locator: Arc<RuntimeLocator>, credentials: Arc<CredentialStore>) -> Self {
        ImageFetcher {
            locator,
            credentials,
        }
    }

    pub fn locator(&self) -> &RuntimeLocator {
        &self.locator
    }

    /// Return the inspect data of the image `name`, pulling it from its
    /// registry if needed.
    ///
    /// Return `None` if the image can't be found. The reason is logged.
    pub async fn get_image(&self, name: &str) -> Option<Value> {
        self.fetch(name).await.map(|image| image.inspect)
    }

    pub(crate) async fn fetch(&self, name: &str) -> Option<FetchedImage> {
        let request = ImageRequest::new(name);

        if request.reference.is_empty() {
            tracing::debug!(name, "no image in the reference");
            return None;
        }

        let backend = self.backend().await?;

        tracing::debug!(backend = backend.name(), image = %request.full_name, "getting image");

        match backend.pull(&request).await {
            Some(inspect) => Some(FetchedImage {
                request,
                backend,
                inspect,
            }),

            None => {
                tracing::warn!(
                    "Unable to pull {}. Check if the name is valid. Perform any authentication prior to invoking the export.",
                    request.full_name
                );
                tracing::info!(
                    "Try manually pulling this image using docker pull {}",
                    request.full_name
                );
                None
            }
        }
    }

    /// Select the backend for the runtime of the host.
    pub(crate) async fn backend(&self) -> Option<Box<dyn ImageBackend>> {
        if self.locator.containerd_only() {
            tracing::warn!(
                "containerd/nerdctl is currently unsupported. Export the image manually and run the export against the tar image."
            );
            return None;
        }

        if self.needs_cli_fallback().await {
            return Some(Box::new(self.cli_backend().await));
        }

        if let Some(session) = self.locator.connect().await {
            return Some(Box::new(ApiBackend::new(
                session,
                Arc::clone(&self.credentials),
            )));
        }

        let cli = self.cli_backend().await;
        if cli.probe().await {
            return Some(Box::new(cli));
        }

        None
    }

    /// The CLI is preferred on Windows, with desktop applications on
    /// macOS, and for remote daemons.
    async fn needs_cli_fallback(&self) -> bool {
        let settings = self.locator.settings();

        if settings.use_cli || settings.os == HostOs::Windows || settings.remote_docker_host() {
            return true;
        }

        settings.os == HostOs::MacOs && self.locator.desktop().await.is_some()
    }

    async fn cli_backend(&self) -> CliBackend {
        let settings = self.locator.settings();

        let program = match &settings.docker_cmd {
            Some(cmd) => cmd.as_str(),
            None => match self.locator.desktop().await.and_then(|d| d.cli_command()) {
                Some(cmd) => cmd,
                None => settings.cli_command(),
            },
        };

        CliBackend::new(program, Arc::clone(self.locator.settings_arc()))
    }
}
