use std::{path::Path, pin::pin, sync::Arc};

use async_trait::async_trait;
use bollard::{
    errors::Error as ApiError,
    image::{CreateImageOptions, RemoveImageOptions},
    Docker,
};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use super::{is_platform_error, report_platform_mismatch, BackendError, ImageBackend, ImageRequest};
use crate::{credentials::CredentialStore, runtime::RuntimeSession};

/// Backend for daemons with a Docker-compatible API.
pub struct ApiBackend {
    client: Docker,
    credentials: Arc<CredentialStore>,
    name: String,
}

impl ApiBackend {
    pub fn new(session: &RuntimeSession, credentials: Arc<CredentialStore>) -> Self {
        ApiBackend {
            client: session.client.clone(),
            credentials,
            name: session.kind.to_string(),
        }
    }

    /// Inspect the image using every name of the request, and return the
    /// first one found.
    async fn find_local(&self, request: &ImageRequest) -> Option<Value> {
        let mut names = vec![
            request.repo_with_tag.as_str(),
            request.reference.repo.as_str(),
            request.full_name.as_str(),
        ];
        names.dedup();

        for name in names {
            if name.is_empty() {
                continue;
            }

            match self.client.inspect_image(name).await {
                Ok(inspect) => match serde_json::to_value(inspect) {
                    Ok(value) => return Some(value),
                    Err(err) => tracing::debug!(%err, name, "invalid inspect data"),
                },

                Err(ApiError::DockerResponseServerError { status_code: 404, .. }) => {
                    tracing::debug!(name, "image not found in the runtime");
                }

                Err(err) => tracing::debug!(%err, name, "inspect failed"),
            }
        }

        None
    }

    /// Ask the daemon to pull `image`, and wait until the pull is
    /// complete.
    async fn create(&self, image: &str, request: &ImageRequest) -> Result<(), BackendError> {
        let options = CreateImageOptions {
            from_image: image,
            platform: request.platform().unwrap_or_default(),
            ..Default::default()
        };

        let credentials = self.credentials.resolve(&request.reference.registry).await;

        let mut stream = pin!(self.client.create_image(Some(options), None, credentials));

        while let Some(info) = stream.next().await {
            match info {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(pull_error(error));
                    }

                    if let Some(status) = info.status {
                        tracing::trace!(image, %status, "pull progress");
                    }
                }

                Err(ApiError::DockerStreamError { error }) => return Err(pull_error(error)),

                Err(err) if is_platform_error(&err.to_string()) => {
                    return Err(BackendError::PlatformMismatch(err.to_string()));
                }

                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }
}

fn pull_error(message: String) -> BackendError {
    if is_platform_error(&message) {
        BackendError::PlatformMismatch(message)
    } else {
        BackendError::Pull(message)
    }
}

#[async_trait]
impl ImageBackend for ApiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> bool {
        self.client.ping().await.is_ok()
    }

    async fn pull(&self, request: &ImageRequest) -> Option<Value> {
        if let Some(data) = self.find_local(request).await {
            return Some(data);
        }

        tracing::debug!(
            "Trying to pull the image {} from registry. This might take a while ...",
            request.full_name
        );

        let mut result = self.create(&request.full_name, request).await;

        if let Err(err) = &result {
            if !err.is_platform_mismatch() && request.repo_with_tag != request.full_name {
                tracing::debug!(%err, "Re-trying the pull with the name {}.", request.repo_with_tag);
                result = self.create(&request.repo_with_tag, request).await;
            }
        }

        match result {
            Ok(()) => (),

            Err(err) if err.is_platform_mismatch() => {
                tracing::debug!(%err, "pull failed");
                report_platform_mismatch();
                return None;
            }

            Err(err) => tracing::debug!(%err, "pull failed"),
        }

        self.find_local(request).await
    }

    async fn export(&self, image: &str, dest: &Path) -> Result<(), BackendError> {
        let file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| BackendError::Io(e, dest.into()))?;

        let mut writer = tokio::io::BufWriter::new(file);
        let mut stream = pin!(self.client.export_image(image));

        while let Some(chunk) = stream.next().await {
            writer
                .write_all(&chunk?)
                .await
                .map_err(|e| BackendError::Io(e, dest.into()))?;
        }

        writer
            .flush()
            .await
            .map_err(|e| BackendError::Io(e, dest.into()))
    }

    async fn remove(&self, image: &str, force: bool) -> Result<(), BackendError> {
        let options = RemoveImageOptions {
            force,
            ..Default::default()
        };

        let deleted = self.client.remove_image(image, Some(options), None).await?;
        tracing::debug!(image, items = deleted.len(), "image removed");

        Ok(())
    }
}

#[test]
fn classify_pull_errors() {
    assert!(pull_error("no match for platform in manifest sha256:1234: not found".into())
        .is_platform_mismatch());

    assert!(matches!(
        pull_error("pull access denied for foo".into()),
        BackendError::Pull(_)
    ));
}
