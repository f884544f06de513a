//! Export an image, and rebuild its filesystem from the layers.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use serde_json::Value;

use crate::{
    backend::BackendError,
    credentials::CredentialStore,
    extract::{extract_tar, ExtractError, ExtractOptions, ExtractionPolicy, LoggingPolicy},
    fetcher::ImageFetcher,
    manifest::{self, ManifestDescriptor, ManifestError},
    paths,
    runtime::RuntimeLocator,
    Settings,
};

/// Prefix of the temporary directories created for every export.
const TEMP_PREFIX: &str = "docker-images-";

/// Name of the directory, inside the export directory, with the
/// filesystem of the image.
const EXPLODED_DIR: &str = "all-layers";

/// Archive written by the backend. Removed after it is extracted.
const IMAGE_ARCHIVE: &str = "image.tar";

const MANIFEST_FILES: &[&str] = &["manifest.json", "index.json"];

#[derive(Copy, Clone, Debug, Default)]
pub struct ExportOptions {
    /// Return errors to the caller, instead of logging them and
    /// returning `Ok(None)`.
    pub fail_on_error: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum ExportError {
    #[error("I/O error on {1}: {0}")]
    Io(io::Error, PathBuf),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result of an export.
///
/// The directories are not removed when this value is dropped.
#[derive(Clone, Debug, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportData {
    /// Inspect data from the runtime. `None` for archives.
    pub inspect_data: Option<Value>,

    /// Contents of the manifest file.
    pub manifest: Value,

    /// Directory with the contents of the exported archive.
    pub all_layers_dir: PathBuf,

    /// Directory with the filesystem of the image.
    pub all_layers_exploded_dir: PathBuf,

    pub last_layer_config: Option<Value>,

    pub last_working_dir: Option<PathBuf>,

    /// Directories in the `PATH` of the image.
    pub bin_paths: Vec<String>,

    /// Directories to scan for installed packages.
    pub pkg_path_list: Vec<PathBuf>,
}

/// Export images from the container runtime of the host, or from archives
/// created with `docker save` or `podman save`.
pub struct ImageExporter {
    settings: Arc<Settings>,
    fetcher: ImageFetcher,
    policy: Arc<dyn ExtractionPolicy>,
}

impl ImageExporter {
    /// Process-wide exporter, built from the environment on first use.
    pub fn shared() -> &'static ImageExporter {
        static SHARED: LazyLock<ImageExporter> = LazyLock::new(ImageExporter::from_env);
        &SHARED
    }

    pub fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let locator = Arc::new(RuntimeLocator::new(Arc::clone(&settings)));
        let credentials = Arc::new(CredentialStore::new(Arc::clone(&settings)));

        ImageExporter {
            settings,
            fetcher: ImageFetcher::new(locator, credentials),
            policy: Arc::new(LoggingPolicy),
        }
    }

    pub fn from_env() -> Self {
        ImageExporter::new(Settings::from_env())
    }

    /// Use `policy` to filter the entries of the archives, and to receive
    /// the extraction events.
    pub fn with_policy(mut self, policy: impl ExtractionPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn fetcher(&self) -> &ImageFetcher {
        &self.fetcher
    }

    /// Export the image `name` from the container runtime.
    ///
    /// The image is pulled if it is not available. Empty names, `.`, and
    /// paths of existing files are ignored.
    pub async fn export_image(
        &self,
        name: &str,
        options: ExportOptions,
    ) -> Result<Option<ExportData>, ExportError> {
        let result = self.try_export_image(name.trim(), options).await;
        finish(result, options)
    }

    /// Export the image in the archive `path`, created with `docker save`
    /// or `podman save`.
    pub async fn export_archive(
        &self,
        path: &Path,
        options: ExportOptions,
    ) -> Result<Option<ExportData>, ExportError> {
        let result = self.try_export_archive(path, options).await;
        finish(result, options)
    }

    /// Remove the image `name` from the container runtime.
    ///
    /// Return `false` if there is no runtime to remove it from.
    pub async fn remove_image(&self, name: &str, force: bool) -> Result<bool, ExportError> {
        let Some(backend) = self.fetcher.backend().await else {
            return Ok(false);
        };

        backend.remove(name, force).await?;
        Ok(true)
    }

    async fn try_export_image(
        &self,
        name: &str,
        options: ExportOptions,
    ) -> Result<Option<ExportData>, ExportError> {
        if name.is_empty() || name == "." || Path::new(name).exists() {
            tracing::debug!(name, "not an image name");
            return Ok(None);
        }

        let Some(image) = self.fetcher.fetch(name).await else {
            return Err(ExportError::NotFound(name.to_owned()));
        };

        let image_name = &image.request.full_name;
        let root = self.temp_dir()?;
        let archive = root.join(IMAGE_ARCHIVE);

        if let Err(err) = image.backend.export(image_name, &archive).await {
            let Some(id) = image.inspect["Id"].as_str() else {
                return Err(err.into());
            };

            tracing::info!(%err, "Retrying with {id}");
            image.backend.export(id, &archive).await?;
        }

        let extracted = extract_tar(&archive, &root, self.archive_options(options), Arc::clone(&self.policy)).await?;

        if let Err(err) = fs::remove_file(&archive) {
            tracing::debug!(%err, archive = %archive.display(), "unable to remove the archive");
        }

        if !extracted {
            return Err(ExportError::NotFound(format!(
                "Unable to export image to {}",
                root.display()
            )));
        }

        let Some(manifest_file) = MANIFEST_FILES.iter().map(Path::new).find(|f| root.join(f).is_file()) else {
            tracing::warn!(
                "Manifest file manifest.json was not found after export at {}",
                root.display()
            );
            return Err(ManifestError::Missing(root).into());
        };

        tracing::debug!(image = %image_name, root = %root.display(), "image exported");

        self.rebuild(root, Some(manifest_file), Some(image.inspect), options)
            .await
            .map(Some)
    }

    async fn try_export_archive(
        &self,
        path: &Path,
        options: ExportOptions,
    ) -> Result<Option<ExportData>, ExportError> {
        if !path.is_file() {
            tracing::warn!("Unable to find container image archive {}", path.display());
            return Err(ExportError::NotFound(path.display().to_string()));
        }

        let root = self.temp_dir()?;

        if !extract_tar(path, &root, self.archive_options(options), Arc::clone(&self.policy)).await? {
            tracing::warn!("Unable to extract image archive to {}", root.display());
            return Err(ExportError::NotFound(path.display().to_string()));
        }

        let manifest_file = MANIFEST_FILES.iter().map(Path::new).find(|f| root.join(f).is_file());

        if manifest_file.is_none() {
            tracing::debug!(root = %root.display(), "no manifest, using the blob store");
        }

        self.rebuild(root, manifest_file, None, options).await.map(Some)
    }

    /// Apply the layers of the manifest, and collect the data of the image.
    async fn rebuild(
        &self,
        root: PathBuf,
        manifest_file: Option<&Path>,
        inspect_data: Option<Value>,
        options: ExportOptions,
    ) -> Result<ExportData, ExportError> {
        let exploded = root.join(EXPLODED_DIR);
        fs::create_dir_all(&exploded).map_err(|e| ExportError::Io(e, exploded.clone()))?;

        let (manifest, descriptor) = manifest::read_manifest(&root, manifest_file)?;

        log_descriptor(&descriptor);

        manifest::apply_layers(
            &root,
            &descriptor,
            &exploded,
            self.extract_options(options),
            Arc::clone(&self.policy),
        )
        .await?;

        let last_layer_config = manifest::last_layer_config(&root, &descriptor);
        let last_working_dir = last_layer_config
            .as_ref()
            .and_then(|config| manifest::working_dir(config, &exploded));

        let env = inspect_data
            .as_ref()
            .and_then(|data| data.pointer("/Config/Env"))
            .or_else(|| last_layer_config.as_ref()?.pointer("/config/Env"))
            .and_then(Value::as_array)
            .map(|env| env.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();

        let bin_paths = paths::bin_paths(&env);

        let pkg_path_list = {
            let (root, exploded, working_dir) = (root.clone(), exploded.clone(), last_working_dir.clone());

            tokio::task::spawn_blocking(move || {
                paths::pkg_path_list(&root, &exploded, working_dir.as_deref())
            })
            .await
            .map_err(|e| ExportError::Io(io::Error::other(e), PathBuf::new()))?
        };

        Ok(ExportData {
            inspect_data,
            manifest,
            all_layers_dir: root,
            all_layers_exploded_dir: exploded,
            last_layer_config,
            last_working_dir,
            bin_paths,
            pkg_path_list,
        })
    }

    /// Options for the layers of the image.
    fn extract_options(&self, options: ExportOptions) -> ExtractOptions {
        ExtractOptions {
            fail_on_error: options.fail_on_error,
            ..ExtractOptions::from_settings(&self.settings)
        }
    }

    /// Options for the archive exported from the runtime, where blobs are
    /// checked against their digests.
    fn archive_options(&self, options: ExportOptions) -> ExtractOptions {
        ExtractOptions {
            verify_blobs: true,
            ..self.extract_options(options)
        }
    }

    /// Create the directory for an export. It is never removed.
    fn temp_dir(&self) -> Result<PathBuf, ExportError> {
        let parent = self.settings.tmp_dir.clone().unwrap_or_else(std::env::temp_dir);

        let dir = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir_in(&parent)
            .map_err(|e| ExportError::Io(e, parent))?;

        Ok(dir.keep())
    }
}

fn log_descriptor(descriptor: &ManifestDescriptor) {
    tracing::debug!(
        layers = descriptor.layers.len(),
        tags = ?descriptor.repo_tags,
        config = ?descriptor.config,
        "image manifest",
    );
}

fn finish(
    result: Result<Option<ExportData>, ExportError>,
    options: ExportOptions,
) -> Result<Option<ExportData>, ExportError> {
    match result {
        Ok(data) => Ok(data),

        Err(err) => {
            match &err {
                ExportError::NotFound(_) => tracing::debug!(%err, "export failed"),
                _ => tracing::warn!(%err, "export failed"),
            }

            if options.fail_on_error {
                Err(err)
            } else {
                Ok(None)
            }
        }
    }
}

#[tokio::test]
async fn ignore_non_image_names() {
    let tmp = tempfile::tempdir().unwrap();

    let exporter = ImageExporter::new(Settings {
        tmp_dir: Some(tmp.path().to_owned()),
        ..Settings::default()
    });

    let options = ExportOptions { fail_on_error: true };

    for name in ["", " ", ".", tmp.path().to_str().unwrap()] {
        assert!(exporter.export_image(name, options).await.unwrap().is_none());
    }

    assert!(fs::read_dir(tmp.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn missing_archive() {
    let exporter = ImageExporter::new(Settings::default());

    let result = exporter
        .export_archive(Path::new("/nonexistent/image.tar"), ExportOptions::default())
        .await;
    assert!(result.unwrap().is_none());

    let result = exporter
        .export_archive(
            Path::new("/nonexistent/image.tar"),
            ExportOptions { fail_on_error: true },
        )
        .await;
    assert!(matches!(result, Err(ExportError::NotFound(_))));
}
