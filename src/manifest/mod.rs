//! Read the manifest of an exported image, and apply its layers.
//!
//! Three layouts are supported:
//!
//! * `manifest.json` from `docker save`: an array of entries with
//!   `Config`, `RepoTags` and `Layers`.
//! * `index.json` from an OCI layout: a `manifests` list, followed through
//!   the blob store to the image manifest.
//! * No manifest at all (blob store exported by Podman): every file in
//!   `blobs/sha256` is applied, in file name order.

mod mediatype;

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use serde_json::Value;

use crate::{
    extract::{extract_tar, normalize_path, ExtractError, ExtractOptions, ExtractionPolicy},
    Digest,
};

pub use mediatype::{InvalidMediaType, MediaType};

/// Maximum number of nested indexes followed to find an image manifest.
const MAX_INDEX_DEPTH: usize = 4;

/// Annotation used by BuildKit to mark attestation manifests.
const REFERENCE_TYPE_ANNOTATION: &str = "vnd.docker.reference.type";

/// Layers and configuration of an exported image.
///
/// Paths are relative to the root of the export.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ManifestDescriptor {
    pub layers: Vec<PathBuf>,
    pub config: Option<PathBuf>,
    pub repo_tags: Vec<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("I/O error in {1}: {0}")]
    Io(io::Error, PathBuf),

    #[error("Invalid JSON in {1}: {0}")]
    Json(serde_json::Error, PathBuf),

    #[error("Missing manifest in {0}")]
    Missing(PathBuf),
}

/// Entry of a `manifest.json` file from `docker save`.
#[derive(serde::Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct SaveEntry {
    config: Option<String>,

    #[serde(default)]
    repo_tags: Option<Vec<String>>,

    #[serde(default)]
    layers: Vec<String>,
}

#[derive(serde::Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    media_type: Option<String>,
    digest: Digest,

    #[serde(default)]
    platform: Option<Platform>,

    #[serde(default)]
    annotations: HashMap<String, String>,
}

#[derive(serde::Deserialize, Debug)]
struct Platform {
    #[serde(default)]
    os: String,
}

#[derive(serde::Deserialize, Debug)]
struct ImageManifest {
    config: Option<Descriptor>,

    #[serde(default)]
    layers: Vec<Descriptor>,
}

impl Descriptor {
    /// Attestation manifests don't contain filesystem layers.
    fn is_attestation(&self) -> bool {
        self.annotations
            .get(REFERENCE_TYPE_ANNOTATION)
            .is_some_and(|t| t == "attestation-manifest")
            || self.platform.as_ref().is_some_and(|p| p.os == "unknown")
    }
}

/// Read the manifest in `manifest_file`, relative to `root`.
///
/// If `manifest_file` is `None`, or the manifest does not contain any
/// layer, the layers are taken from the blob store.
///
/// Return the manifest as JSON, and the descriptor of the image.
pub fn read_manifest(
    root: &Path,
    manifest_file: Option<&Path>,
) -> Result<(Value, ManifestDescriptor), ManifestError> {
    let (manifest, mut descriptor) = match manifest_file {
        Some(file) => {
            let path = root.join(file);
            let data = fs::read(&path).map_err(|e| ManifestError::Io(e, path.clone()))?;
            let json: Value =
                serde_json::from_slice(&data).map_err(|e| ManifestError::Json(e, path))?;

            parse_manifest(root, json)
        }

        None => (Value::Null, ManifestDescriptor::default()),
    };

    if descriptor.layers.is_empty() {
        descriptor.layers = blob_store_layers(root)?;

        if descriptor.layers.is_empty() {
            return Err(ManifestError::Missing(root.to_owned()));
        }
    }

    Ok((manifest, descriptor))
}

fn parse_manifest(root: &Path, json: Value) -> (Value, ManifestDescriptor) {
    match json {
        // OCI layout. The index itself is not useful for callers, so the
        // list of manifests is returned.
        Value::Object(mut object) if object.contains_key("manifests") => {
            let manifests = object.remove("manifests").unwrap_or_default();

            let descriptor = serde_json::from_value::<Vec<Descriptor>>(manifests.clone())
                .ok()
                .and_then(|list| follow_index(root, list, 0))
                .unwrap_or_default();

            (manifests, descriptor)
        }

        Value::Array(ref entries) => {
            if entries.len() > 1 {
                tracing::warn!(
                    entries = entries.len(),
                    "Multiple image entries in manifest.json. Only the last one is used."
                );
            }

            let descriptor = entries
                .last()
                .and_then(|e| serde_json::from_value::<SaveEntry>(e.clone()).ok())
                .map(ManifestDescriptor::from)
                .unwrap_or_default();

            (json, descriptor)
        }

        Value::Object(ref object) if object.contains_key("Layers") => {
            let descriptor = serde_json::from_value::<SaveEntry>(json.clone())
                .map(ManifestDescriptor::from)
                .unwrap_or_default();

            (json, descriptor)
        }

        other => (other, ManifestDescriptor::default()),
    }
}

impl From<SaveEntry> for ManifestDescriptor {
    fn from(entry: SaveEntry) -> Self {
        ManifestDescriptor {
            layers: entry.layers.iter().filter_map(|l| relative_path(l)).collect(),
            config: entry.config.as_deref().and_then(relative_path),
            repo_tags: entry.repo_tags.unwrap_or_default(),
        }
    }
}

/// Follow the last entry of an index until an image manifest is found.
///
/// Entries whose blob is not in the export (like other platforms of a
/// multi-platform image) are skipped.
fn follow_index(root: &Path, list: Vec<Descriptor>, depth: usize) -> Option<ManifestDescriptor> {
    if depth > MAX_INDEX_DEPTH {
        return None;
    }

    let (entry, data) = list
        .into_iter()
        .rev()
        .filter(|d| !d.is_attestation())
        .find_map(|d| {
            let blob_path = d.digest.blob_path();
            match fs::read(root.join(&blob_path)) {
                Ok(data) => Some((d, data)),
                Err(err) => {
                    tracing::debug!(%err, blob = %blob_path.display(), "missing manifest blob");
                    None
                }
            }
        })?;

    let json: Value = serde_json::from_slice(&data).ok()?;

    let is_index = match entry.media_type.as_deref().map(MediaType::from_str) {
        Some(Ok(m)) => m.is_index(),
        _ => json.get("manifests").is_some(),
    };

    if is_index {
        let nested = serde_json::from_value(json.get("manifests")?.clone()).ok()?;
        return follow_index(root, nested, depth + 1);
    }

    let manifest: ImageManifest = serde_json::from_value(json).ok()?;

    Some(ManifestDescriptor {
        layers: manifest
            .layers
            .iter()
            .map(|l| l.digest.blob_path())
            .collect(),
        config: manifest.config.map(|c| c.digest.blob_path()),
        repo_tags: Vec::new(),
    })
}

/// Every file in `blobs/sha256`, sorted by name.
fn blob_store_layers(root: &Path) -> Result<Vec<PathBuf>, ManifestError> {
    let blobs_dir = Path::new("blobs").join("sha256");

    let entries = match fs::read_dir(root.join(&blobs_dir)) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ManifestError::Io(e, blobs_dir)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ManifestError::Io(e, blobs_dir.clone()))?;
        if entry.file_type().is_ok_and(|t| t.is_file()) {
            names.push(entry.file_name());
        }
    }

    names.sort();

    Ok(names.into_iter().map(|n| blobs_dir.join(n)).collect())
}

/// Path of a file referenced by `manifest.json`, relative to the root of
/// the export. Paths that would leave it are ignored.
fn relative_path(path: &str) -> Option<PathBuf> {
    match normalize_path(path) {
        Ok(p) if !p.as_os_str().is_empty() => Some(p),

        _ => {
            tracing::warn!(path, "Ignoring invalid path in manifest.json");
            None
        }
    }
}

/// Extract the layers of the image into `exploded`, in the same order
/// of the manifest.
///
/// Layers that are not regular files are skipped. Return the number of
/// extracted layers.
pub async fn apply_layers<P>(
    root: &Path,
    descriptor: &ManifestDescriptor,
    exploded: &Path,
    options: ExtractOptions,
    policy: Arc<P>,
) -> Result<usize, ExtractError>
where
    P: ExtractionPolicy + ?Sized + 'static,
{
    let mut applied = 0;

    for layer in &descriptor.layers {
        let path = root.join(layer);

        if !path.is_file() {
            tracing::warn!(
                "Skipping layer {} since it is not a readable file.",
                layer.display()
            );
            continue;
        }

        tracing::debug!(layer = %layer.display(), "applying layer");

        if extract_tar(&path, exploded, options, Arc::clone(&policy)).await? {
            applied += 1;
        }
    }

    Ok(applied)
}

/// Read the configuration of the last layer.
///
/// It is the `Config` file of the manifest, or, for images with
/// `<id>/layer.tar` layers, the `json` file next to the last layer.
pub fn last_layer_config(root: &Path, descriptor: &ManifestDescriptor) -> Option<Value> {
    let path = match (&descriptor.config, descriptor.layers.last()) {
        (Some(config), _) => config.clone(),

        (None, Some(layer)) if layer.ends_with("layer.tar") => layer.with_file_name("json"),

        _ => return None,
    };

    let result = fs::read(root.join(&path))
        .map_err(|e| e.to_string())
        .and_then(|data| serde_json::from_slice(&data).map_err(|e| e.to_string()));

    match result {
        Ok(config) => Some(config),
        Err(err) => {
            tracing::warn!(%err, config = %path.display(), "unable to read the image configuration");
            None
        }
    }
}

/// Working directory from the image configuration, resolved under the
/// `exploded` directory.
pub fn working_dir(config: &Value, exploded: &Path) -> Option<PathBuf> {
    let dir = config
        .pointer("/config/WorkingDir")
        .and_then(Value::as_str)
        .filter(|d| !d.is_empty())?;

    let dir = normalize_path(dir).ok()?;

    Some(exploded.join(dir))
}
