use std::{fs, path::Path};

use container_export::{ExportError, ExportOptions, ExtractError, ImageExporter, Settings};
use serde_json::json;

mod common;

use common::archive::{Blob, ImageArchive};

const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

fn exporter(tmp: &Path, non_strict: bool) -> ImageExporter {
    ImageExporter::new(Settings {
        tmp_dir: Some(tmp.to_owned()),
        non_strict_tar: non_strict,
        ..Settings::default()
    })
}

macro_rules! read {
    ($root:expr, $path:expr) => {
        fs::read_to_string($root.join($path)).expect($path)
    };
}

#[tokio::test]
async fn docker_save_uses_last_entry() {
    let tmp = tempfile::tempdir().unwrap();

    let first = Blob::layer(false).regular("only-first", "1").build();

    let base = Blob::layer(false)
        .directory("app")
        .regular("app/package.json", "{}")
        .regular("etc/os-release", "ID=v1")
        .build();

    let top = Blob::layer(true)
        .regular("etc/os-release", "ID=v2")
        .regular("app/node_modules/left-pad/index.js", "")
        .regular("usr/lib/python3/site-packages/six.py", "")
        .build();

    let manifest = json!([
        { "Config": "c1.json", "RepoTags": ["demo:1"], "Layers": ["l1/layer.tar"] },
        { "Config": "c2.json", "RepoTags": ["demo:2"], "Layers": ["l2/layer.tar", "l3/layer.tar"] },
    ]);

    let config = json!({
        "config": {
            "WorkingDir": "/app",
            "Env": ["PATH=/usr/local/bin:/usr/bin"],
        },
    });

    let path = ImageArchive::new()
        .json("manifest.json", &manifest)
        .json("c2.json", &config)
        .file("l1/layer.tar", &first.data)
        .file("l2/layer.tar", &base.data)
        .file("l3/layer.tar", &top.data)
        .write(tmp.path());

    let data = exporter(tmp.path(), false)
        .export_archive(&path, ExportOptions { fail_on_error: true })
        .await
        .unwrap()
        .unwrap();

    let exploded = &data.all_layers_exploded_dir;

    assert!(data.all_layers_dir.starts_with(tmp.path()));
    assert_eq!(exploded, &data.all_layers_dir.join("all-layers"));

    assert!(!exploded.join("only-first").exists());
    assert_eq!(read!(exploded, "etc/os-release"), "ID=v2");
    assert_eq!(read!(exploded, "app/package.json"), "{}");

    assert_eq!(data.manifest, manifest);
    assert_eq!(data.last_layer_config, Some(config));
    assert_eq!(data.last_working_dir, Some(exploded.join("app")));
    assert_eq!(data.bin_paths, ["/usr/local/bin", "/usr/bin"]);
    assert_eq!(data.inspect_data, None);

    for dir in ["app", "app/node_modules", "usr/lib", "usr/lib/python3/site-packages"] {
        assert!(data.pkg_path_list.contains(&exploded.join(dir)), "{dir}");
    }

    let serialized = serde_json::to_value(&data).unwrap();
    assert!(serialized["allLayersExplodedDir"].is_string());
    assert!(serialized["pkgPathList"].is_array());
}

#[tokio::test]
async fn oci_layout() {
    let tmp = tempfile::tempdir().unwrap();

    let layer_a = Blob::layer(true).regular("opt/tool/bin/tool", "a").build();
    let layer_b = Blob::layer(true)
        .regular("opt/tool/bin/tool", "b")
        .regular("srv/www/index.html", "")
        .build();

    let config = Blob::json(&json!({
        "architecture": "amd64",
        "os": "linux",
        "config": { "WorkingDir": "/srv" },
    }));

    let manifest = Blob::json(&json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "config": config.descriptor(OCI_CONFIG),
        "layers": [layer_a.descriptor(OCI_LAYER_GZIP), layer_b.descriptor(OCI_LAYER_GZIP)],
    }));

    let index = json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": [manifest.descriptor(OCI_MANIFEST)],
    });

    let path = ImageArchive::new()
        .json("index.json", &index)
        .json("oci-layout", &json!({ "imageLayoutVersion": "1.0.0" }))
        .blob(&layer_a)
        .blob(&config)
        .blob(&manifest)
        .blob(&layer_b)
        .write(tmp.path());

    let data = exporter(tmp.path(), false)
        .export_archive(&path, ExportOptions { fail_on_error: true })
        .await
        .unwrap()
        .unwrap();

    let exploded = &data.all_layers_exploded_dir;

    assert_eq!(read!(exploded, "opt/tool/bin/tool"), "b");
    assert_eq!(data.manifest, index["manifests"]);
    assert_eq!(data.last_working_dir, Some(exploded.join("srv")));
    assert_eq!(
        data.last_layer_config.as_ref().and_then(|c| c["os"].as_str()),
        Some("linux")
    );
}

#[tokio::test]
async fn blob_store_without_manifest() {
    let tmp = tempfile::tempdir().unwrap();

    let layer = Blob::layer(false).regular("home/user/.composer/x", "").build();
    let config = Blob::json(&json!({ "os": "linux" }));

    let path = ImageArchive::new()
        .blob(&config)
        .blob(&layer)
        .write(tmp.path());

    let data = exporter(tmp.path(), false)
        .export_archive(&path, ExportOptions::default())
        .await
        .unwrap()
        .unwrap();

    let exploded = &data.all_layers_exploded_dir;

    assert!(exploded.join("home/user/.composer/x").is_file());
    assert!(data.pkg_path_list.contains(&exploded.join("home/user/.composer")));
    assert_eq!(data.last_layer_config, None);
}

#[tokio::test]
async fn hostile_layers() {
    let tmp = tempfile::tempdir().unwrap();

    let layer = Blob::layer(false)
        .regular("/usr/bin/absolute", "a")
        .regular("C:\\Windows\\win.ini", "w")
        .regular("etc/shadow", "root:x")
        .regular("etc/.hidden", "h")
        .symlink("usr/bin/sh", "/bin/busybox")
        .regular("../../outside", "o")
        .regular("usr/bin/last", "l")
        .build();

    let manifest = json!([{ "Config": "config.json", "Layers": ["layer.tar"] }]);

    let path = ImageArchive::new()
        .json("manifest.json", &manifest)
        .file("layer.tar", &layer.data)
        .write(tmp.path());

    // Non-strict mode skips the unsafe entry, and keeps going.
    let data = exporter(tmp.path(), true)
        .export_archive(&path, ExportOptions::default())
        .await
        .unwrap()
        .unwrap();

    let exploded = &data.all_layers_exploded_dir;

    assert_eq!(read!(exploded, "usr/bin/absolute"), "a");
    assert_eq!(read!(exploded, "Windows/win.ini"), "w");
    assert_eq!(read!(exploded, "usr/bin/last"), "l");

    assert!(!exploded.join("etc/shadow").exists());
    assert!(!exploded.join("etc/.hidden").exists());
    assert!(fs::symlink_metadata(exploded.join("usr/bin/sh")).is_err());
    assert!(!data.all_layers_dir.join("outside").exists());
    assert!(!tmp.path().join("outside").exists());

    // Strict mode rejects the layer.
    let result = exporter(tmp.path(), false)
        .export_archive(&path, ExportOptions { fail_on_error: true })
        .await;

    assert!(
        matches!(result, Err(ExportError::Extract(ExtractError::UnsafePath(_)))),
        "{result:?}"
    );
}

#[tokio::test]
async fn invalid_archives() {
    let tmp = tempfile::tempdir().unwrap();

    let path = tmp.path().join("image.tar");
    fs::write(&path, "this is not an archive").unwrap();

    let exporter = exporter(tmp.path(), false);

    assert!(exporter
        .export_archive(&path, ExportOptions::default())
        .await
        .unwrap()
        .is_none());

    assert!(exporter
        .export_archive(&path, ExportOptions { fail_on_error: true })
        .await
        .is_err());
}

#[tokio::test]
async fn manifest_paths_stay_in_the_export() {
    let tmp = tempfile::tempdir().unwrap();

    let host = Blob::layer(false).regular("stolen.txt", "secret").build();
    fs::write(tmp.path().join("host-secret.tar"), &host.data).unwrap();
    fs::write(
        tmp.path().join("host-config.json"),
        r#"{"config": {"WorkingDir": "/"}}"#,
    )
    .unwrap();

    let layer = Blob::layer(false).regular("app/index.js", "").build();

    let manifest = json!([{
        "Config": "../host-config.json",
        "Layers": ["../host-secret.tar", "layer.tar"],
    }]);

    let path = ImageArchive::new()
        .json("manifest.json", &manifest)
        .file("layer.tar", &layer.data)
        .write(tmp.path());

    let data = exporter(tmp.path(), false)
        .export_archive(&path, ExportOptions { fail_on_error: true })
        .await
        .unwrap()
        .unwrap();

    let exploded = &data.all_layers_exploded_dir;

    assert!(exploded.join("app/index.js").is_file());
    assert!(!exploded.join("stolen.txt").exists());
    assert_eq!(data.last_layer_config, None);
}

#[tokio::test]
async fn layer_with_content_store() {
    let tmp = tempfile::tempdir().unwrap();

    // Blobs inside a layer are files of the image, not part of the export.
    let store = format!("var/lib/containerd/blobs/sha256/{}", "1".repeat(64));
    let layer = Blob::layer(true).regular(&store, "any content").build();

    let path = ImageArchive::new()
        .json("manifest.json", &json!([{ "Layers": ["layer.tar"] }]))
        .file("layer.tar", &layer.data)
        .write(tmp.path());

    let data = exporter(tmp.path(), false)
        .export_archive(&path, ExportOptions { fail_on_error: true })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(read!(data.all_layers_exploded_dir, &store), "any content");
}
