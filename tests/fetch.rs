use container_export::{ExportOptions, HostOs, ImageExporter, RuntimeKind, Settings};

fn exporter(settings: Settings) -> ImageExporter {
    let tmp = std::env::temp_dir();

    ImageExporter::new(Settings {
        os: HostOs::Linux,
        docker_cmd: Some("/nonexistent/bin/docker".into()),
        tmp_dir: Some(tmp),
        ..settings
    })
}

#[tokio::test]
async fn no_cli_available() {
    let exporter = exporter(Settings {
        use_cli: true,
        ..Settings::default()
    });

    assert_eq!(exporter.fetcher().get_image("debian").await, None);

    let result = exporter
        .export_image("debian:12", ExportOptions::default())
        .await;
    assert!(matches!(result, Ok(None)));

    let result = exporter
        .export_image("debian:12", ExportOptions { fail_on_error: true })
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn remote_host_without_cli() {
    let exporter = exporter(Settings {
        docker_host: Some("ssh://builder@192.0.2.1".into()),
        ..Settings::default()
    });

    assert_eq!(exporter.fetcher().get_image("ghcr.io/owner/tool:1.0").await, None);
}

#[tokio::test]
async fn containerd_only_host() {
    let exporter = exporter(Settings {
        containerd_address: Some("/run/containerd/containerd.sock".into()),
        ..Settings::default()
    });

    assert_eq!(exporter.fetcher().get_image("debian").await, None);
    assert!(exporter.fetcher().locator().connect().await.is_none());
    assert_eq!(
        exporter.fetcher().locator().kind().await,
        RuntimeKind::ContainerdUnsupported
    );
}
