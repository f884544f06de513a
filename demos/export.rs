use std::path::PathBuf;

use clap::Parser;
use container_export::{ExportOptions, ExtractSummary, ExtractionPolicy, ImageExporter};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Read the image from an archive created with `docker save`.
    #[arg(short, long)]
    archive: bool,

    /// Return an error if any step fails.
    #[arg(long)]
    fail_on_error: bool,

    /// Print the export data as JSON.
    #[arg(long)]
    json: bool,

    /// Image reference, or path to the archive.
    image: String,
}

struct Progress;

impl ExtractionPolicy for Progress {
    fn archive_start(&self, archive: &dyn std::fmt::Display) {
        eprintln!("EXTRACT {archive}");
    }

    fn finished(&self, summary: &ExtractSummary) {
        eprintln!(
            "  {} written, {} skipped, {} warnings",
            summary.written, summary.skipped, summary.warnings
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let exporter = ImageExporter::from_env().with_policy(Progress);
    let options = ExportOptions {
        fail_on_error: args.fail_on_error,
    };

    let data = if args.archive {
        exporter.export_archive(&PathBuf::from(&args.image), options).await?
    } else {
        let runtime = exporter.fetcher().locator().kind().await;
        tracing::info!(%runtime, "exporting {}", args.image);

        exporter.export_image(&args.image, options).await?
    };

    let Some(data) = data else {
        eprintln!("Image not exported.");
        std::process::exit(1);
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!("{}", data.all_layers_exploded_dir.display());
    for path in &data.pkg_path_list {
        println!("  {}", path.display());
    }

    Ok(())
}
