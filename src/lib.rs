mod digest;
mod export;
mod fetcher;
mod paths;
mod process;
mod settings;

pub mod backend;
pub mod credentials;
pub mod extract;
pub mod manifest;
pub mod reference;
pub mod runtime;

pub use credentials::CredentialStore;
pub use digest::{Digest, DigestError};
pub use export::{ExportData, ExportError, ExportOptions, ImageExporter};
pub use extract::{
    extract_archive, extract_tar, strip_absolute_path, ExtractError, ExtractOptions,
    ExtractSummary, ExtractionPolicy, LoggingPolicy, SilentPolicy,
};
pub use fetcher::ImageFetcher;
pub use manifest::{ManifestDescriptor, ManifestError};
pub use paths::{bin_paths, pkg_path_list};
pub use reference::{ImageReference, DOCKER_HUB_REGISTRY};
pub use runtime::{RuntimeKind, RuntimeLocator, RuntimeSession};
pub use settings::{HostOs, Settings, DEFAULT_CLI_TIMEOUT};
