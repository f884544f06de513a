mod parser;

use std::fmt;

/// Registry name used by the Docker CLI for Docker Hub.
pub const DOCKER_HUB_REGISTRY: &str = "docker.io";

/// Reference to a container image, split in its components.
///
/// The parser is lenient: it never fails, and any component that can't
/// be found is left empty. Only one of `tag` and `digest` is expected to
/// be meaningful at a time.
///
/// # Examples
///
/// ```
/// # use container_export::ImageReference;
/// let reference = ImageReference::parse("myregistry.local:5000/testing/test-image");
/// assert_eq!(reference.registry, "myregistry.local:5000");
/// assert_eq!(reference.repo, "testing/test-image");
/// assert_eq!(reference.group, "testing");
/// assert_eq!(reference.name, "test-image");
/// assert_eq!(reference.tag, "");
/// ```
///
/// ```
/// # use container_export::ImageReference;
/// let reference = ImageReference::parse("--platform=linux/arm64 ubuntu@sha256:abc123");
/// assert_eq!(reference.platform, "linux/arm64");
/// assert_eq!(reference.digest, "abc123");
/// assert_eq!(reference.name, "ubuntu");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct ImageReference {
    /// Address of the registry server, like `ghcr.io` or `localhost:5000`.
    pub registry: String,

    /// Repository path, without the registry.
    pub repo: String,

    /// Image tag.
    pub tag: String,

    /// SHA256 digest, without the `sha256:` prefix.
    pub digest: String,

    /// Value of a `--platform=` prefix.
    pub platform: String,

    /// Everything in `repo` before the last `/`.
    pub group: String,

    /// Last segment of `repo`.
    pub name: String,
}

impl ImageReference {
    /// Parse a reference like `debian:jessie` or
    /// `--platform=linux/amd64 ghcr.io/foo/bar@sha256:...`.
    pub fn parse(reference: &str) -> Self {
        parser::parse(reference)
    }

    /// `true` if the image is hosted in Docker Hub.
    pub fn is_docker_hub(&self) -> bool {
        self.registry.is_empty() || self.registry == DOCKER_HUB_REGISTRY
    }

    /// `true` if the reference contains a tag or a digest.
    pub fn has_version(&self) -> bool {
        !self.tag.is_empty() || !self.digest.is_empty()
    }

    /// Return `true` if nothing was parsed.
    pub fn is_empty(&self) -> bool {
        self.repo.is_empty()
    }
}

impl From<&str> for ImageReference {
    fn from(reference: &str) -> Self {
        ImageReference::parse(reference)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.registry.is_empty() {
            write!(f, "{}/", self.registry)?;
        }

        f.write_str(&self.repo)?;

        if !self.tag.is_empty() {
            write!(f, ":{}", self.tag)?;
        }

        if !self.digest.is_empty() {
            write!(f, "@sha256:{}", self.digest)?;
        }

        Ok(())
    }
}

#[test]
fn display_reference() {
    let reference = ImageReference::parse("Quay.io/Foo/Bar:1.2");
    assert_eq!(reference.to_string(), "quay.io/foo/bar:1.2");

    let reference = ImageReference::parse("ubuntu@sha256:abc123");
    assert_eq!(reference.to_string(), "ubuntu@sha256:abc123");
}

#[test]
fn docker_hub_references() {
    assert!(ImageReference::parse("debian").is_docker_hub());
    assert!(ImageReference::parse("docker.io/library/debian").is_docker_hub());
    assert!(!ImageReference::parse("ghcr.io/owner/tool").is_docker_hub());
}
