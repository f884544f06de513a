use std::str::FromStr;

/// Media types of the manifests found in an image index.
#[non_exhaustive]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum MediaType {
    DockerManifestList,
    DockerManifestV2,
    OciImageIndex,
    OciManifestV1,
}

impl MediaType {
    /// `true` if the media type is a list of manifests.
    pub fn is_index(&self) -> bool {
        matches!(self, MediaType::OciImageIndex | MediaType::DockerManifestList)
    }
}

impl FromStr for MediaType {
    type Err = InvalidMediaType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "application/vnd.docker.distribution.manifest.list.v2+json" => {
                Ok(MediaType::DockerManifestList)
            }
            "application/vnd.docker.distribution.manifest.v2+json" => Ok(MediaType::DockerManifestV2),
            "application/vnd.oci.image.index.v1+json" => Ok(MediaType::OciImageIndex),
            "application/vnd.oci.image.manifest.v1+json" => Ok(MediaType::OciManifestV1),
            _ => Err(InvalidMediaType),
        }
    }
}

#[derive(Debug)]
pub struct InvalidMediaType;

#[test]
fn parse_media_types() {
    assert_eq!(
        "application/vnd.oci.image.index.v1+json".parse::<MediaType>().ok(),
        Some(MediaType::OciImageIndex)
    );

    assert!(MediaType::DockerManifestList.is_index());
    assert!(!MediaType::OciManifestV1.is_index());
    assert!("application/vnd.in-toto+json".parse::<MediaType>().is_err());
}
