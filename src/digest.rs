//! Digests of the blobs in an OCI layout.

use std::{
    fmt,
    fs::File,
    io,
    path::{Component, Path, PathBuf},
};

use sha2::{Digest as _, Sha256};

const BLOBS_DIR: &str = "blobs";

const ALGORITHM: &str = "sha256";

/// SHA-256 digest of a content-addressed blob.
///
/// # Examples
///
/// ```
/// # use container_export::Digest;
/// const HEX: &str = "123456789012345678901234567890123456789012345678901234567890abcd";
///
/// let digest = Digest::try_from(format!("sha256:{HEX}")).unwrap();
/// assert_eq!(digest.hex(), HEX);
///
/// let path = format!("blobs/sha256/{HEX}");
/// assert_eq!(digest.blob_path().to_str(), Some(path.as_str()));
/// assert_eq!(Digest::from_blob_path(path.as_ref()), Some(digest));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(try_from = "String")]
pub struct Digest {
    hex: String,
}

#[derive(thiserror::Error, Debug)]
pub enum DigestError {
    #[error("Unsupported digest algorithm: {0:?}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid SHA-256 value: {0:?}")]
    InvalidValue(String),
}

impl Digest {
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Get the digest from the path of a blob, like `blobs/sha256/<hex>`.
    ///
    /// Return `None` if the last components of the path don't follow
    /// that layout.
    pub fn from_blob_path(path: &Path) -> Option<Digest> {
        let mut components = path.components().rev();

        match (components.next(), components.next(), components.next()) {
            (
                Some(Component::Normal(hex)),
                Some(Component::Normal(algorithm)),
                Some(Component::Normal(blobs)),
            ) if algorithm == ALGORITHM && blobs == BLOBS_DIR => Digest::from_hex(hex.to_str()?).ok(),

            _ => None,
        }
    }

    /// Path of the blob, relative to the root of the layout.
    pub fn blob_path(&self) -> PathBuf {
        Path::new(BLOBS_DIR).join(ALGORITHM).join(&self.hex)
    }

    /// Hash the file in `path`, and compare it with this digest.
    ///
    /// A mismatch is reported as an [`InvalidData`](io::ErrorKind::InvalidData)
    /// error.
    pub fn verify_file(&self, path: &Path) -> io::Result<()> {
        let mut hasher = Sha256::new();
        io::copy(&mut File::open(path)?, &mut hasher)?;

        let actual = hasher
            .finalize()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>();

        if actual != self.hex {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid digest. Expected {}, got {actual}.", self.hex),
            ));
        }

        Ok(())
    }

    fn from_hex(hex: &str) -> Result<Digest, DigestError> {
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DigestError::InvalidValue(hex.to_owned()));
        }

        Ok(Digest {
            hex: hex.to_ascii_lowercase(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.split_once(':') {
            Some((ALGORITHM, hex)) => Digest::from_hex(hex),
            Some((algorithm, _)) => Err(DigestError::UnsupportedAlgorithm(algorithm.to_owned())),
            None => Err(DigestError::InvalidValue(value)),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ALGORITHM}:{}", self.hex)
    }
}
