use std::{
    fmt,
    io::Write,
    path::{Path, PathBuf},
};

use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};

/// Content-addressed data, stored in `blobs/sha256/<digest>`.
#[derive(Clone, Debug)]
pub struct Blob {
    pub digest: String,
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(data: impl Into<Vec<u8>>) -> Blob {
        let data = data.into();
        let digest = HexString(Sha256::digest(&data)).to_string();
        Blob { digest, data }
    }

    pub fn json(value: &serde_json::Value) -> Blob {
        Blob::new(serde_json::to_vec(value).unwrap())
    }

    /// Return a builder to create a layer.
    pub fn layer(gzip: bool) -> LayerBuilder {
        LayerBuilder {
            gzip,
            archive: tar::Builder::new(Vec::new()),
        }
    }

    pub fn path(&self) -> String {
        format!("blobs/sha256/{}", self.digest)
    }

    /// Descriptor for OCI manifests.
    pub fn descriptor(&self, media_type: &str) -> serde_json::Value {
        serde_json::json!({
            "mediaType": media_type,
            "digest": format!("sha256:{}", self.digest),
            "size": self.data.len(),
        })
    }
}

pub struct LayerBuilder {
    gzip: bool,
    archive: tar::Builder<Vec<u8>>,
}

impl LayerBuilder {
    pub fn build(self) -> Blob {
        let data = self.archive.into_inner().unwrap();

        if !self.gzip {
            return Blob::new(data);
        }

        let mut encoder = GzEncoder::new(Vec::new(), Default::default());
        encoder.write_all(&data).unwrap();
        Blob::new(encoder.finish().unwrap())
    }

    pub fn directory(mut self, path: &str) -> Self {
        append(&mut self.archive, path, tar::EntryType::dir(), b"");
        self
    }

    pub fn regular(mut self, path: &str, data: impl AsRef<[u8]>) -> Self {
        append(&mut self.archive, path, tar::EntryType::file(), data.as_ref());
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o777);
        header.set_entry_type(tar::EntryType::symlink());
        header.set_size(0);
        self.archive.append_link(&mut header, path, target).unwrap();
        self
    }
}

/// Archive with the layout of `docker save` or `podman save`.
pub struct ImageArchive {
    archive: tar::Builder<Vec<u8>>,
}

impl ImageArchive {
    pub fn new() -> Self {
        ImageArchive {
            archive: tar::Builder::new(Vec::new()),
        }
    }

    pub fn file(mut self, path: &str, data: impl AsRef<[u8]>) -> Self {
        append(&mut self.archive, path, tar::EntryType::file(), data.as_ref());
        self
    }

    pub fn json(self, path: &str, value: &serde_json::Value) -> Self {
        self.file(path, serde_json::to_vec(value).unwrap())
    }

    pub fn blob(self, blob: &Blob) -> Self {
        let path = blob.path();
        self.file(&path, &blob.data)
    }

    pub fn build(self) -> Vec<u8> {
        self.archive.into_inner().unwrap()
    }

    /// Write the archive to `dir/image.tar`.
    pub fn write(self, dir: &Path) -> PathBuf {
        let path = dir.join("image.tar");
        std::fs::write(&path, self.build()).unwrap();
        path
    }
}

/// Append an entry with a raw path, so tests can use paths that
/// `Header::set_path` rejects (like `../x` or `/x`).
fn append(archive: &mut tar::Builder<Vec<u8>>, path: &str, entry_type: tar::EntryType, data: &[u8]) {
    let mut header = tar::Header::new_old();

    let name = &mut header.as_old_mut().name;
    name[..path.len()].copy_from_slice(path.as_bytes());

    header.set_mode(if entry_type.is_dir() { 0o755 } else { 0o644 });
    header.set_entry_type(entry_type);
    header.set_size(data.len() as u64);
    header.set_cksum();

    archive.append(&header, data).unwrap();
}

/// Encode a byte buffer as hex string.
struct HexString<T>(T);

impl<T: AsRef<[u8]>> fmt::Display for HexString<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0
            .as_ref()
            .iter()
            .try_for_each(|byte| write!(f, "{:02x}", byte))
    }
}
