//! Extract tar archives from container images.
//!
//! Archives are untrusted input. Every entry path is made relative to the
//! destination directory, entries in a fixed denylist are never written,
//! and links or device files are ignored. Owner, mode and modification
//! time of the entries are not preserved.

mod path;
mod policy;

use std::{
    cell::Cell,
    fmt::Display,
    fs::{self, File},
    io::{self, BufRead, BufReader, Read},
    path::{Path, PathBuf},
};

use crate::{Digest, HostOs, Settings};

pub use path::{normalize_path, strip_absolute_path};
pub use policy::{EntryInfo, ExtractionPolicy, LoggingPolicy, SilentPolicy};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Options to control how archives are extracted.
#[derive(Clone, Copy, Debug)]
pub struct ExtractOptions {
    /// Abort on corrupt headers, unsafe paths, write failures and
    /// digest mismatches. If `false`, those entries are skipped.
    pub strict: bool,

    /// Return hard errors to the caller, instead of only logging them.
    pub fail_on_error: bool,

    /// Check that files in `blobs/<algorithm>/<hash>` match their digest.
    ///
    /// Only useful for the outer archive of an image. Layers may ship
    /// their own content stores, which are not checked.
    pub verify_blobs: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        ExtractOptions {
            strict: true,
            fail_on_error: false,
            verify_blobs: false,
        }
    }
}

impl ExtractOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        ExtractOptions {
            strict: !settings.non_strict_tar,
            ..ExtractOptions::default()
        }
    }
}

/// Counters of an extracted archive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Entries written to the destination.
    pub written: usize,

    /// Entries skipped by the denylist, the policy, or because their type
    /// is not supported.
    pub skipped: usize,

    /// Integrity problems ignored in non-strict mode.
    pub warnings: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("Archive is empty.")]
    Empty,

    #[error("Not a tar archive: {0}")]
    NotAnArchive(io::Error),

    #[error("Unsupported archive: {0}")]
    Unsupported(String),

    #[error("Unsafe path in archive: {0:?}")]
    UnsafePath(String),

    #[error("Invalid archive: {0}")]
    Integrity(io::Error),

    #[error("Digest mismatch in {1}: {0}")]
    DigestMismatch(io::Error, PathBuf),

    #[error("Permission denied in {1}: {0}")]
    Permission(io::Error, PathBuf),

    #[error("I/O error in {1}: {0}")]
    Io(io::Error, PathBuf),
}

impl ExtractError {
    /// Soft errors are expected for some inputs, and they are not
    /// reported as failures.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            ExtractError::Empty | ExtractError::NotAnArchive(_) | ExtractError::Unsupported(_)
        )
    }

    fn io(error: io::Error, path: impl Into<PathBuf>) -> Self {
        if error.kind() == io::ErrorKind::PermissionDenied {
            ExtractError::Permission(error, path.into())
        } else {
            ExtractError::Io(error, path.into())
        }
    }
}

macro_rules! try_io {
    ($path:expr, $e:expr $(,)?) => {
        $e.map_err(|e| ExtractError::io(io::Error::from(e), $path))?
    };
}

/// Extract the archive in `path` to `dest`.
///
/// The extraction runs on a blocking thread of the async runtime.
///
/// Return `Ok(true)` if the archive was extracted. Errors are logged, and
/// returned only if [`fail_on_error`](ExtractOptions::fail_on_error) is
/// `true` and the error is not [soft](ExtractError::is_soft).
pub async fn extract_tar<P>(
    path: &Path,
    dest: &Path,
    options: ExtractOptions,
    policy: std::sync::Arc<P>,
) -> Result<bool, ExtractError>
where
    P: ExtractionPolicy + ?Sized + 'static,
{
    let (path, dest) = (path.to_owned(), dest.to_owned());

    let result = tokio::task::spawn_blocking(move || {
        let file = File::open(&path).map_err(|e| ExtractError::io(e, &path))?;
        policy.archive_start(&path.display());
        extract_archive(file, &dest, &options, &*policy)
    })
    .await
    .map_err(|e| ExtractError::Io(io::Error::other(e), PathBuf::new()))?;

    match result {
        Ok(_) => Ok(true),

        Err(err) if err.is_soft() => {
            tracing::debug!(%err, "archive not extracted");
            Ok(false)
        }

        Err(err) => {
            report_error(&err, HostOs::current());

            if options.fail_on_error {
                Err(err)
            } else {
                Ok(false)
            }
        }
    }
}

/// Extract a tar archive from `reader` to the `dest` directory.
///
/// The archive can be compressed with gzip or zstd.
pub fn extract_archive<R, P>(
    reader: R,
    dest: &Path,
    options: &ExtractOptions,
    policy: &P,
) -> Result<ExtractSummary, ExtractError>
where
    R: Read,
    P: ExtractionPolicy + ?Sized,
{
    try_io!(dest, fs::create_dir_all(dest));

    // Track position (in bytes) to send progress notifications.
    let position = Cell::new(0);
    let reader = PositionTracker {
        count: &position,
        reader,
    };

    let mut archive = tar::Archive::new(decompress(reader)?);
    let mut ctx = Context::new(dest, options, policy);

    let entries = archive.entries().map_err(ExtractError::NotAnArchive)?;
    let mut seen = 0;

    for entry in entries {
        policy.archive_progress(position.get());

        match entry {
            Ok(entry) => ctx.unpack(entry)?,

            Err(e) if seen == 0 => return Err(ExtractError::NotAnArchive(e)),

            Err(e) => {
                // The iterator stops after an invalid header.
                ctx.integrity_issue(ExtractError::Integrity(e))?;
                break;
            }
        }

        seen += 1;
    }

    if seen == 0 {
        return Err(ExtractError::Empty);
    }

    policy.archive_progress(position.get());
    policy.finished(&ctx.summary);

    Ok(ctx.summary)
}

/// Detect the compression of the archive from its first bytes.
fn decompress<'a, R: Read + 'a>(reader: R) -> Result<Box<dyn Read + 'a>, ExtractError> {
    let mut reader = BufReader::new(reader);

    let (is_gzip, is_zstd) = match reader.fill_buf() {
        Ok([]) => return Err(ExtractError::Empty),
        Ok(magic) => (magic.starts_with(GZIP_MAGIC), magic.starts_with(ZSTD_MAGIC)),
        Err(e) => return Err(ExtractError::NotAnArchive(e)),
    };

    if is_gzip {
        return Ok(Box::new(flate2::bufread::MultiGzDecoder::new(reader)));
    }

    if is_zstd {
        #[cfg(feature = "zstd")]
        {
            let decoder = zstd::stream::read::Decoder::with_buffer(reader)
                .map_err(ExtractError::NotAnArchive)?;
            return Ok(Box::new(decoder));
        }

        #[cfg(not(feature = "zstd"))]
        return Err(ExtractError::Unsupported("zstd compression".into()));
    }

    Ok(Box::new(reader))
}

/// Log an error from the extraction, with some guidance when possible.
fn report_error(err: &ExtractError, os: HostOs) {
    match err {
        ExtractError::Permission(..) if os == HostOs::Windows => {
            tracing::warn!(
                %err,
                "Ensure the temp directory is accessible, and that no antivirus or \
                 'Controlled folder access' setting is blocking the extraction."
            );
        }

        ExtractError::Permission(..) => {
            tracing::warn!(
                %err,
                "Ensure the current user can write to the temp directory. \
                 Rootless Podman may need 'podman unshare' to read some layers."
            );
        }

        _ => tracing::warn!(%err, "unable to extract the archive"),
    }
}

/// Count how many bytes have been read from `reader`.
struct PositionTracker<'a, R> {
    count: &'a Cell<usize>,
    reader: R,
}

impl<T: Read> Read for PositionTracker<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        self.count.set(self.count.get() + n);
        Ok(n)
    }
}

struct Context<'a, P: ?Sized> {
    dest: &'a Path,
    options: &'a ExtractOptions,
    policy: &'a P,
    summary: ExtractSummary,
}

impl<'a, P: ExtractionPolicy + ?Sized> Context<'a, P> {
    fn new(dest: &'a Path, options: &'a ExtractOptions, policy: &'a P) -> Self {
        Self {
            dest,
            options,
            policy,
            summary: ExtractSummary::default(),
        }
    }

    /// Abort in strict mode, or send a warning if not.
    fn integrity_issue(&mut self, err: ExtractError) -> Result<(), ExtractError> {
        if self.options.strict {
            return Err(err);
        }

        self.summary.warnings += 1;
        self.policy.integrity_warning(&err);
        Ok(())
    }

    fn skip(&mut self, path: &Path, cause: &dyn Display) {
        self.summary.skipped += 1;
        self.policy.entry_skipped(path, cause);
    }

    fn unpack(&mut self, mut entry: tar::Entry<impl Read>) -> Result<(), ExtractError> {
        let raw_path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let entry_type = entry.header().entry_type();

        let relative = match normalize_path(&raw_path) {
            Ok(p) => p,
            Err(_) => return self.integrity_issue(ExtractError::UnsafePath(raw_path)),
        };

        // The root directory of the archive.
        if relative.as_os_str().is_empty() {
            return Ok(());
        }

        let mut denylist_key = relative
            .iter()
            .map(|c| c.to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry_type.is_dir() {
            denylist_key.push('/');
        }

        if let Err(denied) = policy::check_denylist(&denylist_key, entry_type) {
            self.skip(&relative, &denied);
            return Ok(());
        }

        let info = EntryInfo {
            path: &relative,
            entry_type,
            size: entry.size(),
        };

        if !self.policy.filter(&info) {
            self.skip(&relative, &"Rejected by the extraction policy");
            return Ok(());
        }

        let result = match entry_type {
            tar::EntryType::Directory => self.ensure_dir(&relative).map(drop),

            tar::EntryType::Regular | tar::EntryType::Continuous => {
                self.unpack_regular(&relative, &mut entry)
            }

            other => {
                self.skip(&relative, &InvalidEntryType(other));
                return Ok(());
            }
        };

        if let Err(e) = result {
            return self.integrity_issue(ExtractError::io(e, relative));
        }

        self.summary.written += 1;

        if self.options.strict && self.options.verify_blobs && entry_type.is_file() {
            self.verify_blob(&relative)?;
        }

        Ok(())
    }

    fn unpack_regular(&self, relative: &Path, entry: &mut impl Read) -> io::Result<()> {
        let parent = match relative.parent() {
            Some(parent) => self.ensure_dir(parent)?,
            None => self.dest.to_owned(),
        };

        let Some(file_name) = relative.file_name() else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "Missing file name"));
        };

        let target = parent.join(file_name);

        // Later entries replace anything in the same path.
        match fs::symlink_metadata(&target) {
            Ok(m) if m.is_dir() => fs::remove_dir_all(&target)?,
            Ok(_) => fs::remove_file(&target)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => return Err(e),
        }

        let mut output = File::create(&target)?;
        io::copy(entry, &mut output)?;

        Ok(())
    }

    /// Create the directory `relative`, and all of its parents, in the
    /// destination directory.
    ///
    /// Any non-directory (like a file from a previous layer) in the path is
    /// removed.
    fn ensure_dir(&self, relative: &Path) -> io::Result<PathBuf> {
        let mut path = self.dest.to_path_buf();

        for component in relative.iter() {
            path.push(component);

            match fs::symlink_metadata(&path) {
                Ok(m) if m.is_dir() => continue,

                Ok(_) => {
                    fs::remove_file(&path)?;
                    fs::create_dir(&path)?;
                }

                Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir(&path)?,

                Err(e) => return Err(e),
            }
        }

        Ok(path)
    }

    /// Check the content of blobs stored in an OCI layout.
    fn verify_blob(&mut self, relative: &Path) -> Result<(), ExtractError> {
        let Some(digest) = Digest::from_blob_path(relative) else {
            return Ok(());
        };

        match digest.verify_file(&self.dest.join(relative)) {
            Ok(()) => Ok(()),

            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                Err(ExtractError::DigestMismatch(e, relative.to_owned()))
            }

            Err(e) => Err(ExtractError::io(e, relative)),
        }
    }
}

struct InvalidEntryType(tar::EntryType);

impl Display for InvalidEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Unsupported entry type: {:?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);

            // Write the name directly, so unsafe paths are kept.
            let name = &mut header.as_old_mut().name;
            name[..path.len()].copy_from_slice(path.as_bytes());

            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }

        builder.into_inner().unwrap()
    }

    #[test]
    fn soft_errors() {
        let dest = tempfile::tempdir().unwrap();
        let options = ExtractOptions::default();

        let err = extract_archive(Cursor::new(b""), dest.path(), &options, &SilentPolicy)
            .unwrap_err();
        assert!(matches!(err, ExtractError::Empty));
        assert!(err.is_soft());

        let garbage = vec![b'x'; 2048];
        let err = extract_archive(Cursor::new(garbage), dest.path(), &options, &SilentPolicy)
            .unwrap_err();
        assert!(matches!(err, ExtractError::NotAnArchive(_)), "{err:?}");
        assert!(err.is_soft());
    }

    #[test]
    fn unsafe_paths_in_strict_mode() {
        let dest = tempfile::tempdir().unwrap();
        let data = archive(&[("ok.txt", b"1"), ("../../escape.txt", b"2")]);

        let err = extract_archive(
            Cursor::new(data),
            &dest.path().join("root"),
            &ExtractOptions::default(),
            &SilentPolicy,
        )
        .unwrap_err();

        assert!(matches!(err, ExtractError::UnsafePath(_)), "{err:?}");
        assert!(!err.is_soft());
        assert!(!dest.path().join("escape.txt").exists());
    }

    #[test]
    fn unsafe_paths_in_non_strict_mode() {
        let dest = tempfile::tempdir().unwrap();
        let root = dest.path().join("root");
        let data = archive(&[
            ("../../escape.txt", b"1"),
            ("/abs/file.txt", b"2"),
            ("C:\\win\\file.txt", b"3"),
        ]);

        let options = ExtractOptions {
            strict: false,
            ..ExtractOptions::default()
        };

        let summary = extract_archive(Cursor::new(data), &root, &options, &SilentPolicy).unwrap();

        assert_eq!(summary.warnings, 1);
        assert_eq!(summary.written, 2);
        assert!(!dest.path().join("escape.txt").exists());
        assert_eq!(fs::read(root.join("abs/file.txt")).unwrap(), b"2");
        assert_eq!(fs::read(root.join("win/file.txt")).unwrap(), b"3");
    }

    #[test]
    fn policy_filter() {
        struct OnlyPython;

        impl ExtractionPolicy for OnlyPython {
            fn filter(&self, entry: &EntryInfo) -> bool {
                entry.path.extension().is_some_and(|e| e == "py")
            }
        }

        let dest = tempfile::tempdir().unwrap();
        let data = archive(&[("app/main.py", b"print()"), ("app/main.js", b"")]);

        let summary = extract_archive(
            Cursor::new(data),
            dest.path(),
            &ExtractOptions::default(),
            &OnlyPython,
        )
        .unwrap();

        assert_eq!(summary.written, 1);
        assert_eq!(summary.skipped, 1);
        assert!(dest.path().join("app/main.py").exists());
        assert!(!dest.path().join("app/main.js").exists());
    }

    #[test]
    fn file_replaces_directory() {
        let dest = tempfile::tempdir().unwrap();
        let options = ExtractOptions::default();

        let data = archive(&[("a/b/c.txt", b"x")]);
        extract_archive(Cursor::new(data), dest.path(), &options, &SilentPolicy).unwrap();

        let data = archive(&[("a/b", b"file"), ("a/b2/c", b"y")]);
        extract_archive(Cursor::new(data), dest.path(), &options, &SilentPolicy).unwrap();

        assert_eq!(fs::read(dest.path().join("a/b")).unwrap(), b"file");

        // Now, replace the file with a directory.
        let data = archive(&[("a/b/new.txt", b"z")]);
        extract_archive(Cursor::new(data), dest.path(), &options, &SilentPolicy).unwrap();

        assert_eq!(fs::read(dest.path().join("a/b/new.txt")).unwrap(), b"z");
    }

    #[test]
    fn blob_digest_mismatch() {
        // sha256 of `abc`.
        const DIGEST: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

        let path = format!("blobs/sha256/{DIGEST}");
        let dest = tempfile::tempdir().unwrap();

        let verify = ExtractOptions {
            verify_blobs: true,
            ..ExtractOptions::default()
        };

        let good = archive(&[(&path, b"abc")]);
        extract_archive(Cursor::new(good), dest.path(), &verify, &SilentPolicy).unwrap();

        let bad = archive(&[(&path, b"abcd")]);
        let err = extract_archive(Cursor::new(bad.clone()), dest.path(), &verify, &SilentPolicy)
            .unwrap_err();

        assert!(matches!(err, ExtractError::DigestMismatch(..)), "{err:?}");

        // Digests are not checked in non-strict mode.
        let options = ExtractOptions {
            strict: false,
            ..verify
        };

        extract_archive(Cursor::new(bad), dest.path(), &options, &SilentPolicy).unwrap();
    }

    #[test]
    fn content_store_inside_layer() {
        let dest = tempfile::tempdir().unwrap();

        let path = format!("var/lib/containerd/blobs/sha256/{}", "1".repeat(64));
        let data = archive(&[(&path, b"not the digest")]);

        let summary = extract_archive(
            Cursor::new(data),
            dest.path(),
            &ExtractOptions::default(),
            &SilentPolicy,
        )
        .unwrap();

        assert_eq!(summary.written, 1);
        assert_eq!(fs::read(dest.path().join(path)).unwrap(), b"not the digest");
    }
}
