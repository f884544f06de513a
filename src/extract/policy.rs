use std::{fmt::Display, path::Path};

use super::ExtractSummary;

/// Paths that are never written, whatever the extraction mode is.
///
/// An entry is denied if its path contains any of these strings.
const DENYLIST: &[&str] = &[
    "etc/machine-id",
    "etc/gshadow",
    "etc/shadow",
    "etc/passwd",
    "etc/ssl/certs",
    "etc/pki/ca-trust",
    "usr/lib/systemd/",
    "usr/lib64/libdevmapper.so",
    "usr/sbin/",
    "cacerts",
    "ssl/certs",
    "logs/",
    "dev/",
    "usr/share/zoneinfo/",
    "usr/share/doc/",
    "usr/share/i18n/",
    "var/lib/ca-certificates",
    "root/.gnupg",
    "usr/share/licenses/device-mapper-libs",
];

/// Entry from an archive, given to [`ExtractionPolicy::filter`].
#[derive(Debug)]
pub struct EntryInfo<'a> {
    /// Path relative to the destination directory.
    pub path: &'a Path,

    pub entry_type: tar::EntryType,

    /// Size of the contents, in bytes.
    pub size: u64,
}

/// Decide which entries are extracted, and receive notifications for
/// events during the extraction.
///
/// All methods are optional. Entries in the built-in denylist are
/// skipped before the policy is consulted.
#[expect(unused_variables)]
pub trait ExtractionPolicy: Send + Sync {
    /// Return `false` to skip the entry.
    fn filter(&self, entry: &EntryInfo) -> bool {
        true
    }

    /// Start to extract an archive.
    ///
    /// `source` identifies the archive, like its file path.
    fn archive_start(&self, source: &dyn Display) {}

    /// Some data has been read from the archive.
    ///
    /// `archive_position` is the number of bytes consumed from the
    /// (compressed) input.
    fn archive_progress(&self, archive_position: usize) {}

    /// An entry in the archive is skipped.
    ///
    /// For example, if its path is in the denylist, or it is an invalid
    /// entry type, like a block device.
    fn entry_skipped(&self, path: &Path, cause: &dyn Display) {}

    /// Integrity problem that was ignored because the extraction is not
    /// strict.
    fn integrity_warning(&self, cause: &dyn Display) {}

    /// All entries of the archive were processed.
    fn finished(&self, summary: &ExtractSummary) {}
}

/// [`ExtractionPolicy`] that accepts every entry and sends the events
/// to [`tracing`].
#[derive(Debug, Default)]
pub struct LoggingPolicy;

impl ExtractionPolicy for LoggingPolicy {
    fn archive_start(&self, source: &dyn Display) {
        tracing::debug!(%source, "extracting archive");
    }

    fn entry_skipped(&self, path: &Path, cause: &dyn Display) {
        tracing::debug!(path = %path.display(), %cause, "entry skipped");
    }

    fn integrity_warning(&self, cause: &dyn Display) {
        tracing::warn!(%cause, "ignoring invalid archive entry");
    }

    fn finished(&self, summary: &ExtractSummary) {
        tracing::debug!(
            written = summary.written,
            skipped = summary.skipped,
            warnings = summary.warnings,
            "archive extracted",
        );
    }
}

/// [`ExtractionPolicy`] to accept all entries and ignore all events.
#[derive(Debug, Default)]
pub struct SilentPolicy;

impl ExtractionPolicy for SilentPolicy {}

/// Reasons to deny an entry.
#[derive(Debug, PartialEq)]
pub(super) enum Denied {
    Path(&'static str),
    Hidden,
    EntryType(tar::EntryType),
}

impl Display for Denied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Denied::Path(pattern) => write!(f, "Path matches {pattern:?}"),
            Denied::Hidden => f.write_str("Hidden file"),
            Denied::EntryType(t) => write!(f, "Invalid entry type: {t:?}"),
        }
    }
}

/// Check if an entry must never be written.
///
/// `path` is the normalized path, with `/` as separator. Directories
/// must include a trailing `/`.
pub(super) fn check_denylist(path: &str, entry_type: tar::EntryType) -> Result<(), Denied> {
    use tar::EntryType;

    match entry_type {
        EntryType::Link
        | EntryType::Symlink
        | EntryType::Char
        | EntryType::Block
        | EntryType::Fifo => return Err(Denied::EntryType(entry_type)),

        // Multi-volume, tape volume and renamed entries from old GNU tar.
        t if matches!(t.as_byte(), b'M' | b'V' | b'N') => return Err(Denied::EntryType(entry_type)),

        _ => (),
    }

    if let Some(pattern) = DENYLIST.iter().find(|p| path.contains(*p)) {
        return Err(Denied::Path(pattern));
    }

    let file_name = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    if file_name.starts_with('.') {
        return Err(Denied::Hidden);
    }

    Ok(())
}

#[test]
fn denied_entries() {
    use tar::EntryType;

    let regular = EntryType::Regular;

    assert_eq!(check_denylist("etc/passwd", regular), Err(Denied::Path("etc/passwd")));
    assert_eq!(check_denylist("dev/", EntryType::Directory), Err(Denied::Path("dev/")));
    assert_eq!(
        check_denylist("usr/share/doc/bash/README", regular),
        Err(Denied::Path("usr/share/doc/"))
    );
    assert_eq!(check_denylist("app/.env", regular), Err(Denied::Hidden));
    assert_eq!(check_denylist(".wh.foo", regular), Err(Denied::Hidden));

    for entry_type in [
        EntryType::Symlink,
        EntryType::Link,
        EntryType::Block,
        EntryType::Char,
        EntryType::Fifo,
        EntryType::new(b'M'),
        EntryType::new(b'V'),
        EntryType::new(b'N'),
    ] {
        assert_eq!(
            check_denylist("usr/bin/tool", entry_type),
            Err(Denied::EntryType(entry_type))
        );
    }

    assert_eq!(check_denylist("usr/lib/python3/site-packages/a.py", regular), Ok(()));
    assert_eq!(check_denylist("home/app/.cargo/registry/x.rs", regular), Ok(()));
    assert_eq!(check_denylist("usr/bin/", EntryType::Directory), Ok(()));
}
