use std::{
    io,
    path::{Component, Path, PathBuf},
};

/// Remove any root from `path`, so it is always relative.
///
/// Roots are removed until none is left, so paths like `//x/y` or
/// `C:\C:\x` are fully stripped. Windows roots (drive letters, UNC
/// shares and `//?/` device paths) are removed on every host, since
/// images may be built on either system.
///
/// # Examples
///
/// ```
/// # use container_export::strip_absolute_path;
/// assert_eq!(strip_absolute_path("/"), "");
/// assert_eq!(strip_absolute_path("/a/b"), "a/b");
/// assert_eq!(strip_absolute_path("C:\\Files\\app"), "Files\\app");
/// assert_eq!(strip_absolute_path("a/b"), "a/b");
/// ```
pub fn strip_absolute_path(mut path: &str) -> &str {
    if path == "/" {
        return "";
    }

    loop {
        let root = match windows_root_len(path) {
            0 => return path,

            // `//x/y` is a UNC root for Windows, but strip only one `/`
            // at a time so the remaining segments are kept.
            _ if path.starts_with('/') && !path.starts_with("//?/") => 1,

            len => len,
        };

        path = &path[root..];
    }
}

/// Length of the root of `path`, parsed as a Windows path.
fn windows_root_len(path: &str) -> usize {
    let bytes = path.as_bytes();
    let len = bytes.len();

    let is_sep = |b: u8| b == b'/' || b == b'\\';

    match bytes {
        [] => 0,

        [first, ..] if is_sep(*first) => {
            if len < 2 || !is_sep(bytes[1]) {
                return 1;
            }

            // UNC root: `\\server\share\`.
            let mut j = 2;
            let mut last = j;

            while j < len && !is_sep(bytes[j]) {
                j += 1;
            }

            if j == len || j == last {
                return 1;
            }

            last = j;
            while j < len && is_sep(bytes[j]) {
                j += 1;
            }

            if j == len || j == last {
                return 1;
            }

            last = j;
            while j < len && !is_sep(bytes[j]) {
                j += 1;
            }

            if j == len {
                j
            } else if j != last {
                j + 1
            } else {
                1
            }
        }

        [drive, b':', ..] if drive.is_ascii_alphabetic() => {
            if len > 2 && is_sep(bytes[2]) {
                3
            } else {
                2
            }
        }

        _ => 0,
    }
}

/// Convert the path of an archive entry to a relative path that can be
/// joined to the destination directory.
///
/// `\` is taken as a separator only in paths with a Windows root (like
/// `C:\` or `\\server\share`). `.` segments are ignored. Paths with
/// `..`, or with segments that the host would interpret as something
/// different than a file name, are rejected.
pub fn normalize_path(path: &str) -> io::Result<PathBuf> {
    let mut normalized = PathBuf::new();

    let separators: &[char] = if has_windows_root(path) { &['/', '\\'] } else { &['/'] };

    for segment in strip_absolute_path(path).split(separators) {
        match segment {
            "" | "." => continue,

            // Don't trust entries with `..` in the path.
            ".." => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Found '..' in the path.",
                ));
            }

            _ => {
                let mut components = Path::new(segment).components();
                match (components.next(), components.next()) {
                    (Some(Component::Normal(name)), None) if name == segment => {
                        normalized.push(name)
                    }

                    _ => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("Invalid path segment: {segment:?}"),
                        ));
                    }
                }
            }
        }
    }

    Ok(normalized)
}

fn has_windows_root(path: &str) -> bool {
    match path.as_bytes() {
        [b'\\', ..] => true,
        [drive, b':', ..] => drive.is_ascii_alphabetic(),
        _ => false,
    }
}

#[test]
fn strip_roots() {
    assert_eq!(strip_absolute_path("/"), "");
    assert_eq!(strip_absolute_path("/a/b"), "a/b");
    assert_eq!(strip_absolute_path("///a/b"), "a/b");
    assert_eq!(strip_absolute_path("//x/y/z"), "x/y/z");
    assert_eq!(strip_absolute_path("C:"), "");
    assert_eq!(strip_absolute_path("c:foo"), "foo");
    assert_eq!(strip_absolute_path("C:\\Windows\\x"), "Windows\\x");
    assert_eq!(strip_absolute_path("C:/C:/x"), "x");
    assert_eq!(strip_absolute_path("\\\\server\\share\\dir\\f"), "dir\\f");
    assert_eq!(strip_absolute_path("//?/C:/path"), "path");
    assert_eq!(strip_absolute_path("usr/lib"), "usr/lib");
    assert_eq!(strip_absolute_path(""), "");
}

#[test]
fn strip_is_idempotent() {
    for path in [
        "/",
        "/a/b",
        "//x/y/z",
        "C:\\Windows",
        "\\\\server\\share\\dir",
        "//?/C:/path",
        "relative/path",
        "./x",
    ] {
        let once = strip_absolute_path(path);
        assert_eq!(strip_absolute_path(once), once, "path: {path:?}");
    }
}

#[test]
fn normalize_entry_paths() {
    assert_eq!(normalize_path("/usr/lib/x").unwrap(), Path::new("usr/lib/x"));
    assert_eq!(normalize_path("./a/./b/").unwrap(), Path::new("a/b"));
    assert_eq!(normalize_path("C:\\Files\\app").unwrap(), Path::new("Files/app"));
    assert_eq!(normalize_path("/").unwrap(), Path::new(""));
    assert_eq!(
        normalize_path("\\\\server\\share\\dir\\f").unwrap(),
        Path::new("dir/f")
    );

    for unsafe_path in [
        "../../etc/passwd",
        "a/../../b",
        "/../x",
        "C:\\..\\x",
        "\\..\\x",
    ] {
        assert!(normalize_path(unsafe_path).is_err(), "path: {unsafe_path:?}");
    }
}

#[cfg(unix)]
#[test]
fn backslash_in_file_names() {
    let unit = "etc/systemd/system/dev-disk-by\\x2dlabel-root.device";

    assert_eq!(
        normalize_path(unit).unwrap(),
        Path::new("etc/systemd/system/dev-disk-by\\x2dlabel-root.device")
    );

    // A single file name on this host.
    assert_eq!(
        normalize_path("..\\..\\x").unwrap(),
        Path::new("..\\..\\x")
    );
}
