//! Find the directories where package managers install their packages.

use std::{
    collections::BTreeSet,
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};

use walkdir::WalkDir;

/// System directories scanned in every image.
const SYSTEM_ROOTS: &[&str] = &[
    "usr/local/go",
    "usr/local/lib",
    "usr/local/lib64",
    "opt",
    "root",
    "home",
    "usr/share",
    "usr/src",
    "var/www/html",
    "var/lib",
    "mnt",
    "usr/lib",
    "usr/lib64",
];

/// Directories of Windows images.
const WINDOWS_ROOTS: &[&str] = &["Files", "ProgramData"];

/// Application directories, scanned if the working directory is not
/// already inside them.
const APP_ROOTS: &[&str] = &["app", "layers", "data", "srv"];

/// The working directory is not scanned if it is inside one of these,
/// since they are already in [`SYSTEM_ROOTS`].
const SCANNED_PARENTS: &[&str] = &["opt", "home", "root"];

/// Names of the directories with installed packages.
const PACKAGE_DIRS: &[&str] = &["site-packages", "node_modules", "gems", ".cargo", ".composer"];

/// Build the list of directories to scan for installed packages.
///
/// `all_layers_dir` is the directory with the exported archive, and
/// `exploded_dir` the filesystem of the image. The result is sorted, and
/// it only contains existing directories.
pub fn pkg_path_list(
    all_layers_dir: &Path,
    exploded_dir: &Path,
    working_dir: Option<&Path>,
) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = SYSTEM_ROOTS.iter().map(|r| exploded_dir.join(r)).collect();

    for dir in [all_layers_dir, exploded_dir] {
        roots.extend(WINDOWS_ROOTS.iter().map(|r| dir.join(r)));
    }

    if let Some(working_dir) = working_dir {
        let relative = working_dir.strip_prefix(exploded_dir).unwrap_or(working_dir);

        if !SCANNED_PARENTS.iter().any(|p| relative.starts_with(p)) {
            roots.push(working_dir.to_owned());
        }

        for app in APP_ROOTS {
            if !relative.starts_with(app) {
                roots.push(exploded_dir.join(app));
            }
        }
    }

    let mut paths = BTreeSet::new();

    for root in roots {
        if !root.is_dir() {
            continue;
        }

        paths.extend(package_dirs(&root, PACKAGE_DIRS));
        paths.insert(root);
    }

    for dir in [all_layers_dir, exploded_dir] {
        for python in python_installs(dir) {
            paths.extend(package_dirs(&python, &["site-packages"]));
        }
    }

    paths.into_iter().collect()
}

/// Directories under `root` whose name is in `names`. Matches are not
/// descended into.
fn package_dirs(root: &Path, names: &[&str]) -> Vec<PathBuf> {
    let is_match = |name: &OsStr| names.iter().any(|n| name == *n);

    let mut found = Vec::new();
    let mut walker = WalkDir::new(root).follow_links(false).min_depth(1).into_iter();

    loop {
        let entry = match walker.next() {
            None => break,
            Some(Ok(entry)) => entry,
            Some(Err(err)) => {
                tracing::trace!(%err, "unreadable entry");
                continue;
            }
        };

        if entry.file_type().is_dir() && is_match(entry.file_name()) {
            found.push(entry.into_path());
            walker.skip_current_dir();
        }
    }

    found
}

/// Top-level `Python*` directories, like `Python312` in Windows images.
fn python_installs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    entries
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.to_ascii_lowercase().starts_with("python"))
        })
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
        .map(|entry| entry.path())
        .collect()
}

/// Directories in the `PATH` variable of an image environment, like
/// the `Config.Env` list of the inspect data.
pub fn bin_paths<S: AsRef<str>>(env: &[S]) -> Vec<String> {
    env.iter()
        .find_map(|var| var.as_ref().strip_prefix("PATH="))
        .map(|path| {
            path.split(':')
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mkdirs(root: &Path, dirs: &[&str]) {
        for dir in dirs {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
    }

    #[test]
    fn scan_known_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let exploded = tmp.path().join("all-layers");

        mkdirs(
            &exploded,
            &[
                "usr/lib/python3/dist-packages",
                "usr/local/lib/python3.12/site-packages/pkg/node_modules",
                "app/node_modules/a/node_modules",
                "srv/vendor",
                "home/u/.cargo/registry",
                "workspace/src",
            ],
        );

        let working_dir = exploded.join("workspace");
        let paths = pkg_path_list(tmp.path(), &exploded, Some(&working_dir));

        let expected: Vec<PathBuf> = [
            "app",
            "app/node_modules",
            "home",
            "home/u/.cargo",
            "srv",
            "usr/lib",
            "usr/local/lib",
            "usr/local/lib/python3.12/site-packages",
            "workspace",
        ]
        .iter()
        .map(|p| exploded.join(p))
        .collect();

        assert_eq!(paths, expected);
    }

    #[test]
    fn working_dir_inside_known_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let exploded = tmp.path().join("all-layers");

        mkdirs(&exploded, &["opt/service", "app/node_modules", "data"]);

        let paths = pkg_path_list(tmp.path(), &exploded, Some(&exploded.join("app")));
        assert!(paths.contains(&exploded.join("app")));
        assert!(paths.contains(&exploded.join("app/node_modules")));
        assert!(paths.contains(&exploded.join("data")));

        let paths = pkg_path_list(tmp.path(), &exploded, Some(&exploded.join("opt/service")));
        assert!(!paths.contains(&exploded.join("opt/service")));
        assert!(paths.contains(&exploded.join("opt")));
    }

    #[test]
    fn windows_python_installs() {
        let tmp = tempfile::tempdir().unwrap();
        let exploded = tmp.path().join("all-layers");

        mkdirs(tmp.path(), &["Python312/Lib/site-packages", "ProgramData"]);
        fs::create_dir_all(&exploded).unwrap();

        let paths = pkg_path_list(tmp.path(), &exploded, None);

        assert_eq!(
            paths,
            [
                tmp.path().join("ProgramData"),
                tmp.path().join("Python312/Lib/site-packages"),
            ]
        );
    }

    #[test]
    fn path_from_env() {
        let env = ["LANG=C.UTF-8", "PATH=/usr/local/bin:/usr/bin::/bin"];
        assert_eq!(bin_paths(&env), ["/usr/local/bin", "/usr/bin", "/bin"]);

        assert!(bin_paths::<&str>(&[]).is_empty());
    }
}
