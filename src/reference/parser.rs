//! Parse a reference to a container image.
//!
//! It follows what the `docker` CLI accepts closely enough to find the
//! image in a local daemon, but it does not validate anything. Each step
//! removes its segment from the string before the next one runs.

use super::ImageReference;

const PLATFORM_PREFIX: &str = "--platform=";

const DIGEST_SEPARATOR: &str = "@sha256:";

pub(super) fn parse(reference: &str) -> ImageReference {
    let mut parsed = ImageReference::default();

    let reference = reference.trim().to_lowercase();
    let mut rest = reference.as_str();

    if let Some(value) = rest.strip_prefix(PLATFORM_PREFIX) {
        let (platform, image) = value.split_once(' ').unwrap_or((value, ""));
        parsed.platform = platform.to_owned();
        rest = image.trim();
    }

    if rest.is_empty() {
        return parsed;
    }

    // The first segment is the registry if it looks like a hostname.
    if let Some((host, path)) = rest.split_once('/') {
        if is_registry_host(host) {
            parsed.registry = host.to_owned();
            rest = path;
        }
    }

    // Digest must be removed before the tag, so its `:` is never
    // taken as the tag separator.
    if let Some((base, digest)) = rest.rsplit_once(DIGEST_SEPARATOR) {
        parsed.digest = digest.to_owned();
        rest = base;
    }

    if let Some((base, tag)) = rest.rsplit_once(':') {
        parsed.tag = tag.to_owned();
        rest = base;
    }

    parsed.repo = rest.to_owned();

    match rest.rsplit_once('/') {
        Some((group, name)) => {
            parsed.group = group.to_owned();
            parsed.name = name.to_owned();
        }

        None => parsed.name = rest.to_owned(),
    }

    parsed
}

fn is_registry_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

#[test]
fn parse_valid_references() {
    macro_rules! check {
        ($reference:expr, [ $registry:expr, $repo:expr, $group:expr, $name:expr, $tag:expr, $digest:expr ]) => {
            assert_eq!(
                parse($reference),
                ImageReference {
                    registry: $registry.into(),
                    repo: $repo.into(),
                    tag: $tag.into(),
                    digest: $digest.into(),
                    platform: String::new(),
                    group: $group.into(),
                    name: $name.into(),
                },
                "reference: {}",
                $reference,
            )
        };
    }

    check!("debian", ["", "debian", "", "debian", "", ""]);

    check!("debian:jessie", ["", "debian", "", "debian", "jessie", ""]);

    check!("ubuntu@sha256:abc123", ["", "ubuntu", "", "ubuntu", "", "abc123"]);

    check!(
        "myregistry.local:5000/testing/test-image",
        [
            "myregistry.local:5000",
            "testing/test-image",
            "testing",
            "test-image",
            "",
            ""
        ]
    );

    check!(
        "ghcr.io/owner/team/tool:1.2.3",
        ["ghcr.io", "owner/team/tool", "owner/team", "tool", "1.2.3", ""]
    );

    check!(
        "localhost/foo:dev",
        ["localhost", "foo", "", "foo", "dev", ""]
    );

    check!(
        "shiftleft/scan-slim",
        ["", "shiftleft/scan-slim", "shiftleft", "scan-slim", "", ""]
    );

    check!(
        "  Docker.IO/Library/Node:20@sha256:FFFF  ",
        ["docker.io", "library/node", "library", "node", "20", "ffff"]
    );
}

#[test]
fn parse_platform_prefix() {
    let parsed = parse("--platform=linux/amd64 python:3.12-slim");
    assert_eq!(parsed.platform, "linux/amd64");
    assert_eq!(parsed.repo, "python");
    assert_eq!(parsed.tag, "3.12-slim");

    // Only the flag.
    let parsed = parse("--platform=linux/amd64");
    assert_eq!(parsed.platform, "linux/amd64");
    assert!(parsed.repo.is_empty());
}

#[test]
fn parse_empty_reference() {
    assert_eq!(parse(""), ImageReference::default());
    assert_eq!(parse("   "), ImageReference::default());
}
