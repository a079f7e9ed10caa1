//! Supply-chain screening for package installs.
//!
//! The payload is a whitespace-separated list of package specs and installer
//! flags (`left-pad@1.0.0`, `requests==2.31.0`, `@types/node@20.1.0 --save-dev`).
//! Exact versions and content hashes pass; anything floating needs a human;
//! anything that bypasses the registry is denied.

use std::sync::LazyLock;

use regex_lite::Regex;
use url::Url;

use super::network::HostAllowlist;
use super::{Finding, Screen, Severity};
use crate::action::{Action, ActionKind};

/// Flags that point the installer at another index.
const REGISTRY_OVERRIDES: &[&str] = &[
    "--registry",
    "-i",
    "--index",
    "--index-url",
    "--extra-index-url",
    "--trusted-host",
    "--find-links",
    "-f",
];

/// Flags that do not change where packages come from.
const BENIGN_FLAGS: &[&str] = &[
    "-D",
    "-E",
    "-q",
    "-U",
    "--dev",
    "--hash",
    "--locked",
    "--no-deps",
    "--no-save",
    "--quiet",
    "--require-hashes",
    "--save",
    "--save-dev",
    "--save-exact",
    "--upgrade",
    "--user",
];

static NAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(@[a-z0-9][a-z0-9._-]*/)?[A-Za-z0-9][A-Za-z0-9._-]*(\[[A-Za-z0-9,._-]+\])?$")
        .ok()
});

static EXACT_VERSION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^v?\d+(\.\d+){0,3}([-+][0-9A-Za-z.+-]+)?$").ok());

static CONTENT_HASH: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^((sha1|sha256|sha384|sha512)[:-][A-Za-z0-9+/=]{32,}|[0-9a-f]{40})$").ok()
});

static REPO_SHORTHAND: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+(#.*)?$").ok());

fn matches(regex: &LazyLock<Option<Regex>>, text: &str) -> bool {
    regex.as_ref().is_some_and(|re| re.is_match(text))
}

/// Screens `PackageInstall` actions.
pub(super) struct PackageScreen {
    registries: HostAllowlist,
}

impl PackageScreen {
    pub(super) fn new(registries: HostAllowlist) -> Self {
        Self { registries }
    }

    fn screen_spec(&self, spec: &str) -> Vec<Finding> {
        if spec.contains("://") {
            return self.screen_url_source(spec);
        }
        let lowered = spec.to_ascii_lowercase();
        let off_registry = ["git+", "git@", "github:", "gitlab:", "file:", "link:", "npm:"]
            .iter()
            .any(|prefix| lowered.starts_with(prefix))
            || spec.starts_with(['.', '/', '~'])
            || [".tgz", ".tar.gz", ".whl", ".zip", ".crate"]
                .iter()
                .any(|ext| lowered.ends_with(ext))
            || matches(&REPO_SHORTHAND, spec);
        if off_registry {
            return vec![Finding::deny(
                Severity::High,
                format!("`{spec}` installs from outside the package registry"),
            )];
        }

        let (name, version) = split_spec(spec);
        if !matches(&NAME, name) {
            return vec![Finding::deny(
                Severity::Medium,
                format!("malformed package name `{name}`"),
            )];
        }
        match version {
            None => vec![Finding::warn(
                Severity::Medium,
                format!("`{name}` is not pinned to a version or hash"),
            )],
            Some(VersionReq::Exact(v)) if matches(&EXACT_VERSION, v) || matches(&CONTENT_HASH, v) => {
                vec![Finding::note(format!("`{name}` pinned to {v}"))]
            }
            Some(VersionReq::Exact(v)) | Some(VersionReq::Range(v)) => vec![Finding::warn(
                Severity::Low,
                format!("`{name}` uses floating version `{v}`"),
            )],
        }
    }

    fn screen_url_source(&self, spec: &str) -> Vec<Finding> {
        let url = spec.strip_prefix("git+").unwrap_or(spec);
        let on_registry = Url::parse(url).is_ok_and(|u| {
            u.scheme() == "https" && u.host_str().is_some_and(|h| self.registries.allows(h))
        });
        if on_registry {
            vec![Finding::warn(
                Severity::Low,
                format!("`{spec}` installs a registry artifact by URL"),
            )]
        } else {
            vec![Finding::deny(
                Severity::High,
                format!("`{spec}` installs from a non-registry URL"),
            )]
        }
    }
}

impl Screen for PackageScreen {
    fn name(&self) -> &'static str {
        "packages"
    }

    fn screen(&self, action: &Action) -> Vec<Finding> {
        if action.kind() != ActionKind::PackageInstall {
            return Vec::new();
        }
        let mut tokens = action.payload().split_whitespace();
        let mut findings = Vec::new();
        let mut specs = 0;
        while let Some(token) = tokens.next() {
            if !token.starts_with('-') {
                specs += 1;
                findings.extend(self.screen_spec(token));
                continue;
            }
            let (flag, inline) = match token.split_once('=') {
                Some((flag, _)) => (flag, true),
                None => (token, false),
            };
            if REGISTRY_OVERRIDES.contains(&flag) {
                findings.push(Finding::deny(
                    Severity::High,
                    format!("`{flag}` overrides the package registry"),
                ));
                if !inline {
                    tokens.next();
                }
            } else if !BENIGN_FLAGS.contains(&flag) {
                findings.push(Finding::warn(
                    Severity::Low,
                    format!("unrecognised installer flag `{flag}`"),
                ));
            }
        }
        if specs == 0 {
            findings.push(Finding::deny(Severity::Low, "no package given"));
        }
        findings
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VersionReq<'a> {
    Exact(&'a str),
    Range(&'a str),
}

/// Split `name@version`, `@scope/name@version`, `name==version` and
/// comparator forms like `name>=1.0`.
fn split_spec(spec: &str) -> (&str, Option<VersionReq<'_>>) {
    if let Some((name, version)) = spec.split_once("===").or_else(|| spec.split_once("==")) {
        return (name, Some(VersionReq::Exact(version)));
    }
    if let Some(pos) = spec.rfind('@').filter(|&pos| pos > 0) {
        let version = &spec[pos + 1..];
        let req = if version.starts_with(['>', '<', '~', '!', '^', '=', '*']) {
            VersionReq::Range(version)
        } else {
            VersionReq::Exact(version)
        };
        return (&spec[..pos], Some(req));
    }
    match spec.find(['>', '<', '~', '!', '^']) {
        Some(pos) => (&spec[..pos], Some(VersionReq::Range(&spec[pos..]))),
        None => (spec, None),
    }
}
