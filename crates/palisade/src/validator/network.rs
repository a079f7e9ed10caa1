//! Egress screening: allowlisted hosts, URL hygiene and DNS-exfiltration shapes.

use std::collections::HashMap;

use glob::Pattern;
use tracing::warn;
use url::{Host, Url};

use super::{Finding, Screen, Severity};
use crate::action::{Action, ActionKind};
use crate::redact::contains_secret;

/// Longest query string accepted on an outbound request.
const MAX_QUERY_LEN: usize = 1024;
/// Labels longer than this look like encoded payloads rather than names.
const MAX_LABEL_LEN: usize = 40;
/// More labels than this looks like data chunked into subdomains.
const MAX_LABELS: usize = 8;

/// A set of host names and glob patterns that egress may reach.
///
/// Matching is case-insensitive. `*.example.com` matches every subdomain of
/// `example.com` but not `example.com` itself.
#[derive(Debug, Clone, Default)]
pub struct HostAllowlist {
    patterns: Vec<Pattern>,
}

impl HostAllowlist {
    /// Compile an allowlist. Invalid patterns are logged and skipped.
    pub fn new(entries: &[String]) -> Self {
        let patterns = entries
            .iter()
            .filter_map(|entry| {
                let entry = entry.trim().to_ascii_lowercase();
                match Pattern::new(&entry) {
                    Ok(pattern) => Some(pattern),
                    Err(e) => {
                        warn!(pattern = %entry, error = %e, "Skipping invalid allowlist pattern");
                        None
                    }
                }
            })
            .collect();
        Self { patterns }
    }

    /// Whether `host` is covered by the allowlist.
    pub fn allows(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.patterns.iter().any(|p| p.matches(&host))
    }

    /// Whether the allowlist denies everything.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Screens `NetworkFetch` actions.
pub(super) struct NetworkScreen {
    egress: HostAllowlist,
}

impl NetworkScreen {
    pub(super) fn new(egress: HostAllowlist) -> Self {
        Self { egress }
    }
}

impl Screen for NetworkScreen {
    fn name(&self) -> &'static str {
        "network"
    }

    fn screen(&self, action: &Action) -> Vec<Finding> {
        if action.kind() != ActionKind::NetworkFetch {
            return Vec::new();
        }
        let target = action.payload().trim();
        if target.is_empty() {
            return vec![Finding::deny(Severity::Low, "fetch has no URL")];
        }
        if target.chars().any(char::is_whitespace) {
            return vec![Finding::deny(
                Severity::Medium,
                "fetch payload must be a single URL",
            )];
        }
        screen_url(target, &self.egress)
    }
}

/// Screen one URL against the allowlist and exfiltration heuristics.
pub(super) fn screen_url(raw: &str, egress: &HostAllowlist) -> Vec<Finding> {
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(e) => {
            return vec![Finding::deny(
                Severity::Medium,
                format!("unparseable URL ({e})"),
            )];
        }
    };

    let mut findings = Vec::new();
    if !matches!(url.scheme(), "http" | "https") {
        findings.push(Finding::deny(
            Severity::High,
            format!("URL scheme `{}` is not permitted", url.scheme()),
        ));
    }
    if !url.username().is_empty() || url.password().is_some() {
        findings.push(Finding::deny(
            Severity::High,
            "credentials embedded in URL",
        ));
    }
    if contains_secret(raw) {
        findings.push(Finding::deny(Severity::High, "secret embedded in URL"));
    }
    if url.query().is_some_and(|q| q.len() > MAX_QUERY_LEN) {
        findings.push(Finding::deny(
            Severity::High,
            "oversized query string looks like data exfiltration",
        ));
    }

    match url.host() {
        Some(Host::Domain(domain)) => findings.extend(screen_host(domain, egress)),
        Some(Host::Ipv4(ip)) => findings.extend(screen_ip_literal(&ip.to_string(), egress)),
        Some(Host::Ipv6(ip)) => findings.extend(screen_ip_literal(&ip.to_string(), egress)),
        None => findings.push(Finding::deny(Severity::Medium, "URL has no host")),
    }
    findings
}

/// Screen a bare host name (DNS tools, scheme-less fetch targets).
pub(super) fn screen_host(host: &str, egress: &HostAllowlist) -> Vec<Finding> {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.parse::<std::net::IpAddr>().is_ok() {
        return screen_ip_literal(&host, egress);
    }
    if let Some(reason) = exfiltration_shape(&host) {
        return vec![Finding::deny(
            Severity::High,
            format!("host `{host}` looks like DNS exfiltration: {reason}"),
        )];
    }
    if egress.allows(&host) {
        vec![Finding::note(format!("egress to allow-listed host `{host}`"))]
    } else {
        vec![Finding::deny(
            Severity::High,
            format!("host `{host}` is not on the egress allowlist"),
        )]
    }
}

fn screen_ip_literal(ip: &str, egress: &HostAllowlist) -> Vec<Finding> {
    if egress.allows(ip) {
        vec![Finding::note(format!("egress to allow-listed address `{ip}`"))]
    } else {
        vec![Finding::deny(
            Severity::High,
            format!("IP literal `{ip}` bypasses the egress allowlist"),
        )]
    }
}

/// Describe why a host name looks like data smuggled through DNS, if it does.
fn exfiltration_shape(host: &str) -> Option<String> {
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() > MAX_LABELS {
        return Some(format!("{} labels", labels.len()));
    }
    for label in &labels {
        if label.len() > MAX_LABEL_LEN {
            return Some(format!("{}-character label", label.len()));
        }
        if label.len() >= 16 && label.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some("hex-encoded label".to_string());
        }
        if label.len() >= 20 && shannon_entropy(label) > 3.8 {
            return Some("high-entropy label".to_string());
        }
    }
    None
}

fn shannon_entropy(s: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in s.chars() {
        *counts.entry(c).or_default() += 1;
    }
    let len = s.chars().count() as f64;
    counts
        .values()
        .map(|&n| {
            let p = n as f64 / len;
            -p * p.log2()
        })
        .sum()
}
