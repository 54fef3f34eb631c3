//! Advisory identifier normalisation.

use std::collections::BTreeSet;

use scanfleet_common::Severity;

/// Prefixes removed from advisory IDs before storage.
const STRIP_PREFIXES: &[&str] = &[
    "https://github.com/advisories/",
    "https://cve.mitre.org/cgi-bin/cvename.cgi?name=",
    "https://nvd.nist.gov/vuln/detail/",
];

/// Advisory IDs are kept only when they start with one of these, or with
/// one of [`STRIP_PREFIXES`].
const KEEP_PREFIXES: &[&str] = &[
    "CVE",
    "GHSA",
    "NSWG",
    "https://sca.analysiscenter.veracode.com/vulnerability-database/vulnerabilities/",
    "https://avd.aquasec.com/",
    "https://snyk.io/vuln/",
    "https://security.snyk.io/vuln/",
    "https://www.npmjs.com/advisories/",
    "https://bugzilla.redhat.com/show_bug.cgi?id=",
    "https://nodesecurity.io/advisories/",
    "https://security-tracker.debian.org/tracker/",
    "https://hackerone.com/reports/",
];

/// Recognised advisory IDs with URL prefixes stripped, sorted and deduped.
/// Falls back to the raw list when nothing is recognised.
pub fn normalize_advisory_ids(raw: &[String]) -> Vec<String> {
    let mut kept = BTreeSet::new();
    for id in raw {
        let known = KEEP_PREFIXES
            .iter()
            .chain(STRIP_PREFIXES)
            .any(|p| id.starts_with(p));
        if !known {
            tracing::debug!(advisory = %id, "ignoring advisory id");
            continue;
        }
        let stripped = STRIP_PREFIXES
            .iter()
            .find_map(|p| id.strip_prefix(p))
            .unwrap_or(id);
        kept.insert(stripped.to_string());
    }
    if kept.is_empty() {
        tracing::info!(advisories = ?raw, "no recognised advisory ids");
        return raw
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
    }
    kept.into_iter().collect()
}

/// Stored severities are always in the rank table; anything else is `none`.
pub fn valid_severity(raw: &str) -> &'static str {
    raw.parse::<Severity>()
        .map(|s| s.as_str())
        .unwrap_or(Severity::None.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_strips_url_prefixes_and_drops_unknown() {
        let out = normalize_advisory_ids(&ids(&[
            "https://github.com/advisories/GHSA-xxxx-yyyy-zzzz",
            "https://nvd.nist.gov/vuln/detail/CVE-2024-1234",
            "CVE-2024-1234",
            "internal-42",
        ]));
        assert_eq!(out, ids(&["CVE-2024-1234", "GHSA-xxxx-yyyy-zzzz"]));
    }

    #[test]
    fn test_keeps_known_urls_verbatim() {
        let out = normalize_advisory_ids(&ids(&["https://snyk.io/vuln/SNYK-JS-1"]));
        assert_eq!(out, ids(&["https://snyk.io/vuln/SNYK-JS-1"]));
    }

    #[test]
    fn test_falls_back_to_raw_list() {
        let out = normalize_advisory_ids(&ids(&["vendor-7", "vendor-3"]));
        assert_eq!(out, ids(&["vendor-3", "vendor-7"]));
    }

    #[test]
    fn test_invalid_severity_becomes_none() {
        assert_eq!(valid_severity("HIGH"), "high");
        assert_eq!(valid_severity(""), "none");
        assert_eq!(valid_severity("moderate"), "none");
    }
}
