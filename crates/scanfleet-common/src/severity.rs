use std::cmp::Ordering;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Rank assigned to any severity string outside the known table.
pub const UNKNOWN_RANK: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Negligible,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Negligible => "negligible",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Position in the fixed rank table. Gaps leave room for CVSS-style bands.
    pub fn rank(&self) -> i32 {
        match self {
            Self::None => 0,
            Self::Negligible => 1,
            Self::Low => 2,
            Self::Medium => 5,
            Self::High => 8,
            Self::Critical => 10,
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "negligible" => Ok(Self::Negligible),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rank of a raw severity string, [`UNKNOWN_RANK`] when it is not in the table.
pub fn severity_rank(value: &str) -> i32 {
    value
        .parse::<Severity>()
        .map(|s| s.rank())
        .unwrap_or(UNKNOWN_RANK)
}

/// Pick the more severe of two raw severity strings.
///
/// Total and commutative: equal ranks (including two unknown values) fall
/// back to byte order so the result never depends on argument order.
pub fn most_severe<'a>(a: &'a str, b: &'a str) -> &'a str {
    match severity_rank(a).cmp(&severity_rank(b)) {
        Ordering::Greater => a,
        Ordering::Less => b,
        Ordering::Equal => {
            if a <= b {
                a
            } else {
                b
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: &[&str] = &[
        "none", "negligible", "low", "medium", "high", "critical", "HIGH", "Medium", "", "bogus",
        "unrated",
    ];

    #[test]
    fn test_rank_table() {
        assert_eq!(severity_rank("none"), 0);
        assert_eq!(severity_rank("negligible"), 1);
        assert_eq!(severity_rank("low"), 2);
        assert_eq!(severity_rank("medium"), 5);
        assert_eq!(severity_rank("high"), 8);
        assert_eq!(severity_rank("critical"), 10);
        assert_eq!(severity_rank("CRITICAL"), 10);
        assert_eq!(severity_rank("moderate"), UNKNOWN_RANK);
        assert_eq!(severity_rank(""), UNKNOWN_RANK);
    }

    #[test]
    fn test_most_severe_is_commutative() {
        for a in SAMPLES {
            for b in SAMPLES {
                assert_eq!(most_severe(a, b), most_severe(b, a), "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_most_severe_is_idempotent() {
        for a in SAMPLES {
            assert_eq!(most_severe(a, a), *a);
        }
    }

    #[test]
    fn test_unknown_never_outranks_known() {
        for known in ["none", "negligible", "low", "medium", "high", "critical"] {
            assert_eq!(most_severe(known, "bogus"), known);
            assert_eq!(most_severe("", known), known);
        }
    }

    #[test]
    fn test_higher_rank_wins() {
        assert_eq!(most_severe("medium", "high"), "high");
        assert_eq!(most_severe("critical", "low"), "critical");
    }

    #[test]
    fn test_severity_roundtrip_str() {
        for s in [
            Severity::None,
            Severity::Negligible,
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ] {
            assert_eq!(s.as_str().parse::<Severity>(), Ok(s));
        }
        assert!("severe".parse::<Severity>().is_err());
    }
}
