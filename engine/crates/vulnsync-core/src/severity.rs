//! Severity levels derived from CVSS scores and feed labels

use serde::{Deserialize, Serialize};

/// Qualitative severity of a vulnerability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// No score available
    #[default]
    Unknown,
    /// CVSS 0.0
    None,
    /// CVSS 0.1 - 3.9
    Low,
    /// CVSS 4.0 - 6.9
    Medium,
    /// CVSS 7.0 - 8.9
    High,
    /// CVSS 9.0 - 10.0
    Critical,
}

impl Severity {
    /// Convert a CVSS 3.x/4.0 base score to severity
    pub fn from_cvss(score: f64) -> Self {
        match score {
            s if s >= 9.0 => Severity::Critical,
            s if s >= 7.0 => Severity::High,
            s if s >= 4.0 => Severity::Medium,
            s if s >= 0.1 => Severity::Low,
            s if s >= 0.0 => Severity::None,
            _ => Severity::Unknown,
        }
    }

    /// Parse a feed severity label ("HIGH", "Moderate", ...)
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" | "moderate" => Severity::Medium,
            "low" => Severity::Low,
            "none" => Severity::None,
            _ => Severity::Unknown,
        }
    }

    /// Resolve a severity from an optional label, falling back to the score
    pub fn resolve(label: Option<&str>, score: Option<f64>) -> Self {
        match label.map(Severity::from_label) {
            Some(severity) if severity != Severity::Unknown => severity,
            _ => score.map(Severity::from_cvss).unwrap_or_default(),
        }
    }

    /// Get display string
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Unknown => "Unknown",
            Severity::None => "None",
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cvss_to_severity() {
        assert_eq!(Severity::from_cvss(9.8), Severity::Critical);
        assert_eq!(Severity::from_cvss(7.5), Severity::High);
        assert_eq!(Severity::from_cvss(5.0), Severity::Medium);
        assert_eq!(Severity::from_cvss(2.0), Severity::Low);
        assert_eq!(Severity::from_cvss(0.0), Severity::None);
        assert_eq!(Severity::from_cvss(-1.0), Severity::Unknown);
    }

    #[test]
    fn test_label_wins_over_score() {
        assert_eq!(Severity::resolve(Some("MODERATE"), Some(9.9)), Severity::Medium);
        assert_eq!(Severity::resolve(Some("bogus"), Some(9.9)), Severity::Critical);
        assert_eq!(Severity::resolve(None, None), Severity::Unknown);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Low > Severity::None);
        assert!(Severity::None > Severity::Unknown);
    }
}
