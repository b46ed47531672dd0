//! MCP Protocol Version Support
//!
//! The client always proposes [`McpVersion::CURRENT`] during `initialize` and
//! accepts any version listed here in the server's answer.

use serde::{Deserialize, Serialize};

/// Supported MCP protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum McpVersion {
    #[serde(rename = "2024-11-05")]
    V2024_11_05,
    #[serde(rename = "2025-03-26")]
    V2025_03_26,
    #[serde(rename = "2025-06-18")]
    V2025_06_18,
}

impl McpVersion {
    /// Every version this crate can talk, oldest first
    pub const ALL: [McpVersion; 3] = [
        McpVersion::V2024_11_05,
        McpVersion::V2025_03_26,
        McpVersion::V2025_06_18,
    ];

    /// The version proposed in `initialize`
    pub const CURRENT: McpVersion = McpVersion::V2025_06_18;

    pub fn as_str(&self) -> &'static str {
        match self {
            McpVersion::V2024_11_05 => "2024-11-05",
            McpVersion::V2025_03_26 => "2025-03-26",
            McpVersion::V2025_06_18 => "2025-06-18",
        }
    }

    /// Whether `version` names a protocol revision this crate understands
    pub fn is_supported(version: &str) -> bool {
        version.parse::<McpVersion>().is_ok()
    }
}

impl std::fmt::Display for McpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for McpVersion {
    type Err = crate::McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|version| version.as_str() == s)
            .ok_or_else(|| crate::McpError::VersionMismatch {
                expected: Self::CURRENT.as_str().to_string(),
                actual: s.to_string(),
            })
    }
}

impl Default for McpVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing() {
        assert_eq!("2024-11-05".parse::<McpVersion>().unwrap(), McpVersion::V2024_11_05);
        assert_eq!("2025-06-18".parse::<McpVersion>().unwrap(), McpVersion::V2025_06_18);
        assert!("1999-01-01".parse::<McpVersion>().is_err());
    }

    #[test]
    fn test_supported_versions() {
        assert!(McpVersion::is_supported("2025-03-26"));
        assert!(!McpVersion::is_supported("latest"));
        assert_eq!(McpVersion::default().as_str(), "2025-06-18");
    }

    #[test]
    fn test_mismatch_error_names_both_versions() {
        let err = "2030-01-01".parse::<McpVersion>().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("2025-06-18"));
        assert!(text.contains("2030-01-01"));
    }
}
