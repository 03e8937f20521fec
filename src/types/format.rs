//! Frame format descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ReadoutError;

/// Names one of the supported frame layouts.
///
/// Resolved once per endpoint from its declared data type and immutable afterwards.
/// Parsing is an exact, case-sensitive match against the canonical names; there is no
/// prefix or substring matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatDescriptor {
    #[serde(rename = "WIBEthFrame")]
    WibEth,
    #[serde(rename = "PDSFrame")]
    Daphne,
    #[serde(rename = "PDSStreamFrame")]
    DaphneStream,
    #[serde(rename = "SSPFrame")]
    Ssp,
    #[serde(rename = "TDEFrame")]
    Tde,
    #[serde(rename = "CRTFrame")]
    Crt,
}

impl FormatDescriptor {
    pub const ALL: [FormatDescriptor; 6] = [
        FormatDescriptor::WibEth,
        FormatDescriptor::Daphne,
        FormatDescriptor::DaphneStream,
        FormatDescriptor::Ssp,
        FormatDescriptor::Tde,
        FormatDescriptor::Crt,
    ];

    /// Canonical data-type name used on queue endpoints.
    pub const fn as_str(self) -> &'static str {
        match self {
            FormatDescriptor::WibEth => "WIBEthFrame",
            FormatDescriptor::Daphne => "PDSFrame",
            FormatDescriptor::DaphneStream => "PDSStreamFrame",
            FormatDescriptor::Ssp => "SSPFrame",
            FormatDescriptor::Tde => "TDEFrame",
            FormatDescriptor::Crt => "CRTFrame",
        }
    }

    /// Exact-match lookup; `None` for anything outside the closed set.
    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == name)
    }
}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatDescriptor {
    type Err = ReadoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::lookup(s).ok_or_else(|| ReadoutError::unsupported_format(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_names_round_trip() {
        for format in FormatDescriptor::ALL {
            assert_eq!(format.as_str().parse::<FormatDescriptor>().unwrap(), format);
        }
    }

    #[test]
    fn lookup_is_exact() {
        // A descriptor that merely contains a supported name must not match it.
        assert_eq!(FormatDescriptor::lookup("PDSStreamFrame"), Some(FormatDescriptor::DaphneStream));
        assert_eq!(FormatDescriptor::lookup("XPDSFrame"), None);
        assert_eq!(FormatDescriptor::lookup("WIBEthFrameV2"), None);
        assert_eq!(FormatDescriptor::lookup("wibethframe"), None);
        assert_eq!(FormatDescriptor::lookup(""), None);
        assert!(matches!("UnknownFrame".parse::<FormatDescriptor>(), Err(ReadoutError::UnsupportedFormat { .. })));
    }

    #[test]
    fn serde_uses_canonical_names() {
        let yaml = serde_yaml_ng::to_string(&FormatDescriptor::Tde).unwrap();
        assert_eq!(yaml.trim(), "TDEFrame");
        let parsed: FormatDescriptor = serde_yaml_ng::from_str("CRTFrame").unwrap();
        assert_eq!(parsed, FormatDescriptor::Crt);
    }
}
