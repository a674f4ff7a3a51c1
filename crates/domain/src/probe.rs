use serde::{Deserialize, Serialize};

use crate::link::{LinkParams, SlaveId};

/// Conclusion of probing a single (link, slave id) candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProbeOutcome {
    Present,
    PresentWithException { code: u8 },
    NotPresentTimeout,
    NotPresentCrc,
    NotPresentOther,
}

impl ProbeOutcome {
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present | Self::PresentWithException { .. })
    }

    pub fn exception_code(&self) -> Option<u8> {
        match self {
            Self::PresentWithException { code } => Some(*code),
            _ => None,
        }
    }
}

/// Identification details gathered while probing, when the device offers any.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identification {
    pub vendor_name: Option<String>,
    pub product_code: Option<String>,
    pub model: Option<String>,
    pub revision: Option<String>,
    pub supports_fc43: bool,
}

/// Outcome, response time and identification of one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub outcome: ProbeOutcome,
    pub response_time_ms: u64,
    pub identification: Identification,
}

/// A candidate that answered during a scan.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    pub slave_id: SlaveId,
    pub link: LinkParams,
    pub probe: ProbeResult,
}

/// Per-candidate state reported by the scanner while it works.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestAttempt {
    Testing,
    Found,
    NotFound,
}

impl TestAttempt {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Testing => "testing",
            Self::Found => "found",
            Self::NotFound => "not-found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_class_outcomes() {
        assert!(ProbeOutcome::Present.is_present());
        assert!(ProbeOutcome::PresentWithException { code: 2 }.is_present());
        assert!(!ProbeOutcome::NotPresentTimeout.is_present());
        assert!(!ProbeOutcome::NotPresentCrc.is_present());
        assert!(!ProbeOutcome::NotPresentOther.is_present());
    }

    #[test]
    fn test_exception_code_carried() {
        assert_eq!(
            ProbeOutcome::PresentWithException { code: 11 }.exception_code(),
            Some(11)
        );
        assert_eq!(ProbeOutcome::Present.exception_code(), None);
    }

    #[test]
    fn test_attempt_states() {
        assert_eq!(TestAttempt::Testing.as_str(), "testing");
        assert_eq!(TestAttempt::Found.as_str(), "found");
        assert_eq!(TestAttempt::NotFound.as_str(), "not-found");
    }
}
