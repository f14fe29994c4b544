/// Consent snapshot
///
/// A pure read of the current regulatory consent signals at call time. The
/// retrieval utilities themselves (CMP bindings, __uspapi/__gpp plumbing)
/// live on the host side of the `ConsentSource` boundary.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Consent signals observed at the moment of a resolution call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentSnapshot {
    /// US-privacy (CCPA) string
    pub us_privacy: Option<String>,
    /// Global Privacy Platform consent string
    pub gpp_string: Option<String>,
    /// Whether the GPP framework applies to this visitor
    pub gpp_applies: Option<bool>,
}

impl ConsentSnapshot {
    /// True when either stored signal differs from this snapshot
    ///
    /// Drift in either direction (signal appeared, disappeared, or changed)
    /// invalidates the cached resolution.
    pub fn drifted_from(&self, stored_usp: &Option<String>, stored_gpp: &Option<String>) -> bool {
        self.us_privacy != *stored_usp || self.gpp_string != *stored_gpp
    }
}

/// Host-supplied source of consent signals
#[async_trait]
pub trait ConsentSource: Send + Sync {
    /// Read the current signals; must not block on user interaction
    async fn snapshot(&self) -> ConsentSnapshot;
}

/// Fixed consent signals, for hosts without a CMP and for tests
#[derive(Debug, Clone, Default)]
pub struct StaticConsent(pub ConsentSnapshot);

#[async_trait]
impl ConsentSource for StaticConsent {
    async fn snapshot(&self) -> ConsentSnapshot {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drift_detection() {
        let snapshot = ConsentSnapshot {
            us_privacy: Some("1YNN".to_string()),
            gpp_string: Some("DBABL~BVV".to_string()),
            gpp_applies: Some(true),
        };

        // Identical stored signals: no drift
        assert!(!snapshot.drifted_from(
            &Some("1YNN".to_string()),
            &Some("DBABL~BVV".to_string())
        ));

        // Either signal differing is drift
        assert!(snapshot.drifted_from(&Some("1YYN".to_string()), &Some("DBABL~BVV".to_string())));
        assert!(snapshot.drifted_from(&Some("1YNN".to_string()), &None));

        // Signal disappearing is drift too
        let empty = ConsentSnapshot::default();
        assert!(empty.drifted_from(&Some("1YNN".to_string()), &None));
        assert!(!empty.drifted_from(&None, &None));
    }
}
