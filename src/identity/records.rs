/// Persisted identity records and the resolved-identity value
///
/// Two records live in the dual-backend store: the first-party record (one
/// per browser) and the partner resolution record (one per configured
/// partner). Both are JSON text at rest; the partner record's `data` field is
/// additionally passed through the cache cipher.
use crate::crypto;
use crate::storage::{Backend, DualStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Storage key of the first-party identity record
pub const FIRST_PARTY_KEY: &str = "_pid_fpd";

/// Sentinel stored in place of ciphertext when the server returns an empty
/// data string
pub const INVALID_ID: &str = "INVALID_ID";

/// Cache TTL applied when the server omits `cttl` (one day)
pub const DEFAULT_CTTL_MS: i64 = 86_400_000;

/// Storage key of a partner resolution record
pub fn partner_key(partner_id: i64) -> String {
    format!("{}_{}", FIRST_PARTY_KEY, partner_id)
}

/// Current time as epoch milliseconds
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Experiment/consent cohort a browser is assigned to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cohort {
    /// No server decision observed yet
    #[default]
    #[serde(rename = "U")]
    NotYetDefined,
    /// Identity is shared with partners
    #[serde(rename = "A")]
    WithIiq,
    /// Control group: identity is never shared, resolution yields empty
    #[serde(rename = "B")]
    WithoutIiq,
    /// Visitor opted out
    #[serde(rename = "O")]
    OptOut,
    /// Browser matched the partner blacklist
    #[serde(rename = "L")]
    Blacklisted,
}

impl Cohort {
    /// Wire label reported to the resolution server
    pub fn label(&self) -> &'static str {
        match self {
            Cohort::NotYetDefined => "U",
            Cohort::WithIiq => "A",
            Cohort::WithoutIiq => "B",
            Cohort::OptOut => "O",
            Cohort::Blacklisted => "L",
        }
    }
}

/// First-party identity record, one per browser
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirstPartyRecord {
    /// Randomly generated first-party id; immutable once set
    pub pcid: Option<String>,
    /// Epoch ms when `pcid` was created or first observed missing
    #[serde(rename = "pcidDate")]
    pub pcid_date: Option<i64>,
    pub group: Cohort,
    /// Server-supplied cache TTL in ms; 0 forces re-resolution
    pub cttl: i64,
    /// Epoch ms of the last successful cache refresh
    pub date: i64,
    /// Consent signals observed at the last refresh, for drift detection
    pub uspapi_value: Option<String>,
    pub gpp_string_value: Option<String>,
    #[serde(rename = "isOptedOut")]
    pub is_opted_out: bool,
    /// Server-assigned persistent id; never cleared once issued
    pub pid: Option<String>,
}

impl Default for FirstPartyRecord {
    fn default() -> Self {
        Self {
            pcid: None,
            pcid_date: None,
            group: Cohort::NotYetDefined,
            cttl: 0,
            date: 0,
            uspapi_value: None,
            gpp_string_value: None,
            is_opted_out: false,
            pid: None,
        }
    }
}

impl FirstPartyRecord {
    /// A freshly created record for a first-visit browser
    pub fn fresh() -> Self {
        Self {
            pcid: Some(uuid::Uuid::new_v4().to_string()),
            pcid_date: Some(now_ms()),
            ..Self::default()
        }
    }

    /// Load the record; absent or undecodable state reads as `None`
    pub async fn load(store: &DualStore, allowed: &[Backend]) -> Option<Self> {
        let raw = store.read(FIRST_PARTY_KEY, allowed).await?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("First-party record is undecodable, treating as absent: {}", e);
                None
            }
        }
    }

    /// Persist the record; storage failure is logged and swallowed
    pub async fn persist(&self, store: &DualStore, allowed: &[Backend]) {
        match serde_json::to_string(self) {
            Ok(raw) => store.write(FIRST_PARTY_KEY, &raw, allowed).await,
            Err(e) => warn!("First-party record failed to serialize: {}", e),
        }
    }
}

/// Partner resolution record, one per configured partner id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartnerRecord {
    /// `{}` when unset, the `INVALID_ID` sentinel, or ciphertext over the
    /// JSON-serialized resolved identity
    pub data: Value,
    /// Last known identity-entry count; -1 when invalidated
    pub eidl: i64,
    /// Request-in-flight flag; set before issuing, cleared on next load
    pub wsrvcll: bool,
    #[serde(rename = "terminationCause")]
    pub termination_cause: Option<i64>,
    pub ct: Option<i64>,
    #[serde(rename = "siteId")]
    pub site_id: Option<String>,
    /// Client-measured request round-trip time in ms
    pub rrtt: Option<i64>,
}

impl Default for PartnerRecord {
    fn default() -> Self {
        Self {
            data: Value::Object(Default::default()),
            eidl: -1,
            wsrvcll: false,
            termination_cause: None,
            ct: None,
            site_id: None,
            rrtt: None,
        }
    }
}

impl PartnerRecord {
    /// Load the partner record; absence or decode failure yields the default
    pub async fn load(store: &DualStore, partner_id: i64, allowed: &[Backend]) -> Self {
        let Some(raw) = store.read(&partner_key(partner_id), allowed).await else {
            return Self::default();
        };
        match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("Partner record is undecodable, treating as absent: {}", e);
                Self::default()
            }
        }
    }

    /// Persist the record; storage failure is logged and swallowed
    pub async fn persist(&self, store: &DualStore, partner_id: i64, allowed: &[Backend]) {
        match serde_json::to_string(self) {
            Ok(raw) => store.write(&partner_key(partner_id), &raw, allowed).await,
            Err(e) => warn!("Partner record failed to serialize: {}", e),
        }
    }

    /// Blank the cached resolution (`data = {}`, `eidl = -1`)
    pub fn clear_data(&mut self) {
        self.data = Value::Object(Default::default());
        self.eidl = -1;
    }

    /// Decode the cached `data` field into a working resolved identity
    ///
    /// Ciphertext is decrypted and parsed; any failure (foreign ciphertext,
    /// the `INVALID_ID` sentinel, malformed JSON) yields an empty identity,
    /// never an error.
    pub fn decode_identity(&self) -> ResolvedIdentity {
        match &self.data {
            Value::String(s) if !s.is_empty() => {
                let decoded = crypto::decrypt(s)
                    .and_then(|plain| Ok(serde_json::from_str::<ResolvedIdentity>(&plain)?));
                match decoded {
                    Ok(identity) => identity,
                    Err(e) => {
                        debug!("Cached partner data is undecodable: {}", e);
                        ResolvedIdentity::default()
                    }
                }
            }
            Value::Object(map) if !map.is_empty() => {
                serde_json::from_value(self.data.clone()).unwrap_or_default()
            }
            _ => ResolvedIdentity::default(),
        }
    }

    /// Store a resolved identity as ciphertext and record its entry count
    pub fn encode_identity(&mut self, identity: &ResolvedIdentity) {
        match serde_json::to_string(identity) {
            Ok(plain) => {
                self.data = Value::String(crypto::encrypt(&plain));
                self.eidl = identity.eids.len() as i64;
            }
            Err(e) => {
                warn!("Resolved identity failed to serialize: {}", e);
                self.clear_data();
            }
        }
    }
}

/// The value ultimately handed to the caller: a list of identity entries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    #[serde(default)]
    pub eids: Vec<Value>,
}

impl ResolvedIdentity {
    pub fn is_empty(&self) -> bool {
        self.eids.is_empty()
    }
}

/// Outcome of a resolution call
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A resolved (possibly empty) identity
    Identity(ResolvedIdentity),
    /// The browser matched the partner's blacklist; no resolution attempted
    Blacklisted,
}

impl Resolution {
    pub fn empty() -> Self {
        Resolution::Identity(ResolvedIdentity::default())
    }

    /// The identity payload, empty for the blacklisted marker
    pub fn identity(&self) -> ResolvedIdentity {
        match self {
            Resolution::Identity(identity) => identity.clone(),
            Resolution::Blacklisted => ResolvedIdentity::default(),
        }
    }
}

/// Invalidate both records as one operation
///
/// The first-party TTL reset and the partner data blanking always travel
/// together so a later change cannot reset one without the other. Persisting
/// the two keys remains sequential, not transactional.
pub fn invalidate(first_party: &mut FirstPartyRecord, partner: &mut PartnerRecord) {
    first_party.cttl = 0;
    first_party.is_opted_out = false;
    partner.clear_data();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fresh_record_shape() {
        let record = FirstPartyRecord::fresh();
        let pcid = record.pcid.as_deref().unwrap();

        // UUID-v4-shaped: 36 chars, hyphens at the standard offsets
        assert_eq!(pcid.len(), 36);
        assert!(uuid::Uuid::parse_str(pcid).is_ok());
        assert!(record.pcid_date.is_some());
        assert_eq!(record.group, Cohort::NotYetDefined);
        assert_eq!(record.cttl, 0);
    }

    #[test]
    fn test_wire_field_names() {
        let mut record = FirstPartyRecord::fresh();
        record.is_opted_out = true;
        let raw = serde_json::to_value(&record).unwrap();

        assert!(raw.get("pcidDate").is_some());
        assert_eq!(raw.get("isOptedOut"), Some(&json!(true)));
        assert_eq!(raw.get("group"), Some(&json!("U")));

        let record = PartnerRecord::default();
        let raw = serde_json::to_value(&record).unwrap();
        assert_eq!(raw.get("eidl"), Some(&json!(-1)));
        assert_eq!(raw.get("wsrvcll"), Some(&json!(false)));
        assert_eq!(raw.get("data"), Some(&json!({})));
    }

    #[test]
    fn test_decode_identity_round_trip() {
        let identity = ResolvedIdentity {
            eids: vec![json!({"source": "polaris-id.net", "uids": [{"id": "X1"}]})],
        };

        let mut record = PartnerRecord::default();
        record.encode_identity(&identity);

        assert!(matches!(record.data, Value::String(_)));
        assert_eq!(record.eidl, 1);
        assert_eq!(record.decode_identity(), identity);
    }

    #[test]
    fn test_decode_identity_tolerates_garbage() {
        let mut record = PartnerRecord::default();

        // Unset
        assert!(record.decode_identity().is_empty());

        // The sentinel
        record.data = Value::String(INVALID_ID.to_string());
        assert!(record.decode_identity().is_empty());

        // Foreign ciphertext
        record.data = Value::String("AAAABBBBCCCCDDDD".to_string());
        assert!(record.decode_identity().is_empty());

        // Plaintext-object representation is accepted directly
        record.data = json!({"eids": ["abc123"]});
        assert_eq!(record.decode_identity().eids, vec![json!("abc123")]);
    }

    #[test]
    fn test_invalidate_touches_both_records() {
        let mut fp = FirstPartyRecord::fresh();
        fp.cttl = 3_600_000;
        fp.is_opted_out = true;

        let mut pr = PartnerRecord::default();
        pr.encode_identity(&ResolvedIdentity {
            eids: vec![json!("x")],
        });

        invalidate(&mut fp, &mut pr);

        assert_eq!(fp.cttl, 0);
        assert!(!fp.is_opted_out);
        assert_eq!(pr.data, json!({}));
        assert_eq!(pr.eidl, -1);
    }

    #[test]
    fn test_cohort_labels() {
        assert_eq!(Cohort::NotYetDefined.label(), "U");
        assert_eq!(Cohort::WithIiq.label(), "A");
        assert_eq!(Cohort::WithoutIiq.label(), "B");
        assert_eq!(Cohort::OptOut.label(), "O");
        assert_eq!(Cohort::Blacklisted.label(), "L");
        assert_eq!(serde_json::to_value(Cohort::WithoutIiq).unwrap(), json!("B"));
    }
}
