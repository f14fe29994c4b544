/// Identity state machine
///
/// Owns the two persisted records, decides cache validity, triggers
/// re-resolution through the sync protocol client, and applies server
/// responses. Delivery always goes through the per-call arbiter, so the
/// caller sees exactly one result within the configured budget.
use crate::config::{EngineConfig, PartnerConfig};
use crate::consent::{ConsentSnapshot, ConsentSource};
use crate::error::EngineResult;
use crate::hints::{self, HintsProvider};
use crate::identity::arbiter::{Arbiter, ResolveCallback};
use crate::identity::records::{
    invalidate, now_ms, Cohort, FirstPartyRecord, PartnerRecord, Resolution, ResolvedIdentity,
    DEFAULT_CTTL_MS, INVALID_ID,
};
use crate::storage::{Backend, DualStore};
use crate::sync::{parse_response, HttpTransport, SyncRequest, SyncResponse, Transport};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Termination cause signaling a hard opt-out
const TC_HARD_OPT_OUT: i64 = 41;

/// The identity resolution engine
///
/// Cheap to clone; all state is shared. One engine serves any number of
/// partners and resolution calls.
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    store: DualStore,
    consent: Arc<dyn ConsentSource>,
    transport: Arc<dyn Transport>,
    hints_provider: Option<Arc<dyn HintsProvider>>,
    /// Per-partner single-flight locks: concurrent callers for the same
    /// partner serialize instead of issuing duplicate requests
    flights: Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>>,
}

impl Engine {
    /// Create an engine with the standard HTTP transport
    pub async fn new(config: EngineConfig, consent: Arc<dyn ConsentSource>) -> EngineResult<Self> {
        let store = DualStore::open(&config.storage).await?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.user_agent)?);
        Ok(Self::with_parts(config, store, consent, transport))
    }

    /// Assemble an engine from already-built collaborators (tests, embedders)
    pub fn with_parts(
        config: EngineConfig,
        store: DualStore,
        consent: Arc<dyn ConsentSource>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            store,
            consent,
            transport,
            hints_provider: None,
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attach a client-hints probe
    pub fn with_hints(mut self, provider: Arc<dyn HintsProvider>) -> Self {
        self.hints_provider = Some(provider);
        self
    }

    /// Resolve an identity for the given partner configuration
    pub async fn resolve(&self, partner: PartnerConfig) -> Resolution {
        self.resolve_with(partner, None).await
    }

    /// Resolve, additionally firing `callback` exactly once at delivery
    pub async fn resolve_with(
        &self,
        partner: PartnerConfig,
        callback: Option<ResolveCallback>,
    ) -> Resolution {
        let (arbiter, rx) = Arbiter::new(callback);

        // Configuration errors short-circuit with an empty identity and
        // never reach the network
        let partner_id = match partner.valid_partner_id() {
            Ok(id) => id,
            Err(reason) => {
                warn!("Resolution short-circuited: {}", reason);
                arbiter.deliver(Resolution::empty(), Cohort::NotYetDefined);
                return rx.await.unwrap_or_else(|_| Resolution::empty());
            }
        };

        if partner.browser_blacklisted() {
            debug!("Browser matched partner {} blacklist", partner_id);
            arbiter.deliver(Resolution::Blacklisted, Cohort::Blacklisted);
            return rx.await.unwrap_or(Resolution::Blacklisted);
        }

        let flight = self.flight_lock(partner_id);
        let guard = flight.lock_owned().await;

        let allowed = Backend::parse_list(&partner.enabled_backends);

        // The current call only ever reads hints cached by a past probe
        let hints_blob = hints::cached_hints(&self.store, &allowed).await;
        if hints_blob.is_none() {
            if let Some(provider) = &self.hints_provider {
                hints::spawn_probe(Arc::clone(provider), self.store.clone(), allowed.clone());
            }
        }

        // First-party record: create on first visit, backfill a missing
        // creation date otherwise
        let mut first_party = match FirstPartyRecord::load(&self.store, &allowed).await {
            Some(mut record) => {
                let mut dirty = false;
                if record.pcid.is_none() {
                    record.pcid = Some(uuid::Uuid::new_v4().to_string());
                    record.pcid_date = Some(now_ms());
                    dirty = true;
                } else if record.pcid_date.is_none() {
                    record.pcid_date = Some(now_ms());
                    dirty = true;
                }
                if dirty {
                    record.persist(&self.store, &allowed).await;
                }
                record
            }
            None => {
                debug!("First visit, creating first-party record");
                let record = FirstPartyRecord::fresh();
                record.persist(&self.store, &allowed).await;
                record
            }
        };

        // Partner record: a request left in flight by a previous attempt is
        // treated as abandoned
        let mut partner_record = PartnerRecord::load(&self.store, partner_id, &allowed).await;
        if partner_record.wsrvcll {
            partner_record.wsrvcll = false;
            partner_record
                .persist(&self.store, partner_id, &allowed)
                .await;
        }

        let mut identity = partner_record.decode_identity();

        let consent = self.consent.snapshot().await;
        let now = now_ms();
        let cache_invalid = first_party.cttl <= 0
            || now - first_party.date > first_party.cttl
            || consent.drifted_from(&first_party.uspapi_value, &first_party.gpp_string_value);

        let mut needs_sync = false;
        if cache_invalid {
            debug!(
                "Cached resolution for partner {} is invalid, re-resolving",
                partner_id
            );
            invalidate(&mut first_party, &mut partner_record);
            identity = ResolvedIdentity::default();
            first_party.persist(&self.store, &allowed).await;
            partner_record
                .persist(&self.store, partner_id, &allowed)
                .await;
            needs_sync = true;
        }

        if !needs_sync {
            // Opt-out, the control cohort, and a plain cache hit all resolve
            // with what is in hand; the arbiter forces empty for the control
            // cohort
            arbiter.deliver(Resolution::Identity(identity), first_party.group);
            return rx.await.unwrap_or_else(|_| Resolution::empty());
        }

        // The control cohort resolves right away; the round trip below still
        // runs so the persisted state converges, guarded against re-delivery
        if first_party.group == Cohort::WithoutIiq || !identity.is_empty() {
            arbiter.deliver(Resolution::Identity(identity.clone()), first_party.group);
        }

        let budget = Duration::from_millis(
            partner
                .timeout_ms
                .unwrap_or(self.config.default_timeout_ms),
        );
        arbiter.arm_timeout(budget, identity, first_party.group);

        partner_record.wsrvcll = true;
        partner_record
            .persist(&self.store, partner_id, &allowed)
            .await;

        let engine = self.clone();
        let sync_arbiter = arbiter.clone();
        tokio::spawn(async move {
            engine
                .run_sync(
                    partner,
                    partner_id,
                    first_party,
                    partner_record,
                    consent,
                    hints_blob,
                    allowed,
                    sync_arbiter,
                )
                .await;
            drop(guard);
        });

        rx.await.unwrap_or_else(|_| Resolution::empty())
    }

    /// Issue the sync request and reconcile its response
    ///
    /// Runs to completion even when the timeout already delivered, so the
    /// persisted records stay correct; the arbiter guard prevents a second
    /// delivery.
    #[allow(clippy::too_many_arguments)]
    async fn run_sync(
        &self,
        partner: PartnerConfig,
        partner_id: i64,
        mut first_party: FirstPartyRecord,
        mut partner_record: PartnerRecord,
        consent: ConsentSnapshot,
        hints_blob: Option<String>,
        allowed: Vec<Backend>,
        arbiter: Arbiter,
    ) {
        let url = SyncRequest {
            endpoint: &self.config.endpoint,
            partner_id,
            first_party: &first_party,
            partner: &partner_record,
            consent: &consent,
            hints: hints_blob.as_deref(),
            prior_id: partner.prior_id.as_deref(),
            prior_id_type: partner.prior_id_type,
            extra_params: &partner.extra_params,
        }
        .to_url();

        let started = Instant::now();
        let body = match self.transport.get(&url).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Sync request for partner {} failed: {}", partner_id, e);
                // Degrade to whatever identity is already in hand
                arbiter.deliver(
                    Resolution::Identity(partner_record.decode_identity()),
                    first_party.group,
                );
                return;
            }
        };
        let rtt = started.elapsed().as_millis() as i64;

        let response = parse_response(&body);
        let identity = apply_response(
            &mut first_party,
            &mut partner_record,
            &response,
            rtt,
            &consent,
        );

        first_party.persist(&self.store, &allowed).await;
        partner_record
            .persist(&self.store, partner_id, &allowed)
            .await;

        arbiter.deliver(Resolution::Identity(identity), first_party.group);
    }

    fn flight_lock(&self, partner_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut flights = self.flights.lock().unwrap();
        // Locks no active flight holds are stale; pruning them here keeps the
        // map bounded by the number of concurrent flights
        flights.retain(|_, lock| Arc::strong_count(lock) > 1);
        flights
            .entry(partner_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Merge a server response into the two records; recognized fields only
///
/// Returns the resolved identity the response yields. Both records reflect
/// the response afterwards but are not yet persisted.
pub fn apply_response(
    first_party: &mut FirstPartyRecord,
    partner_record: &mut PartnerRecord,
    response: &SyncResponse,
    rtt: i64,
    consent: &ConsentSnapshot,
) -> ResolvedIdentity {
    first_party.cttl = response.cttl.unwrap_or(DEFAULT_CTTL_MS);
    first_party.date = now_ms();
    first_party.uspapi_value = consent.us_privacy.clone();
    first_party.gpp_string_value = consent.gpp_string.clone();
    partner_record.rrtt = Some(rtt);

    if let Some(ct) = response.ct {
        partner_record.ct = Some(ct);
    }
    if let Some(sid) = &response.sid {
        partner_record.site_id = Some(sid.clone());
    }
    // Once issued, a pid is only ever replaced, never cleared
    if let Some(pid) = &response.pid {
        first_party.pid = Some(pid.clone());
    }

    let mut cleared = false;
    if let Some(tc) = response.tc {
        partner_record.termination_cause = Some(tc);
        if tc == TC_HARD_OPT_OUT {
            first_party.group = Cohort::WithoutIiq;
            cleared = true;
        } else if first_party.group == Cohort::NotYetDefined {
            first_party.group = Cohort::WithIiq;
        }
    }
    if response.is_opted_out == Some(true) {
        first_party.is_opted_out = true;
        first_party.group = Cohort::OptOut;
        cleared = true;
    }
    if response.ls == Some(false) {
        cleared = true;
    }
    if cleared {
        partner_record.clear_data();
        return ResolvedIdentity::default();
    }

    match &response.data {
        Some(Value::String(s)) if s.is_empty() => {
            partner_record.data = Value::String(INVALID_ID.to_string());
            partner_record.eidl = 0;
            ResolvedIdentity::default()
        }
        Some(Value::String(s)) => {
            // A bare string is a single-entry identity
            let identity = ResolvedIdentity {
                eids: vec![Value::String(s.clone())],
            };
            partner_record.encode_identity(&identity);
            identity
        }
        Some(data @ Value::Object(_)) => {
            let identity: ResolvedIdentity =
                serde_json::from_value(data.clone()).unwrap_or_default();
            if identity.is_empty() {
                ResolvedIdentity::default()
            } else {
                partner_record.encode_identity(&identity);
                identity
            }
        }
        _ => ResolvedIdentity::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::StaticConsent;
    use crate::storage::{CookieBackend, DurableBackend};
    use async_trait::async_trait;
    use serde_json::json;

    struct EmptyTransport;

    #[async_trait]
    impl Transport for EmptyTransport {
        async fn get(&self, _url: &str) -> EngineResult<String> {
            Ok("{}".to_string())
        }
    }

    async fn create_test_engine() -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let durable = DurableBackend::open("sqlite::memory:").await.unwrap();
        let cookie = CookieBackend::new(dir.path().join("jar.json"));
        let engine = Engine::with_parts(
            EngineConfig::default(),
            DualStore::from_parts(durable, cookie),
            Arc::new(StaticConsent::default()),
            Arc::new(EmptyTransport),
        );
        (engine, dir)
    }

    fn fresh_pair() -> (FirstPartyRecord, PartnerRecord) {
        (FirstPartyRecord::fresh(), PartnerRecord::default())
    }

    fn response(raw: serde_json::Value) -> SyncResponse {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_cttl_defaults_to_one_day() {
        let (mut fp, mut pr) = fresh_pair();
        apply_response(&mut fp, &mut pr, &response(json!({})), 42, &ConsentSnapshot::default());

        assert_eq!(fp.cttl, DEFAULT_CTTL_MS);
        assert!(fp.date > 0);
        assert_eq!(pr.rrtt, Some(42));
    }

    #[test]
    fn test_tc_41_forces_control_cohort_and_clears_identity() {
        let (mut fp, mut pr) = fresh_pair();
        pr.encode_identity(&ResolvedIdentity {
            eids: vec![json!("stale")],
        });

        let identity = apply_response(
            &mut fp,
            &mut pr,
            &response(json!({"tc": 41, "data": {"eids": ["fresh"]}})),
            10,
            &ConsentSnapshot::default(),
        );

        assert!(identity.is_empty());
        assert_eq!(fp.group, Cohort::WithoutIiq);
        assert_eq!(pr.termination_cause, Some(41));
        assert_eq!(pr.data, json!({}));
        assert_eq!(pr.eidl, -1);
    }

    #[test]
    fn test_other_tc_assigns_with_iiq_once() {
        let (mut fp, mut pr) = fresh_pair();
        apply_response(&mut fp, &mut pr, &response(json!({"tc": 12})), 10, &ConsentSnapshot::default());
        assert_eq!(fp.group, Cohort::WithIiq);

        // An already-decided cohort is left alone
        fp.group = Cohort::OptOut;
        apply_response(&mut fp, &mut pr, &response(json!({"tc": 12})), 10, &ConsentSnapshot::default());
        assert_eq!(fp.group, Cohort::OptOut);
    }

    #[test]
    fn test_opt_out_response() {
        let (mut fp, mut pr) = fresh_pair();
        let identity = apply_response(
            &mut fp,
            &mut pr,
            &response(json!({"isOptedOut": true, "data": {"eids": ["x"]}})),
            10,
            &ConsentSnapshot::default(),
        );

        assert!(identity.is_empty());
        assert_eq!(fp.group, Cohort::OptOut);
        assert!(fp.is_opted_out);
        assert_eq!(pr.data, json!({}));
    }

    #[test]
    fn test_ls_false_clears_identity_without_changing_cohort() {
        let (mut fp, mut pr) = fresh_pair();
        fp.group = Cohort::WithIiq;

        let identity = apply_response(
            &mut fp,
            &mut pr,
            &response(json!({"ls": false, "data": {"eids": ["x"]}})),
            10,
            &ConsentSnapshot::default(),
        );

        assert!(identity.is_empty());
        assert_eq!(fp.group, Cohort::WithIiq);
        assert!(!fp.is_opted_out);
    }

    #[test]
    fn test_empty_data_string_becomes_sentinel() {
        let (mut fp, mut pr) = fresh_pair();
        let identity = apply_response(
            &mut fp,
            &mut pr,
            &response(json!({"data": "", "ls": true})),
            10,
            &ConsentSnapshot::default(),
        );

        assert!(identity.is_empty());
        assert_eq!(pr.data, json!(INVALID_ID));
        // Decoding the sentinel later yields an empty identity
        assert!(pr.decode_identity().is_empty());
    }

    #[test]
    fn test_bare_string_data_is_wrapped() {
        let (mut fp, mut pr) = fresh_pair();
        let identity = apply_response(
            &mut fp,
            &mut pr,
            &response(json!({"data": "abc123"})),
            10,
            &ConsentSnapshot::default(),
        );

        assert_eq!(identity.eids, vec![json!("abc123")]);
        // Persisted ciphertext-encoded and recoverable
        assert!(matches!(pr.data, Value::String(_)));
        assert_eq!(pr.decode_identity(), identity);
        assert_eq!(pr.eidl, 1);
    }

    #[test]
    fn test_object_data_becomes_identity_and_is_encrypted_at_rest() {
        let (mut fp, mut pr) = fresh_pair();
        let identity = apply_response(
            &mut fp,
            &mut pr,
            &response(json!({"cttl": 7200000, "pid": "srv-9", "sid": "s1", "ct": 3,
                             "data": {"eids": [{"source": "polaris-id.net", "uids": [{"id": "u1"}]}]}})),
            25,
            &ConsentSnapshot::default(),
        );

        assert_eq!(identity.eids.len(), 1);
        assert_eq!(fp.cttl, 7_200_000);
        assert_eq!(fp.pid, Some("srv-9".to_string()));
        assert_eq!(pr.site_id, Some("s1".to_string()));
        assert_eq!(pr.ct, Some(3));
        assert_eq!(pr.eidl, 1);
        // data at rest is ciphertext, not the raw payload
        let raw = serde_json::to_string(&pr).unwrap();
        assert!(!raw.contains("polaris-id.net"));
        assert_eq!(pr.decode_identity(), identity);
    }

    #[tokio::test]
    async fn test_stale_flight_locks_are_pruned() {
        let (engine, _dir) = create_test_engine().await;

        {
            let lock = engine.flight_lock(1);
            let _guard = lock.lock_owned().await;

            // A lock held by an active flight survives other lookups
            let _ = engine.flight_lock(2);
            assert_eq!(engine.flights.lock().unwrap().len(), 2);
        }

        // Once every flight has released its lock, the next lookup prunes
        let _ = engine.flight_lock(3);
        let flights = engine.flights.lock().unwrap();
        assert!(flights.contains_key(&3));
        assert!(!flights.contains_key(&1));
        assert!(!flights.contains_key(&2));
        assert_eq!(flights.len(), 1);
    }

    #[test]
    fn test_consent_snapshot_is_recorded_for_drift_detection() {
        let (mut fp, mut pr) = fresh_pair();
        let consent = ConsentSnapshot {
            us_privacy: Some("1YNN".to_string()),
            gpp_string: Some("DBABL~X".to_string()),
            gpp_applies: Some(true),
        };
        apply_response(&mut fp, &mut pr, &response(json!({})), 10, &consent);

        assert_eq!(fp.uspapi_value, Some("1YNN".to_string()));
        assert_eq!(fp.gpp_string_value, Some("DBABL~X".to_string()));
        assert!(!consent.drifted_from(&fp.uspapi_value, &fp.gpp_string_value));
    }
}
