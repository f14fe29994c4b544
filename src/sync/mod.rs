/// Sync protocol client
///
/// Builds the outbound resolution request, issues it over the transport
/// boundary, and parses the structured response. Transport failures and
/// non-JSON bodies never escalate: the caller resolves with whatever identity
/// it already has in hand.
use crate::config::CLIENT_VERSION;
use crate::consent::ConsentSnapshot;
use crate::error::{EngineError, EngineResult};
use crate::identity::records::{FirstPartyRecord, PartnerRecord};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Protocol action tag
const PROTOCOL_AT: u32 = 39;
/// Protocol type tag
const PROTOCOL_PT: u32 = 17;
/// Protocol data-provider namespace
const PROTOCOL_DPN: u32 = 1;
/// Type tag applied to a prior id when the caller supplies none
const PRIOR_ID_TYPE_DEFAULT: i64 = 2;

/// One outbound resolution request
pub struct SyncRequest<'a> {
    pub endpoint: &'a str,
    pub partner_id: i64,
    pub first_party: &'a FirstPartyRecord,
    pub partner: &'a PartnerRecord,
    pub consent: &'a ConsentSnapshot,
    /// Cached device client-hints blob, if one has been resolved
    pub hints: Option<&'a str>,
    /// Caller prior-id hint, used only until the server assigns a pid
    pub prior_id: Option<&'a str>,
    pub prior_id_type: Option<i64>,
    /// Extension parameters appended verbatim
    pub extra_params: &'a [(String, String)],
}

impl SyncRequest<'_> {
    /// Render the idempotent GET URL, percent-encoding every value
    pub fn to_url(&self) -> String {
        let mut pairs: Vec<(&str, String)> = vec![
            ("at", PROTOCOL_AT.to_string()),
            ("pt", PROTOCOL_PT.to_string()),
            ("dpn", PROTOCOL_DPN.to_string()),
            ("dpi", self.partner_id.to_string()),
        ];

        // Prior server-assigned id wins over the caller hint
        let prior = self
            .first_party
            .pid
            .as_deref()
            .or(self.prior_id);
        if let Some(prior) = prior {
            let id_type = self.prior_id_type.unwrap_or(PRIOR_ID_TYPE_DEFAULT);
            pairs.push(("iiqidtype", id_type.to_string()));
            pairs.push(("iiqpcid", prior.to_string()));
        }

        if let Some(pcid) = &self.first_party.pcid {
            pairs.push(("pcid", pcid.clone()));
        }
        if let Some(pcid_date) = self.first_party.pcid_date {
            pairs.push(("pcidDate", pcid_date.to_string()));
        }
        pairs.push(("cttl", self.first_party.cttl.to_string()));
        if let Some(rrtt) = self.partner.rrtt {
            pairs.push(("rrtt", rrtt.to_string()));
        }

        if let Some(usp) = &self.consent.us_privacy {
            pairs.push(("us_privacy", usp.clone()));
        }
        if let Some(gpp) = &self.consent.gpp_string {
            pairs.push(("gpp", gpp.clone()));
        }
        if let Some(applies) = self.consent.gpp_applies {
            pairs.push(("gpi", if applies { "1" } else { "0" }.to_string()));
        }

        if let Some(hints) = self.hints {
            pairs.push(("uh", hints.to_string()));
        }

        pairs.push(("jsver", CLIENT_VERSION.to_string()));
        pairs.push(("group", self.first_party.group.label().to_string()));

        let mut query: Vec<String> = pairs
            .iter()
            .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
            .collect();

        // Extension parameters travel untouched
        for (key, value) in self.extra_params {
            query.push(format!("{}={}", key, value));
        }

        format!("{}?{}", self.endpoint, query.join("&"))
    }
}

/// Structured server response; every field is optional and unrecognized
/// fields are ignored
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncResponse {
    /// Cache TTL in ms
    pub cttl: Option<i64>,
    /// Termination cause
    pub tc: Option<i64>,
    #[serde(rename = "isOptedOut")]
    pub is_opted_out: Option<bool>,
    /// Server-assigned persistent id
    pub pid: Option<String>,
    /// Local-storage permission; false clears the cached identity
    pub ls: Option<bool>,
    /// Identity payload: object, bare string, or empty string
    pub data: Option<Value>,
    pub ct: Option<i64>,
    pub sid: Option<String>,
}

/// Parse a response body; a non-JSON body is treated as an empty envelope
pub fn parse_response(body: &str) -> SyncResponse {
    match serde_json::from_str(body) {
        Ok(response) => response,
        Err(e) => {
            debug!("Sync response body is not JSON, treating as empty: {}", e);
            SyncResponse::default()
        }
    }
}

/// Transport boundary for the sync request
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue a GET with credentials included and return the body
    async fn get(&self, url: &str) -> EngineResult<String>;
}

/// reqwest-backed transport; the cookie store carries credentials across
/// requests to the resolution server
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .cookie_store(true)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| EngineError::Transport(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> EngineResult<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::Transport(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EngineError::Transport(format!(
                "resolution server returned {}",
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| EngineError::Transport(format!("failed to read body: {}", e)))
    }
}
