/// Identity resolution core
///
/// The state machine over the two persisted records, the per-call delivery
/// arbiter, and the record types themselves.

pub mod arbiter;
pub mod engine;
pub mod records;

pub use arbiter::{Arbiter, ResolveCallback};
pub use engine::Engine;
pub use records::{
    Cohort, FirstPartyRecord, PartnerRecord, Resolution, ResolvedIdentity, FIRST_PARTY_KEY,
    INVALID_ID,
};
