//! The admission/eviction engine (§3, §4.2): rule tiering, the reservation
//! request/response types, configuration, the purge loop, and the keeper
//! that ties them together.

pub mod config;
pub mod keeper;
pub mod purge;
pub mod request;
pub mod rules;

pub use config::QuotaKeeperConfiguration;
pub use keeper::QuotaKeeper;
pub use purge::PurgeResult;
pub use request::ReservationTx;
pub use rules::{Quota, QuotaRule, RuleDescription, RuleThresholds};
