//! Admission control: token buckets, rule lookup, and idle reclamation.

mod backend;
mod bucket;
mod clock;
mod guard;
mod key;
mod limiter;
mod reclaim;
mod rules;
mod throttle;

pub use backend::AdmissionBackend;
pub use bucket::{Decision, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use guard::{Admission, AdmissionGuard, FaultPolicy, GuardSettings, Rejection, UNKNOWN_IDENTITY};
pub use key::{BucketKey, Scope};
pub use limiter::{Limiter, DEFAULT_IDLE_TTL};
pub use reclaim::{spawn_reclaimer, Reclaim};
pub use rules::{PathMatch, Rule, RuleConfig, RuleMatch, RuleTable, RuleTableConfig};
pub use throttle::CommandThrottle;
