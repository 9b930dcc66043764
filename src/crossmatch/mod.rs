//! Stateful correlation core.
//!
//! Correlates newly observed transient-alert objects against the currently
//! active sky-localization regions and decides when a crossmatch is worth
//! announcing. The pieces:
//!
//! - `cache` — TTL-bounded set of active regions, one live entry per event
//! - `detection` — reduces raw photometry to qualifying detection sets
//! - `dedup` — picks the regions that are genuinely new for a re-observed
//!   object, so each crossmatch is announced once
//! - `engine` — the polling state machine tying it together
//!
//! External collaborators (backend client, region construction, notification
//! delivery) stay behind traits; the core owns only its cache and cursors.

pub mod cache;
pub mod dedup;
pub mod detection;
pub mod engine;
pub mod types;

pub use cache::SkymapCache;
pub use dedup::DedupWindow;
pub use detection::DetectionFilter;
pub use engine::{Clock, CorrelationLoop, CycleStats, LoopSettings, LoopState, SystemClock};
pub use types::{
    datetime_to_mjd, mjd_to_datetime, FilteredDetectionSet, PhotometryPoint, ProcessingCursor,
    SkyEvent, TransientObject,
};
