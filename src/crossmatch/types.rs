//! Core data model for the correlation engine.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::region::CoverageRegion;

/// Days between the MJD epoch (1858-11-17) and the Unix epoch.
const MJD_UNIX_EPOCH: f64 = 40_587.0;

/// Convert a UTC timestamp to Modified Julian Date.
pub fn datetime_to_mjd(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 86_400_000.0 + MJD_UNIX_EPOCH
}

/// Convert a Modified Julian Date back to a UTC timestamp (millisecond
/// precision).
pub fn mjd_to_datetime(mjd: f64) -> DateTime<Utc> {
    let millis = ((mjd - MJD_UNIX_EPOCH) * 86_400_000.0).round() as i64;
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// An active notice event with its current sky localization.
///
/// At most one lives in the cache per `event_id`; replacement is monotonic in
/// `dateobs`.
#[derive(Clone)]
pub struct SkyEvent {
    pub event_id: String,
    pub dateobs: DateTime<Utc>,
    pub alias: String,
    pub region: Arc<dyn CoverageRegion>,
}

impl SkyEvent {
    pub fn dateobs_mjd(&self) -> f64 {
        datetime_to_mjd(self.dateobs)
    }
}

impl fmt::Debug for SkyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkyEvent")
            .field("event_id", &self.event_id)
            .field("dateobs", &self.dateobs)
            .field("alias", &self.alias)
            .finish_non_exhaustive()
    }
}

/// A transient alert object as returned by the object query.
#[derive(Debug, Clone, Deserialize)]
pub struct TransientObject {
    #[serde(rename = "id")]
    pub object_id: String,
    pub ra: f64,
    pub dec: f64,
    #[serde(default)]
    pub classifications: Vec<Classification>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Classification {
    pub classification: String,
    #[serde(default)]
    pub probability: Option<f64>,
}

/// One photometry measurement. A missing or zero flux/flux_error pair means
/// the point is an upper limit, not a detection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PhotometryPoint {
    pub mjd: f64,
    #[serde(default)]
    pub flux: Option<f64>,
    #[serde(default, rename = "fluxerr")]
    pub flux_error: Option<f64>,
    #[serde(default)]
    pub mag: Option<f64>,
    #[serde(default)]
    pub magerr: Option<f64>,
    #[serde(default)]
    pub limiting_mag: Option<f64>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub instrument_name: Option<String>,
}

impl PhotometryPoint {
    /// Implied signal-to-noise ratio, when the point is a detection.
    pub fn snr(&self) -> Option<f64> {
        match (self.flux, self.flux_error) {
            (Some(flux), Some(err)) if flux != 0.0 && err != 0.0 => Some(flux / err),
            _ => None,
        }
    }

    pub fn is_detection(&self) -> bool {
        self.snr().is_some()
    }
}

/// The trailing slice of an object's photometry timeline that qualified it:
/// the single most recent non-detection preceding the detection run, followed
/// by the detections in chronological order.
///
/// `detections` is never empty when emitted by the detection filter.
#[derive(Debug, Clone)]
pub struct FilteredDetectionSet {
    pub last_non_detection: Option<PhotometryPoint>,
    pub detections: Vec<PhotometryPoint>,
}

impl FilteredDetectionSet {
    /// Full qualified timeline in chronological order, non-detection first.
    pub fn timeline(&self) -> Vec<&PhotometryPoint> {
        self.last_non_detection
            .iter()
            .chain(self.detections.iter())
            .collect()
    }
}

/// Per-loop high-water marks: the wall-clock floor of the next object query
/// and the MJD boundary below which photometry has already been evaluated.
#[derive(Debug, Clone, Copy)]
pub struct ProcessingCursor {
    pub object_query_floor: DateTime<Utc>,
    pub processed_mjd: f64,
}

impl ProcessingCursor {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            object_query_floor: start,
            processed_mjd: datetime_to_mjd(start),
        }
    }

    /// Advance both marks to the pre-query timestamp of a completed pass.
    /// Cursors only move forward.
    pub fn advance(&mut self, pre_query: DateTime<Utc>) {
        if pre_query > self.object_query_floor {
            self.object_query_floor = pre_query;
        }
        self.processed_mjd = self.processed_mjd.max(datetime_to_mjd(pre_query));
    }
}
