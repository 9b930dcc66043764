//! Deduplication of regions for re-observed objects.
//!
//! The loop re-fetches full photometry for every object in the refresh window
//! on every pass, including objects it already notified on. This module
//! decides which cached regions are genuinely new for the current pass, so a
//! crossmatch is announced exactly once per new (photometry, region) pairing.

use super::types::{datetime_to_mjd, FilteredDetectionSet, SkyEvent};

/// Per-pass dedup decision input: the MJD below which photometry was already
/// evaluated (roughly one poll interval ago) and whether this is the first
/// pass since startup.
#[derive(Debug, Clone, Copy)]
pub struct DedupWindow {
    pub processed_mjd: f64,
    pub is_first_run: bool,
}

impl DedupWindow {
    /// Pick the regions that are new for this object on this pass.
    ///
    /// The most recent point is dropped first: it is the one that triggered
    /// the current pass and has not been evaluated yet. If nothing remains,
    /// or on the first pass, every region is a candidate. Otherwise the
    /// newest remaining point older than the cursor marks the
    /// already-processed boundary, and only regions whose `dateobs` lies
    /// strictly beyond it are returned; photometry older than one poll cycle
    /// was already evaluated against the region set active at that time. If
    /// no boundary can be established, all regions are conservatively
    /// treated as new.
    pub fn candidate_regions(
        &self,
        set: &FilteredDetectionSet,
        regions: &[SkyEvent],
    ) -> Vec<SkyEvent> {
        let timeline = set.timeline();
        if timeline.len() <= 1 || self.is_first_run {
            return regions.to_vec();
        }
        let history = &timeline[..timeline.len() - 1];

        let boundary = history
            .iter()
            .rev()
            .find(|p| p.mjd < self.processed_mjd)
            .map(|p| p.mjd);

        match boundary {
            Some(boundary_mjd) => regions
                .iter()
                .filter(|event| datetime_to_mjd(event.dateobs) > boundary_mjd)
                .cloned()
                .collect(),
            // Everything left is from this polling cycle: nothing has been
            // counted yet.
            None => regions.to_vec(),
        }
    }
}
