//! Detection-qualification filtering of raw photometry.

use super::types::{FilteredDetectionSet, PhotometryPoint};

/// Reduces an object's photometry to a qualifying detection set, or rejects
/// the object.
///
/// An object qualifies when its detection history holds at least one point at
/// or above the SNR threshold, and no such point predates the lookback floor:
/// a qualifying detection older than the floor means the source has been
/// shining since before the window of interest and is not a fresh transient.
/// The floor is inclusive, so a first detection at exactly `floor_mjd` keeps
/// the object.
#[derive(Debug, Clone, Copy)]
pub struct DetectionFilter {
    snr_threshold: f64,
    floor_mjd: f64,
}

impl DetectionFilter {
    pub fn new(snr_threshold: f64, floor_mjd: f64) -> Self {
        Self {
            snr_threshold,
            floor_mjd,
        }
    }

    /// Run the filter over one object's photometry (any order).
    ///
    /// Returns the trailing qualified slice of the timeline — the single most
    /// recent non-detection preceding the detection run, then the detections
    /// in chronological order — or `None` when the object is rejected.
    pub fn filter(&self, photometry: &[PhotometryPoint]) -> Option<FilteredDetectionSet> {
        let mut timeline: Vec<&PhotometryPoint> = photometry.iter().collect();
        timeline.sort_by(|a, b| a.mjd.total_cmp(&b.mjd));

        let mut detections: Vec<PhotometryPoint> = Vec::new();
        let mut last_non_detection: Option<PhotometryPoint> = None;
        let mut qualifies = false;

        for point in timeline.into_iter().rev() {
            match point.snr() {
                Some(snr) => {
                    // Any detection invalidates a non-detection remembered on
                    // its newer side; only the one just below the run counts.
                    last_non_detection = None;
                    detections.push(point.clone());
                    if snr >= self.snr_threshold {
                        if point.mjd < self.floor_mjd {
                            return None;
                        }
                        qualifies = true;
                    }
                }
                None => {
                    if last_non_detection.is_none() {
                        last_non_detection = Some(point.clone());
                    }
                }
            }
        }

        if !qualifies {
            return None;
        }
        detections.reverse();
        Some(FilteredDetectionSet {
            last_non_detection,
            detections,
        })
    }
}
