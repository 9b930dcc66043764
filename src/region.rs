//! Sky-coverage regions built from probability-grid skymaps.
//!
//! A localization arrives as a HEALPix probability grid; the region keeps the
//! set of cells that together bound the configured cumulative probability and
//! answers point-containment queries in (ra, dec) degrees. Construction from
//! the wire format lives behind the `RegionBuilder` seam so the correlation
//! core never touches file formats.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::CrossmatchError;
use crate::fits;

/// An opaque sky region supporting point containment in degrees.
pub trait CoverageRegion: Send + Sync {
    fn contains(&self, ra_deg: f64, dec_deg: f64) -> bool;
}

/// Builds a coverage region from raw probability-grid bytes and a
/// cumulative-probability threshold.
pub trait RegionBuilder: Send + Sync {
    fn build(
        &self,
        grid_bytes: &[u8],
        cumulative_probability: f64,
    ) -> Result<Arc<dyn CoverageRegion>, CrossmatchError>;
}

/// One cell of a multi-order probability grid.
///
/// `uniq` is the standard HEALPix UNIQ encoding, `uniq = 4 * 4^order + ipix`
/// with nested-scheme `ipix`. `prob_density` is probability per steradian.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbabilityCell {
    pub uniq: u64,
    pub prob_density: f64,
}

impl ProbabilityCell {
    /// HEALPix order encoded in the UNIQ index. `None` below the minimum
    /// valid UNIQ value of 4 or beyond the maximum HEALPix depth of 29.
    pub fn order(&self) -> Option<u8> {
        if self.uniq < 4 {
            return None;
        }
        let order = ((self.uniq.ilog2() - 2) / 2) as u8;
        (order <= 29).then_some(order)
    }

    fn ipix(&self, order: u8) -> u64 {
        self.uniq - (1u64 << (2 * order as u64 + 2))
    }

    /// Cell area in steradians at this cell's order.
    fn area_sr(&self, order: u8) -> f64 {
        4.0 * std::f64::consts::PI / (12.0 * (1u64 << (2 * order as u64)) as f64)
    }
}

/// A credible region over a multi-order HEALPix grid.
///
/// Holds the selected cells grouped by order; containment hashes the query
/// point once per order present and binary-searches the cell list.
pub struct MultiOrderRegion {
    cells_by_order: BTreeMap<u8, Vec<u64>>,
}

impl MultiOrderRegion {
    /// Select the densest cells until the cumulative probability mass reaches
    /// `cumulative_probability` (the cell crossing the threshold is kept).
    ///
    /// Cells are ranked by probability density, so the result is the smallest
    /// sky area bounding the requested mass. Cells with a non-positive or
    /// non-finite density, or an invalid UNIQ index, are dropped.
    pub fn from_probability_cells(
        cells: Vec<ProbabilityCell>,
        cumulative_probability: f64,
    ) -> Self {
        let mut ranked: Vec<(u8, ProbabilityCell)> = cells
            .into_iter()
            .filter(|c| c.prob_density.is_finite() && c.prob_density > 0.0)
            .filter_map(|c| c.order().map(|order| (order, c)))
            .collect();
        ranked.sort_by(|a, b| b.1.prob_density.total_cmp(&a.1.prob_density));

        let mut cells_by_order: BTreeMap<u8, Vec<u64>> = BTreeMap::new();
        let mut cumulative = 0.0;
        for (order, cell) in ranked {
            cells_by_order
                .entry(order)
                .or_default()
                .push(cell.ipix(order));
            cumulative += cell.prob_density * cell.area_sr(order);
            if cumulative >= cumulative_probability {
                break;
            }
        }
        for pixels in cells_by_order.values_mut() {
            pixels.sort_unstable();
        }

        Self { cells_by_order }
    }

    /// Number of selected cells across all orders.
    pub fn cell_count(&self) -> usize {
        self.cells_by_order.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cells_by_order.is_empty()
    }
}

impl CoverageRegion for MultiOrderRegion {
    fn contains(&self, ra_deg: f64, dec_deg: f64) -> bool {
        let lon = ra_deg.rem_euclid(360.0).to_radians();
        let lat = dec_deg.clamp(-90.0, 90.0).to_radians();
        self.cells_by_order.iter().any(|(order, pixels)| {
            let pix = cdshealpix::nested::hash(*order, lon, lat);
            pixels.binary_search(&pix).is_ok()
        })
    }
}

/// Default builder: decodes a HEALPix probability-grid FITS file (multi-order
/// or nested fixed-resolution) into a [`MultiOrderRegion`].
pub struct SkymapRegionBuilder;

impl RegionBuilder for SkymapRegionBuilder {
    fn build(
        &self,
        grid_bytes: &[u8],
        cumulative_probability: f64,
    ) -> Result<Arc<dyn CoverageRegion>, CrossmatchError> {
        let cells = fits::read_probability_cells(grid_bytes)?;
        let region = MultiOrderRegion::from_probability_cells(cells, cumulative_probability);
        if region.is_empty() {
            return Err(CrossmatchError::MalformedResponse(
                "probability grid contains no usable cells".to_string(),
            ));
        }
        Ok(Arc::new(region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniq(order: u8, ipix: u64) -> u64 {
        (1u64 << (2 * order as u64 + 2)) + ipix
    }

    #[test]
    fn test_uniq_round_trip() {
        // Test: order/ipix survive the UNIQ encoding at several orders
        for order in [0u8, 1, 5, 12] {
            let cell = ProbabilityCell {
                uniq: uniq(order, 7 % (12 * (1u64 << (2 * order as u64)))),
                prob_density: 1.0,
            };
            assert_eq!(cell.order(), Some(order));
        }
        assert_eq!(ProbabilityCell { uniq: 3, prob_density: 1.0 }.order(), None);
    }

    #[test]
    fn test_region_contains_its_own_cell() {
        // Test: a region built from the cell a point hashes into contains
        // that point, and not its antipode
        let order = 4u8;
        let (ra, dec): (f64, f64) = (132.5, -20.0);
        let pix = cdshealpix::nested::hash(order, ra.to_radians(), dec.to_radians());

        let region = MultiOrderRegion::from_probability_cells(
            vec![ProbabilityCell { uniq: uniq(order, pix), prob_density: 100.0 }],
            0.9,
        );
        assert!(region.contains(ra, dec));
        assert!(!region.contains(ra + 180.0, -dec));
    }

    #[test]
    fn test_densest_cells_selected_first() {
        // Test: with the threshold met by the densest cell alone, the sparse
        // cell is left out of the region
        let order = 2u8;
        let dense_point: (f64, f64) = (40.0, 10.0);
        let sparse_point: (f64, f64) = (220.0, -10.0);
        let dense_pix = cdshealpix::nested::hash(order, dense_point.0.to_radians(), dense_point.1.to_radians());
        let sparse_pix = cdshealpix::nested::hash(order, sparse_point.0.to_radians(), sparse_point.1.to_radians());
        assert_ne!(dense_pix, sparse_pix);

        // One order-2 cell covers 4π/192 sr, so density 16.0 carries ~1.05
        // probability on its own.
        let region = MultiOrderRegion::from_probability_cells(
            vec![
                ProbabilityCell { uniq: uniq(order, sparse_pix), prob_density: 0.01 },
                ProbabilityCell { uniq: uniq(order, dense_pix), prob_density: 16.0 },
            ],
            0.95,
        );
        assert_eq!(region.cell_count(), 1);
        assert!(region.contains(dense_point.0, dense_point.1));
        assert!(!region.contains(sparse_point.0, sparse_point.1));
    }

    #[test]
    fn test_unusable_cells_dropped() {
        // Test: zero, negative and non-finite densities never enter a region
        let region = MultiOrderRegion::from_probability_cells(
            vec![
                ProbabilityCell { uniq: uniq(3, 0), prob_density: 0.0 },
                ProbabilityCell { uniq: uniq(3, 1), prob_density: -2.0 },
                ProbabilityCell { uniq: uniq(3, 2), prob_density: f64::NAN },
                ProbabilityCell { uniq: 2, prob_density: 5.0 },
            ],
            0.9,
        );
        assert!(region.is_empty());
    }
}
