//! Matching catalog stars against the sky coordinates of a registered image
//!
//! Differences are compared per axis rather than as a true angular distance:
//! the RA difference is folded across the 0/360 seam and the DEC difference is
//! weighted by 4, since DEC spans a quarter of the range RA does. A candidate
//! is acceptable only if both weighted differences are under the tolerance,
//! and the acceptable candidate with the smallest sum of differences wins.

use std::collections::HashSet;
use std::path::Path;

use glam::DVec2;
use tracing::{debug, error, warn};

use crate::common::SkyCoord;
use crate::fits::HeaderLookup;
use crate::stars::{Star, STAR_OF_INTEREST_ID};

pub const DEFAULT_TOLERANCE: f64 = 0.08;
pub const DEFAULT_CENTER_DEVIATION: f64 = 0.7;
const DEC_WEIGHT: f64 = 4.0;

pub const CRPIX1: &str = "CRPIX1";
pub const CRPIX2: &str = "CRPIX2";

/// Indices into the candidate list and the field identifier each one was
/// matched to, in matching order (star of interest first).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMatch {
    pub indices: Vec<usize>,
    pub identifiers: Vec<u32>,
}

impl FieldMatch {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    fn push(&mut self, index: usize, id: u32) {
        self.indices.push(index);
        self.identifiers.push(id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateMatcher {
    /// Maximum RA difference and weighted DEC difference, degrees
    pub tolerance: f64,
    /// Allowed deviation of the star from the reference pixel, as a fraction
    /// of the reference pixel coordinate
    pub center_deviation: f64,
}

impl Default for CoordinateMatcher {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            center_deviation: DEFAULT_CENTER_DEVIATION,
        }
    }
}

impl CoordinateMatcher {
    pub fn new(tolerance: f64, center_deviation: f64) -> Self {
        Self {
            tolerance,
            center_deviation,
        }
    }

    /// Index of the candidate closest to `target`, if any is within tolerance.
    pub fn find_nearest(&self, candidates: &[SkyCoord], target: SkyCoord) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        let mut closest_miss = (f64::INFINITY, f64::INFINITY);

        for (i, candidate) in candidates.iter().enumerate() {
            let ra_diff = candidate.ra.ra_difference(target.ra);
            let dec_diff = (candidate.dec.degrees() - target.dec.degrees()).abs() * DEC_WEIGHT;
            let sum = ra_diff + dec_diff;

            if ra_diff < self.tolerance && dec_diff < self.tolerance {
                if best.map_or(true, |(_, best_sum)| sum < best_sum) {
                    best = Some((i, sum));
                }
            }

            if sum < closest_miss.0 + closest_miss.1 {
                closest_miss = (ra_diff, dec_diff);
            }
        }

        if best.is_none() {
            debug!(
                "No match for coordinates {:.6} {:.6}, min. diff. are: {:.10} {:.10}",
                target.ra.degrees(),
                target.dec.degrees(),
                closest_miss.0,
                closest_miss.1
            );
        }

        best.map(|(i, _)| i)
    }

    /// Match the star of interest and then each of its field stars.
    ///
    /// The star of interest is recorded first with identifier `0`. If it
    /// cannot be matched nothing is returned; field stars that cannot be
    /// matched are skipped.
    pub fn find_all_for_star_field(&self, candidates: &[SkyCoord], star: &Star) -> FieldMatch {
        let mut matched = FieldMatch::default();

        let Some(index) = self.find_nearest(candidates, star.coord()) else {
            warn!("Index for star {} not found", star.name());
            return matched;
        };
        matched.push(index, STAR_OF_INTEREST_ID);

        for field_star in star.field_stars() {
            if field_star.id == STAR_OF_INTEREST_ID {
                debug!(
                    "Field of {} lists the star itself with identifier {}, already matched",
                    star.name(),
                    STAR_OF_INTEREST_ID
                );
                continue;
            }
            match self.find_nearest(candidates, field_star.coord) {
                Some(index) => {
                    debug!(
                        "Index for reference {:.10} {:.10} with id {} is {index}",
                        field_star.coord.ra.degrees(),
                        field_star.coord.dec.degrees(),
                        field_star.id
                    );
                    matched.push(index, field_star.id);
                }
                None => debug!(
                    "Index for reference {:.10} {:.10} with id {} not found",
                    field_star.coord.ra.degrees(),
                    field_star.coord.dec.degrees(),
                    field_star.id
                ),
            }
        }

        matched
    }

    /// Check a field match is consistent with the image it came from.
    ///
    /// Fails when the star lies outside the area covered by the registered
    /// coordinates, or when its pixel position strays too far from the
    /// reference pixel. Duplicated identifiers and a missing star of interest
    /// are reported but do not fail the check, and neither does an image
    /// without a reference pixel.
    pub fn validate_match(
        &self,
        image: &Path,
        star: &Star,
        matched: &FieldMatch,
        coords: &[SkyCoord],
        pixels: &[DVec2],
        headers: &impl HeaderLookup,
    ) -> bool {
        let mut success = true;

        if !star_inside_coverage(star.coord(), coords) {
            error!(
                "RA DEC coordinates given by astrometry do not contain star in image: {image:?}"
            );
            success = false;
        } else if !self.near_reference_pixel(image, matched, pixels, headers) {
            success = false;
        }

        let unique: HashSet<&u32> = matched.identifiers.iter().collect();
        if unique.len() < matched.identifiers.len() {
            error!("Duplicated coordinates for some star in: {image:?}");
        }

        if !matched.identifiers.contains(&STAR_OF_INTEREST_ID) {
            error!("No coordinates identified for star of interest in: {image:?}");
        }

        success
    }

    fn near_reference_pixel(
        &self,
        image: &Path,
        matched: &FieldMatch,
        pixels: &[DVec2],
        headers: &impl HeaderLookup,
    ) -> bool {
        let center = match (
            headers.header_f64(image, CRPIX1),
            headers.header_f64(image, CRPIX2),
        ) {
            (Ok(x), Ok(y)) => DVec2::new(x, y),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Reference pixel not available for {image:?}, position not checked: {e}");
                return true;
            }
        };

        let Some(star_xy) = matched.indices.first().and_then(|&i| pixels.get(i)) else {
            warn!("No pixel position for the star of interest in {image:?}");
            return false;
        };

        let margin = center * self.center_deviation;
        let low = center - margin;
        let high = center + margin;
        if star_xy.x < low.x || star_xy.x > high.x || star_xy.y < low.y || star_xy.y > high.y {
            error!(
                "X,Y coordinates for star too far from center in {image:?}: ({:.2}, {:.2}) vs ({:.2}, {:.2})",
                star_xy.x, star_xy.y, center.x, center.y
            );
            return false;
        }

        true
    }
}

/// Whether `coord` lies strictly inside the bounding box of `coords`.
fn star_inside_coverage(coord: SkyCoord, coords: &[SkyCoord]) -> bool {
    if coords.is_empty() {
        return false;
    }
    let (mut min_ra, mut max_ra) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut min_dec, mut max_dec) = (f64::INFINITY, f64::NEG_INFINITY);
    for c in coords {
        min_ra = min_ra.min(c.ra.degrees());
        max_ra = max_ra.max(c.ra.degrees());
        min_dec = min_dec.min(c.dec.degrees());
        max_dec = max_dec.max(c.dec.degrees());
    }
    let ra = coord.ra.degrees();
    let dec = coord.dec.degrees();
    ra > min_ra && ra < max_ra && dec > min_dec && dec < max_dec
}
