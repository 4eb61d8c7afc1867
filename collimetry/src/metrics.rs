//! Quality metrics derived from a detector intensity profile: penumbra,
//! flatness, leakage, collimation ratio and scatter-to-primary ratio.
//!
//! The profile handed in covers only detector bins actually reached by
//! rays; intensities are the per-bin mean primary transmissions. All
//! crossings are linearly interpolated between bin centres.

use super::convert::Mm;
use super::result::{Penumbra, QualityMetrics};
use serde::{Deserialize, Serialize};

/// Primary intensities below this fraction of the profile maximum count
/// as unexposed when computing the scatter-to-primary ratio.
pub const SPR_PRIMARY_FLOOR: f64 = 1e-9;

/// The two intensity fractions a penumbra is measured between.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct FractionPair {
    /// Lower crossing fraction.
    pub lower: f64,
    /// Upper crossing fraction.
    pub upper: f64,
}

impl FractionPair {
    /// The conventional 20 %/80 % pair.
    pub const TWENTY_EIGHTY: Self = Self {
        lower: 0.2,
        upper: 0.8,
    };
    /// The steeper 10 %/90 % pair.
    pub const TEN_NINETY: Self = Self {
        lower: 0.1,
        upper: 0.9,
    };
    /// Both fractions at half maximum; the penumbra degenerates to the
    /// FWHM edge positions.
    pub const HALF_MAXIMUM: Self = Self {
        lower: 0.5,
        upper: 0.5,
    };
}

impl Default for FractionPair {
    fn default() -> Self {
        Self::TWENTY_EIGHTY
    }
}

/// Computes all profile metrics.
///
/// `built` and `unbuilt` are the per-bin mean primary transmissions with
/// and without the build-up factor; `scatter` is the accumulated scatter
/// intensity when the tracer ran. Slices must have the same length as
/// `positions_mm`.
#[must_use]
pub fn quality_metrics(
    positions_mm: &[Mm],
    built: &[f64],
    unbuilt: &[f64],
    scatter: Option<&[f64]>,
    fractions: FractionPair,
) -> QualityMetrics {
    let mut metrics = QualityMetrics {
        penumbra: Penumbra {
            lower_fraction: fractions.lower,
            upper_fraction: fractions.upper,
            left_mm: None,
            right_mm: None,
            general_mm: None,
        },
        flatness: None,
        leakage_mean: None,
        leakage_max: None,
        leakage_mean_unbuilt: None,
        leakage_max_unbuilt: None,
        collimation_ratio: None,
        collimation_ratio_db: None,
        spr_mean: None,
        spr_max: None,
    };

    let bins = positions_mm.len();
    if bins < 3 || built.len() != bins || unbuilt.len() != bins {
        return metrics;
    }

    // the reference maximum comes from the central third, so edge leakage
    // cannot masquerade as the useful beam
    let central = bins / 3..(2 * bins).div_ceil(3);
    let Some(peak) = central
        .clone()
        .filter(|&bin| built[bin] > 0.0)
        .max_by(|&l, &r| built[l].partial_cmp(&built[r]).unwrap_or(std::cmp::Ordering::Equal))
    else {
        return metrics;
    };
    let peak_value = built[peak];

    let left_half = crossing(positions_mm, built, peak, Side::Left, 0.5 * peak_value);
    let right_half = crossing(positions_mm, built, peak, Side::Right, 0.5 * peak_value);

    // penumbra between the two configured fractions, each side
    let penumbra_side = |side: Side| -> Option<Mm> {
        let outer = crossing(positions_mm, built, peak, side, fractions.lower * peak_value)?;
        let inner = crossing(positions_mm, built, peak, side, fractions.upper * peak_value)?;
        Some((outer - inner).abs())
    };
    metrics.penumbra.left_mm = penumbra_side(Side::Left);
    metrics.penumbra.right_mm = penumbra_side(Side::Right);
    metrics.penumbra.general_mm = match (metrics.penumbra.left_mm, metrics.penumbra.right_mm) {
        (Some(left), Some(right)) => Some(left.max(right)),
        (side, None) | (None, side) => side,
    };

    if let (Some(left), Some(right)) = (left_half, right_half) {
        let width = right - left;
        let mid = 0.5 * (left + right);
        let in_flat = |x: Mm| (x - mid).abs() <= 0.4 * width;

        let flat_values: Vec<f64> = positions_mm
            .iter()
            .zip(built)
            .filter(|&(&x, _)| in_flat(x))
            .map(|(_, &value)| value)
            .collect();
        if let (Some(max), Some(min)) = (max_of(&flat_values), min_of(&flat_values)) {
            if max + min > 0.0 {
                metrics.flatness = Some((max - min) / (max + min));
            }
        }

        // everything beyond the half-maximum edge plus the penumbra band
        // is the shielded region
        let left_edge = left - metrics.penumbra.left_mm.unwrap_or(0.0);
        let right_edge = right + metrics.penumbra.right_mm.unwrap_or(0.0);
        let shielded = |x: Mm| x < left_edge || x > right_edge;

        let central_mean = mean_where(positions_mm, built, in_flat);
        let leak_built: Vec<f64> = values_where(positions_mm, built, shielded);
        let leak_unbuilt: Vec<f64> = values_where(positions_mm, unbuilt, shielded);
        let central_mean_unbuilt = mean_where(positions_mm, unbuilt, in_flat);

        if let Some(primary_mean) = central_mean {
            if primary_mean > 0.0 && !leak_built.is_empty() {
                let leak_mean = leak_built.iter().sum::<f64>() / leak_built.len() as f64;
                metrics.leakage_mean = Some(leak_mean / primary_mean);
                metrics.leakage_max = max_of(&leak_built).map(|max| max / primary_mean);

                if leak_mean > 0.0 {
                    let ratio = primary_mean / leak_mean;
                    metrics.collimation_ratio = Some(ratio);
                    metrics.collimation_ratio_db = Some(10.0 * ratio.log10());
                }
            }
        }
        if let Some(primary_mean) = central_mean_unbuilt {
            if primary_mean > 0.0 && !leak_unbuilt.is_empty() {
                let leak_mean = leak_unbuilt.iter().sum::<f64>() / leak_unbuilt.len() as f64;
                metrics.leakage_mean_unbuilt = Some(leak_mean / primary_mean);
                metrics.leakage_max_unbuilt = max_of(&leak_unbuilt).map(|max| max / primary_mean);
            }
        }
    }

    if let Some(scatter) = scatter {
        if scatter.len() == bins {
            let floor = SPR_PRIMARY_FLOOR * peak_value;
            let ratios: Vec<f64> = built
                .iter()
                .zip(scatter)
                .map(|(&primary, &scattered)| {
                    if primary > floor {
                        scattered / primary
                    } else {
                        0.0
                    }
                })
                .collect();
            metrics.spr_mean = Some(ratios.iter().sum::<f64>() / ratios.len() as f64);
            metrics.spr_max = max_of(&ratios);
        }
    }

    metrics
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// Walks outward from the peak and interpolates the position where the
/// profile first drops below `level`. `None` when it never does.
fn crossing(
    positions_mm: &[Mm],
    values: &[f64],
    peak: usize,
    side: Side,
    level: f64,
) -> Option<Mm> {
    let indices: Box<dyn Iterator<Item = usize>> = match side {
        Side::Left => Box::new((0..peak).rev()),
        Side::Right => Box::new(peak + 1..values.len()),
    };

    let mut inner = peak;
    for outer in indices {
        if values[outer] < level && values[inner] >= level {
            let run = values[inner] - values[outer];
            let fraction = if run > 0.0 {
                (values[inner] - level) / run
            } else {
                0.0
            };
            return Some(
                (positions_mm[outer] - positions_mm[inner])
                    .mul_add(fraction, positions_mm[inner]),
            );
        }
        inner = outer;
    }
    None
}

fn max_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().fold(None, |acc, v| {
        Some(acc.map_or(v, |a: f64| a.max(v)))
    })
}

fn min_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().fold(None, |acc, v| {
        Some(acc.map_or(v, |a: f64| a.min(v)))
    })
}

fn mean_where(positions_mm: &[Mm], values: &[f64], keep: impl Fn(Mm) -> bool) -> Option<f64> {
    let kept = values_where(positions_mm, values, keep);
    if kept.is_empty() {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let mean = kept.iter().sum::<f64>() / kept.len() as f64;
    Some(mean)
}

fn values_where(positions_mm: &[Mm], values: &[f64], keep: impl Fn(Mm) -> bool) -> Vec<f64> {
    positions_mm
        .iter()
        .zip(values)
        .filter(|&(&x, _)| keep(x))
        .map(|(_, &value)| value)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    /// Trapezoid profile: flat top of 1.0 over |x| <= 20, linear falloff
    /// to zero at |x| = 40, then a 0.01 leakage floor.
    fn trapezoid() -> (Vec<f64>, Vec<f64>) {
        let positions: Vec<f64> = (0..161).map(|i| f64::from(i) - 80.0).collect();
        let values: Vec<f64> = positions
            .iter()
            .map(|&x| {
                let a = x.abs();
                if a <= 20.0 {
                    1.0
                } else if a <= 40.0 {
                    ((40.0 - a) / 20.0).max(0.01)
                } else {
                    0.01
                }
            })
            .collect();
        (positions, values)
    }

    #[test]
    fn trapezoid_penumbra_matches_the_ramp() {
        let (positions, values) = trapezoid();
        let metrics = quality_metrics(
            &positions,
            &values,
            &values,
            None,
            FractionPair::TWENTY_EIGHTY,
        );

        // the ramp spans 20 mm from 0 to 1, so 20 % to 80 % covers 12 mm
        let left = metrics.penumbra.left_mm.unwrap();
        let right = metrics.penumbra.right_mm.unwrap();
        assert_approx_eq!(f64, left, 12.0, epsilon = 0.2);
        assert_approx_eq!(f64, right, 12.0, epsilon = 0.2);
        assert_approx_eq!(f64, metrics.penumbra.general_mm.unwrap(), left.max(right), ulps = 2);
    }

    #[test]
    fn flatness_covers_the_central_eighty_percent_of_the_fwhm() {
        // the 80 % window spans |x| <= 24, whose lowest ramp value is 0.8
        let (positions, values) = trapezoid();
        let metrics = quality_metrics(
            &positions,
            &values,
            &values,
            None,
            FractionPair::default(),
        );
        assert_approx_eq!(
            f64,
            metrics.flatness.unwrap(),
            (1.0 - 0.8) / (1.0 + 0.8),
            epsilon = 1e-9
        );
    }

    #[test]
    fn wide_flat_tops_have_zero_flatness() {
        // flat top |x| <= 30 with a steep 4 mm ramp keeps the 80 % FWHM
        // window entirely on the top
        let positions: Vec<f64> = (0..161).map(|i| f64::from(i) - 80.0).collect();
        let values: Vec<f64> = positions
            .iter()
            .map(|&x| {
                let a = x.abs();
                if a <= 30.0 {
                    1.0
                } else if a <= 34.0 {
                    ((34.0 - a) / 4.0).max(0.01)
                } else {
                    0.01
                }
            })
            .collect();
        let metrics = quality_metrics(
            &positions,
            &values,
            &values,
            None,
            FractionPair::default(),
        );
        assert_approx_eq!(f64, metrics.flatness.unwrap(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn leakage_floor_is_measured_against_the_central_mean() {
        let (positions, values) = trapezoid();
        let metrics = quality_metrics(
            &positions,
            &values,
            &values,
            None,
            FractionPair::default(),
        );
        let leakage = metrics.leakage_mean.unwrap();
        assert_approx_eq!(f64, leakage, 0.01, epsilon = 2e-3);
        let ratio = metrics.collimation_ratio.unwrap();
        assert_approx_eq!(f64, ratio, 1.0 / leakage, epsilon = 1e-6);
        assert_approx_eq!(
            f64,
            metrics.collimation_ratio_db.unwrap(),
            10.0 * ratio.log10(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn uniform_profiles_yield_no_edge_metrics() {
        let positions: Vec<f64> = (0..50).map(|i| f64::from(i) - 25.0).collect();
        let values = vec![0.25; 50];
        let metrics = quality_metrics(
            &positions,
            &values,
            &values,
            None,
            FractionPair::default(),
        );
        assert!(metrics.penumbra.general_mm.is_none());
        assert!(metrics.flatness.is_none());
        assert!(metrics.leakage_mean.is_none());
        assert!(metrics.collimation_ratio.is_none());
    }

    #[test]
    fn spr_ignores_unexposed_bins() {
        let (positions, values) = trapezoid();
        let scatter: Vec<f64> = values.iter().map(|v| 0.1 * v).collect();
        let metrics = quality_metrics(
            &positions,
            &values,
            &values,
            Some(&scatter),
            FractionPair::default(),
        );
        assert_approx_eq!(f64, metrics.spr_max.unwrap(), 0.1, epsilon = 1e-9);
        assert_approx_eq!(f64, metrics.spr_mean.unwrap(), 0.1, epsilon = 1e-9);
    }

    #[test]
    fn half_maximum_pair_degenerates_to_the_edges() {
        let (positions, values) = trapezoid();
        let metrics = quality_metrics(
            &positions,
            &values,
            &values,
            None,
            FractionPair::HALF_MAXIMUM,
        );
        assert_approx_eq!(f64, metrics.penumbra.general_mm.unwrap(), 0.0, epsilon = 1e-9);
    }
}
