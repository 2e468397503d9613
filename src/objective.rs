//! Phase-shift operator, overlap masking and the minimization target.

use ndarray::{Array2, Zip};
use num_complex::Complex64;
use num_traits::Zero;
use std::f64::consts::TAU;

use crate::grid::{Grid, GriddedDataset};
use crate::{ARCSEC, Offset};

/// Residual definition used by the coherence objective.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Residual {
    /// Weighted complex amplitude of the visibility difference. Penalizes
    /// phase and amplitude disagreement jointly; this is what the offset
    /// search minimizes by default.
    #[default]
    Full,
    /// Weighted chordal distance of the wrapped phase difference, scaled by
    /// the reference amplitude. Ignores amplitude disagreement.
    PhaseOnly,
}

/// Apply a phase shift of `offset` arcseconds to a gridded visibility plane.
///
/// Each cell is multiplied by `exp(-2*pi*i * (u * dRA + v * dDec))` with the
/// offset converted to radians. Cells holding no samples have undefined
/// phase and are forced to zero.
pub fn phase_shift(grid: &Grid, offset: Offset) -> Array2<Complex64> {
    Zip::from(&grid.vis)
        .and(&grid.uu)
        .and(&grid.vv)
        .and(&grid.count)
        .map_collect(|&vis, &u, &v, &count| {
            if count < 1 {
                Complex64::zero()
            } else {
                let phase = -TAU * (u * offset.ra + v * offset.dec) * ARCSEC;
                vis * Complex64::from_polar(1.0, phase)
            }
        })
}

/// Reduce both datasets to their common uv coverage.
///
/// A cell is kept when it holds at least one sample in *both* grids. Kept
/// cells are normalized to the weighted-average visibility (`vis / count`);
/// all other cells have visibility and count zeroed. The inputs are left
/// untouched and the returned datasets have identical support.
pub fn mask_overlap(
    reference: &GriddedDataset,
    comparison: &GriddedDataset,
) -> (GriddedDataset, GriddedDataset) {
    let overlap = Zip::from(&reference.grid.count)
        .and(&comparison.grid.count)
        .map_collect(|&a, &b| a >= 1 && b >= 1);

    (mask(reference, &overlap), mask(comparison, &overlap))
}

fn mask(dataset: &GriddedDataset, overlap: &Array2<bool>) -> GriddedDataset {
    let mut masked = dataset.clone();
    Zip::from(&mut masked.grid.vis)
        .and(&mut masked.grid.count)
        .and(overlap)
        .for_each(|vis, count, &keep| {
            if keep {
                // count >= 1 inside the overlap, no clipping needed
                *vis /= f64::from(*count);
            } else {
                *vis = Complex64::zero();
                *count = 0;
            }
        });
    masked
}

/// Scalar cost of a trial offset: the sum over all cells of the chosen
/// residual between the reference grid and the phase-shifted comparison
/// grid, weighted by the mean of the two per-cell weights.
///
/// Deliberately not normalized by cell count, for compatibility with the
/// convergence behavior of the original minimization.
pub(crate) fn cost(
    offset: Offset,
    reference: &GriddedDataset,
    comparison: &GriddedDataset,
    residual: Residual,
) -> f64 {
    let shifted = phase_shift(&comparison.grid, offset);
    let zip = Zip::from(&reference.grid.vis)
        .and(&shifted)
        .and(&reference.grid.weight)
        .and(&comparison.grid.weight);

    match residual {
        Residual::Full => zip.fold(0.0, |acc, &vis1, &vis2, &w1, &w2| {
            acc + (vis2 - vis1).norm() * 0.5 * (w1 + w2)
        }),
        Residual::PhaseOnly => zip.fold(0.0, |acc, &vis1, &vis2, &w1, &w2| {
            let delta = (vis2.arg() - vis1.arg()).abs();
            let wrapped = delta.min(TAU - delta);
            acc + 2.0 * (wrapped / 2.0).sin() * vis1.norm() * 0.5 * (w1 + w2)
        }),
    }
}

#[cfg(test)]
mod tests {
    use ndarray_rand::rand_distr::Uniform;
    use rand::Rng;

    use super::*;
    use crate::grid::Grid;

    fn gridded(npix: usize, du: f64, n: usize, seed_amp: f64) -> GriddedDataset {
        let mut rng = rand::thread_rng();
        let extent = (npix as f64 / 2.0 - 1.5) * du;
        let coord = Uniform::new(-extent, extent);
        let mut grid = Grid::new(npix, du, du).unwrap();
        let (mut uu, mut vv, mut vis, mut wgts) = (vec![], vec![], vec![], vec![]);
        for _ in 0..n {
            uu.push(rng.sample(coord));
            vv.push(rng.sample(coord));
            vis.push(Complex64::new(seed_amp, rng.gen_range(-0.5..0.5)));
            wgts.push(rng.gen_range(0.5..1.5));
        }
        grid.accumulate(&uu, &vv, &vis, &wgts);
        GriddedDataset {
            grid,
            source: "synthetic".to_owned(),
            cell_size: 0.01,
        }
    }

    #[test]
    fn phase_shift_invertible() {
        let dataset = gridded(64, 100.0, 400, 1.0);
        let offset = Offset::new(0.02, -0.01);

        let mut shifted_grid = dataset.grid.clone();
        shifted_grid.vis = phase_shift(&dataset.grid, offset);
        let restored = phase_shift(&shifted_grid, Offset::new(-offset.ra, -offset.dec));

        for ((&original, &back), &count) in dataset
            .grid
            .vis
            .iter()
            .zip(restored.iter())
            .zip(dataset.grid.count.iter())
        {
            if count > 0 {
                assert!((original - back).norm() < 1e-10);
            } else {
                assert_eq!(back, Complex64::zero());
            }
        }
    }

    #[test]
    fn phase_shift_zeroes_empty_cells() {
        let dataset = gridded(32, 100.0, 50, 1.0);
        let shifted = phase_shift(&dataset.grid, Offset::new(0.1, 0.1));
        for (&vis, &count) in shifted.iter().zip(dataset.grid.count.iter()) {
            if count == 0 {
                assert_eq!(vis, Complex64::zero());
            }
        }
    }

    #[test]
    fn masked_grids_share_support() {
        let reference = gridded(64, 100.0, 300, 1.0);
        let comparison = gridded(64, 100.0, 300, 0.8);
        let (masked_ref, masked_cmp) = mask_overlap(&reference, &comparison);

        assert_eq!(masked_ref.npix(), masked_cmp.npix());
        for ((&count_ref, &count_cmp), (&vis_ref, &vis_cmp)) in masked_ref
            .grid
            .count
            .iter()
            .zip(masked_cmp.grid.count.iter())
            .zip(masked_ref.grid.vis.iter().zip(masked_cmp.grid.vis.iter()))
        {
            assert_eq!(count_ref >= 1, count_cmp >= 1);
            if count_ref == 0 {
                assert_eq!(vis_ref, Complex64::zero());
                assert_eq!(vis_cmp, Complex64::zero());
            }
        }
    }

    #[test]
    fn masking_averages_within_cells() {
        let du = 100.0;
        let mut grid = Grid::new(32, du, du).unwrap();
        // Two samples in the same cell.
        let uu = [3.0 * du, 3.0 * du];
        let vv = [2.0 * du, 2.0 * du];
        let vis = [Complex64::new(1.0, 0.0), Complex64::new(3.0, 0.0)];
        grid.accumulate(&uu, &vv, &vis, &[1.0, 1.0]);
        let dataset = GriddedDataset {
            grid,
            source: "pair".to_owned(),
            cell_size: 0.01,
        };

        let (masked, _) = mask_overlap(&dataset, &dataset);
        let averaged: Vec<Complex64> = masked
            .grid
            .vis
            .iter()
            .copied()
            .filter(|v| v.norm() > 0.0)
            .collect();
        // Forward cell holds (1 + 3)/2, the mirror cell its conjugate.
        assert_eq!(averaged.len(), 2);
        for v in averaged {
            assert!((v - Complex64::new(2.0, 0.0)).norm() < 1e-12);
        }
    }

    #[test]
    fn phase_only_cost_on_known_phases() {
        let du = 100.0;
        let phi = 0.4;
        let mut reference = Grid::new(32, du, du).unwrap();
        reference.accumulate(
            &[3.0 * du],
            &[2.0 * du],
            &[Complex64::from_polar(2.0, -phi)],
            &[1.0],
        );
        let mut comparison = Grid::new(32, du, du).unwrap();
        comparison.accumulate(
            &[3.0 * du],
            &[2.0 * du],
            &[Complex64::from_polar(1.0, phi)],
            &[3.0],
        );
        let reference = GriddedDataset {
            grid: reference,
            source: "ref".to_owned(),
            cell_size: 0.01,
        };
        let mut comparison = GriddedDataset {
            grid: comparison,
            source: "cmp".to_owned(),
            cell_size: 0.01,
        };

        // Forward cell and mirror cell each contribute
        // 2 sin(phi) * |vis_ref| * (w_ref + w_cmp)/2 = 2 sin(phi) * 2 * 2.
        let expected = 2.0 * 2.0 * phi.sin() * 2.0 * 2.0;
        let actual = cost(Offset::ZERO, &reference, &comparison, Residual::PhaseOnly);
        assert!((actual - expected).abs() < 1e-12);

        // Amplitude disagreement is invisible to the phase-only residual.
        comparison.grid.vis.mapv_inplace(|v| v * 5.0);
        let rescaled = cost(Offset::ZERO, &reference, &comparison, Residual::PhaseOnly);
        assert!((rescaled - expected).abs() < 1e-12);
    }

    #[test]
    fn phase_only_cost_wraps_large_phase_differences() {
        // Phases -2.5 and +2.5 are 5 rad apart on paper but only
        // 2 pi - 5 rad apart on the circle.
        let du = 100.0;
        let mut reference = Grid::new(32, du, du).unwrap();
        reference.accumulate(
            &[3.0 * du],
            &[2.0 * du],
            &[Complex64::from_polar(1.0, -2.5)],
            &[1.0],
        );
        let mut comparison = Grid::new(32, du, du).unwrap();
        comparison.accumulate(
            &[3.0 * du],
            &[2.0 * du],
            &[Complex64::from_polar(1.0, 2.5)],
            &[1.0],
        );
        let reference = GriddedDataset {
            grid: reference,
            source: "ref".to_owned(),
            cell_size: 0.01,
        };
        let comparison = GriddedDataset {
            grid: comparison,
            source: "cmp".to_owned(),
            cell_size: 0.01,
        };

        // Two cells, unit amplitude and weight, chord of the wrapped angle.
        let wrapped = TAU - 5.0;
        let expected = 2.0 * 2.0 * (wrapped / 2.0).sin();
        let actual = cost(Offset::ZERO, &reference, &comparison, Residual::PhaseOnly);
        assert!((actual - expected).abs() < 1e-12);
        assert!(actual > 0.0);
    }

    #[test]
    fn cost_vanishes_for_identical_grids() {
        let dataset = gridded(64, 100.0, 300, 1.0);
        let (masked_ref, masked_cmp) = mask_overlap(&dataset, &dataset);
        let zero = cost(Offset::ZERO, &masked_ref, &masked_cmp, Residual::Full);
        assert!(zero.abs() < 1e-9);

        let shifted = cost(
            Offset::new(0.05, 0.05),
            &masked_ref,
            &masked_cmp,
            Residual::Full,
        );
        assert!(shifted > zero);
    }
}
