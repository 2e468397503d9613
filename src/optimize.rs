//! Quasi-Newton search for the offset that minimizes the coherence cost.

use log::{debug, info, warn};
use nalgebra::{Matrix2, Vector2};

use crate::error::AlignmentError;
use crate::grid::GriddedDataset;
use crate::objective::{Residual, cost, mask_overlap};
use crate::{ARCSEC, Offset};

const MAX_ITER: usize = 500;
const MAX_BACKTRACKS: usize = 50;
/// Relative function-decrease stopping tolerance.
const FTOL: f64 = 1e-11;
/// Relative gradient-norm stopping tolerance.
const GTOL: f64 = 1e-12;
/// Armijo sufficient-decrease parameter.
const C1: f64 = 1e-4;

/// Find the sky offset of `comparison` relative to `reference`.
///
/// Both grids are first reduced to their common uv coverage, then a
/// 2-parameter quasi-Newton minimization of the coherence cost is started
/// from a guess informed by the comparison's longest populated baseline.
///
/// On non-convergence either a zero offset is returned (`fail_silently`) or
/// [`AlignmentError::Optimization`] is raised. There are no retries.
pub fn find_offset(
    reference: &GriddedDataset,
    comparison: &GriddedDataset,
    residual: Residual,
    fail_silently: bool,
) -> Result<Offset, AlignmentError> {
    let (masked_ref, masked_cmp) = mask_overlap(reference, comparison);

    let result = starting_guess(&masked_cmp)
        .ok_or_else(|| {
            AlignmentError::Optimization(format!(
                "{} and {} share no uv cells",
                reference.source, comparison.source
            ))
        })
        .and_then(|x0| {
            info!("Calculating the offset of {}.", comparison.source);
            minimize(
                |x| cost(Offset::from(x), &masked_ref, &masked_cmp, residual),
                x0,
            )
        });

    match result {
        Ok(x) => Ok(Offset::from(x)),
        Err(err) if fail_silently => {
            warn!("{err}; substituting a zero offset.");
            Ok(Offset::ZERO)
        }
        Err(err) => Err(err),
    }
}

/// Starting guess: one sixth of the angular resolution implied by the
/// longest baseline with data, applied to both components. `None` when no
/// cell holds data.
fn starting_guess(comparison: &GriddedDataset) -> Option<Vector2<f64>> {
    let grid = &comparison.grid;
    let mut max_uv_sq: Option<f64> = None;
    for ((&count, &u), &v) in grid.count.iter().zip(grid.uu.iter()).zip(grid.vv.iter()) {
        if count > 0 {
            let r_sq = u * u + v * v;
            max_uv_sq = Some(max_uv_sq.map_or(r_sq, |m: f64| m.max(r_sq)));
        }
    }
    let guess = 1.0 / max_uv_sq?.sqrt() / ARCSEC / 6.0;
    debug!("Starting the offset search at {guess:.4} arcsec.");
    Some(Vector2::new(guess, guess))
}

/// Central-difference gradient. The step is scaled to `scale`, the
/// characteristic magnitude of the offset parameters.
fn gradient<F: Fn(Vector2<f64>) -> f64>(f: &F, x: Vector2<f64>, scale: f64) -> Vector2<f64> {
    let mut grad = Vector2::zeros();
    for i in 0..2 {
        let h = f64::EPSILON.cbrt() * x[i].abs().max(scale);
        let mut upper = x;
        let mut lower = x;
        upper[i] += h;
        lower[i] -= h;
        grad[i] = (f(upper) - f(lower)) / (2.0 * h);
    }
    grad
}

/// Minimize an unconstrained 2-parameter function with BFGS.
///
/// Inverse-Hessian updates with an Armijo backtracking line search; the
/// gradient is taken numerically. Stops on a relative function decrease
/// below `FTOL` or a gradient norm below `GTOL`, both measured against the
/// current function magnitude.
pub(crate) fn minimize<F: Fn(Vector2<f64>) -> f64>(
    f: F,
    x0: Vector2<f64>,
) -> Result<Vector2<f64>, AlignmentError> {
    let scale = x0.amax().max(f64::EPSILON);
    let mut x = x0;
    let mut fx = f(x);
    let mut grad = gradient(&f, x, scale);
    let mut h_inv = Matrix2::identity();

    for iteration in 0..MAX_ITER {
        if grad.norm() <= GTOL * fx.abs().max(1.0) {
            debug!("Converged after {iteration} iterations (gradient).");
            return Ok(x);
        }

        let mut direction = -(h_inv * grad);
        let mut slope = direction.dot(&grad);
        if slope >= 0.0 {
            // The curvature estimate went bad; restart from steepest descent.
            direction = -grad;
            slope = -grad.norm_squared();
            h_inv = Matrix2::identity();
        }

        let mut step = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_BACKTRACKS {
            let candidate = x + direction * step;
            let f_candidate = f(candidate);
            if f_candidate <= fx + C1 * step * slope {
                accepted = Some((candidate, f_candidate));
                break;
            }
            step *= 0.5;
        }
        let Some((x_new, f_new)) = accepted else {
            // No descent step exists within floating-point resolution; the
            // iterate is as close to the minimum as the cost can resolve.
            debug!("Line search exhausted after {iteration} iterations.");
            return Ok(x);
        };

        let grad_new = gradient(&f, x_new, scale);
        let s = x_new - x;
        let y = grad_new - grad;
        let sy = s.dot(&y);
        if sy > 1e-10 * s.norm() * y.norm() {
            let rho = 1.0 / sy;
            let a = Matrix2::identity() - s * y.transpose() * rho;
            h_inv = a * h_inv * a.transpose() + s * s.transpose() * rho;
        }

        let decrease = fx - f_new;
        x = x_new;
        grad = grad_new;
        if decrease.abs() <= FTOL * fx.abs().max(f_new.abs()).max(1.0) {
            fx = f_new;
            debug!("Converged after {} iterations (function value).", iteration + 1);
            return Ok(x);
        }
        fx = f_new;
    }

    Err(AlignmentError::Optimization(format!(
        "no convergence within {MAX_ITER} iterations"
    )))
}

#[cfg(test)]
mod tests {
    use ndarray_rand::rand_distr::Uniform;
    use num_complex::Complex64;
    use rand::Rng;

    use super::*;
    use crate::grid::Grid;
    use crate::objective::phase_shift;

    /// Grid ~1000 unit-amplitude samples at ALMA-like baselines.
    fn reference_dataset(npix: usize, cell_size: f64) -> GriddedDataset {
        let mut rng = rand::thread_rng();
        let du = 1.0 / npix as f64 / (cell_size * ARCSEC);
        let extent = (npix as f64 / 2.0 - 2.0) * du;
        let coord = Uniform::new(-extent, extent);
        let mut grid = Grid::new(npix, du, du).unwrap();
        let (mut uu, mut vv, mut vis, mut wgts) = (vec![], vec![], vec![], vec![]);
        for _ in 0..1000 {
            uu.push(rng.sample(coord));
            vv.push(rng.sample(coord));
            vis.push(Complex64::new(1.0, 0.0));
            wgts.push(rng.gen_range(0.5..1.5));
        }
        grid.accumulate(&uu, &vv, &vis, &wgts);
        GriddedDataset {
            grid,
            source: "reference".to_owned(),
            cell_size,
        }
    }

    #[test]
    fn quadratic_bowl() {
        let minimum = Vector2::new(1.5, -2.5);
        let f = |x: Vector2<f64>| (x - minimum).norm_squared() * 3.0 + 7.0;
        let solution = minimize(f, Vector2::new(10.0, 10.0)).unwrap();
        assert!((solution - minimum).norm() < 1e-6);
    }

    #[test]
    fn anisotropic_quadratic() {
        let f = |x: Vector2<f64>| 100.0 * x[0] * x[0] + x[1] * x[1] + 2.0 * x[1];
        let solution = minimize(f, Vector2::new(3.0, 3.0)).unwrap();
        assert!((solution - Vector2::new(0.0, -1.0)).norm() < 1e-5);
    }

    #[test]
    fn zero_offset_for_identical_datasets() {
        let dataset = reference_dataset(128, 0.05);
        let offset = find_offset(&dataset, &dataset.clone(), Residual::Full, false).unwrap();
        assert!(offset.ra.abs() < 1e-6);
        assert!(offset.dec.abs() < 1e-6);
    }

    #[test]
    fn recovers_injected_offset() {
        let injected = Offset::new(0.02, -0.01);
        let reference = reference_dataset(128, 0.05);

        // Synthesize the comparison by phase-shifting the reference grid by
        // the negated offset, so the forward search has to undo it.
        let mut comparison = reference.clone();
        comparison.source = "comparison".to_owned();
        comparison.grid.vis = phase_shift(
            &reference.grid,
            Offset::new(-injected.ra, -injected.dec),
        );

        let recovered = find_offset(&reference, &comparison, Residual::Full, false).unwrap();
        assert!((recovered.ra - injected.ra).abs() < 0.01 * injected.ra.abs());
        assert!((recovered.dec - injected.dec).abs() < 0.01 * injected.dec.abs());
    }

    #[test]
    fn phase_only_residual_recovers_injected_offset() {
        let injected = Offset::new(0.02, -0.01);
        let reference = reference_dataset(128, 0.05);

        let mut comparison = reference.clone();
        comparison.source = "comparison".to_owned();
        comparison.grid.vis = phase_shift(
            &reference.grid,
            Offset::new(-injected.ra, -injected.dec),
        );

        let recovered =
            find_offset(&reference, &comparison, Residual::PhaseOnly, false).unwrap();
        assert!((recovered.ra - injected.ra).abs() < 0.01 * injected.ra.abs());
        assert!((recovered.dec - injected.dec).abs() < 0.01 * injected.dec.abs());
    }

    #[test]
    fn disjoint_coverage_fails_loudly_or_silently() {
        let du = 30_000.0;
        let mut left = Grid::new(64, du, du).unwrap();
        left.accumulate(
            &[-10.0 * du],
            &[-10.0 * du],
            &[Complex64::new(1.0, 0.0)],
            &[1.0],
        );
        let mut right = Grid::new(64, du, du).unwrap();
        right.accumulate(
            &[5.0 * du],
            &[9.0 * du],
            &[Complex64::new(1.0, 0.0)],
            &[1.0],
        );

        let reference = GriddedDataset {
            grid: left,
            source: "left".to_owned(),
            cell_size: 0.01,
        };
        let comparison = GriddedDataset {
            grid: right,
            source: "right".to_owned(),
            cell_size: 0.01,
        };

        let err = find_offset(&reference, &comparison, Residual::Full, false).unwrap_err();
        assert!(matches!(err, AlignmentError::Optimization(_)));

        let silent = find_offset(&reference, &comparison, Residual::Full, true).unwrap();
        assert_eq!(silent, Offset::ZERO);
    }
}
