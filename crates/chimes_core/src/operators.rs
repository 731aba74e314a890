//! Sector and region operators for use inside field functions.
//!
//! All operators act on (run, region, sectorA, sectorB) arrays and treat the
//! two trailing axes as a matrix: a sector vector is an (n, 1) column.
//! Leading axes broadcast the usual way, a length-1 run or region axis pairs
//! with any length.
//!
//! Like ndarray's own `dot`, these panic when the sector axes do not line up.

use nalgebra::DMatrix;
use ndarray::{s, Array4, ArrayView4, Axis};
use tracing::warn;

/// Swaps the two sector axes: `Y_ij = X_ji`.
pub fn transpose(x: ArrayView4<'_, f64>) -> Array4<f64> {
    x.permuted_axes([0, 1, 3, 2]).to_owned()
}

/// Matrix product over the sector axes: `Z_i = sum_j M_ij V_j`.
///
/// # Panics
/// If the inner sector lengths differ, or the run/region axes cannot broadcast.
pub fn matmul(m: ArrayView4<'_, f64>, v: ArrayView4<'_, f64>) -> Array4<f64> {
    let (mx, mr, rows, inner) = m.dim();
    let (vx, vr, inner_v, cols) = v.dim();
    assert_eq!(
        inner, inner_v,
        "matmul: inner sector lengths differ ({inner} vs {inner_v})"
    );
    let runs = broadcast_len(mx, vx, "run");
    let regions = broadcast_len(mr, vr, "region");

    let mut out = Array4::zeros((runs, regions, rows, cols));
    for x in 0..runs {
        for r in 0..regions {
            let a = m.slice(s![x.min(mx - 1), r.min(mr - 1), .., ..]);
            let b = v.slice(s![x.min(vx - 1), r.min(vr - 1), .., ..]);
            out.slice_mut(s![x, r, .., ..]).assign(&a.dot(&b));
        }
    }
    out
}

/// Scalar product of two sector vectors: `Z = sum_i X_i Y_i`.
pub fn sprod(x: ArrayView4<'_, f64>, y: ArrayView4<'_, f64>) -> Array4<f64> {
    matmul(transpose(x).view(), y)
}

/// Sum over sectorA: `Z_j = sum_i X_ij`, returned as an `(S2, 1)` column.
pub fn ssum(x: ArrayView4<'_, f64>) -> Array4<f64> {
    x.sum_axis(Axis(2)).insert_axis(Axis(2)).permuted_axes([0, 1, 3, 2]).to_owned()
}

/// Sum over sectorB: `Z_i = sum_j X_ij`, as a column.
pub fn ssum2(x: ArrayView4<'_, f64>) -> Array4<f64> {
    x.sum_axis(Axis(3)).insert_axis(Axis(3))
}

/// Sum over the region axis.
pub fn ssum_regions(x: ArrayView4<'_, f64>) -> Array4<f64> {
    x.sum_axis(Axis(1)).insert_axis(Axis(1))
}

/// Identity matrix sized after the last sector axis of `x`.
pub fn identity(x: ArrayView4<'_, f64>) -> Array4<f64> {
    let n = x.dim().3;
    Array4::from_shape_fn((1, 1, n, n), |(_, _, i, j)| if i == j { 1.0 } else { 0.0 })
}

/// Per-block matrix inverse. Singular blocks come back filled with NaN.
///
/// # Panics
/// If the sector block is not square.
pub fn inverse(x: ArrayView4<'_, f64>) -> Array4<f64> {
    let (runs, regions, n, m) = x.dim();
    assert_eq!(n, m, "inverse: sector block is {n}x{m}, not square");

    let mut out = Array4::from_elem((runs, regions, n, n), f64::NAN);
    for xi in 0..runs {
        for r in 0..regions {
            let block = x.slice(s![xi, r, .., ..]);
            let matrix = DMatrix::from_fn(n, n, |i, j| block[(i, j)]);
            match matrix.try_inverse() {
                Some(inv) => {
                    let mut target = out.slice_mut(s![xi, r, .., ..]);
                    for ((i, j), value) in target.indexed_iter_mut() {
                        *value = inv[(i, j)];
                    }
                }
                None => warn!(run = xi, region = r, size = n, "singular sector block"),
            }
        }
    }
    out
}

/// Pairwise distances between sector positions: `Z_ij = sqrt((x_i-x_j)^2 + (y_i-y_j)^2)`.
pub fn distance_xy(x: ArrayView4<'_, f64>, y: ArrayView4<'_, f64>) -> Array4<f64> {
    let dx = &x - &transpose(x);
    let dy = &y - &transpose(y);
    (&dx * &dx + &dy * &dy).mapv(f64::sqrt)
}

fn broadcast_len(a: usize, b: usize, axis: &str) -> usize {
    match (a, b) {
        (a, b) if a == b => a,
        (1, b) => b,
        (a, 1) => a,
        (a, b) => panic!("cannot broadcast {axis} axes of length {a} and {b}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(values: &[f64]) -> Array4<f64> {
        Array4::from_shape_vec((1, 1, values.len(), 1), values.to_vec()).unwrap()
    }

    fn matrix(n: usize, values: &[f64]) -> Array4<f64> {
        Array4::from_shape_vec((1, 1, n, values.len() / n), values.to_vec()).unwrap()
    }

    #[test]
    fn sprod_is_a_dot_product() {
        let z = sprod(column(&[1.0, 2.0, 3.0]).view(), column(&[4.0, 5.0, 6.0]).view());
        assert_eq!(z.dim(), (1, 1, 1, 1));
        assert_eq!(z[(0, 0, 0, 0)], 32.0);
    }

    #[test]
    fn sums_follow_their_axis() {
        let m = matrix(2, &[1.0, 2.0, 3.0, 4.0]);
        let rows = ssum2(m.view());
        assert_eq!(rows.dim(), (1, 1, 2, 1));
        assert_eq!(rows[(0, 0, 1, 0)], 7.0);

        let cols = ssum(m.view());
        assert_eq!(cols.dim(), (1, 1, 2, 1));
        assert_eq!(cols[(0, 0, 0, 0)], 4.0);
        assert_eq!(cols[(0, 0, 1, 0)], 6.0);

        let total = ssum(column(&[1.0, 2.0, 3.0]).view());
        assert_eq!(total.dim(), (1, 1, 1, 1));
        assert_eq!(total[(0, 0, 0, 0)], 6.0);
    }

    #[test]
    fn ssum_of_a_wide_matrix_is_a_column_over_sector_b() {
        let wide = Array4::from_shape_vec((1, 1, 2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let z = ssum(wide.view());
        assert_eq!(z.dim(), (1, 1, 3, 1));
        assert_eq!(z.iter().copied().collect::<Vec<_>>(), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn matmul_broadcasts_over_runs() {
        let m = matrix(2, &[0.0, 1.0, 1.0, 0.0]);
        let v = Array4::from_shape_vec((2, 1, 2, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let z = matmul(m.view(), v.view());
        assert_eq!(z.dim(), (2, 1, 2, 1));
        assert_eq!(z[(0, 0, 0, 0)], 2.0);
        assert_eq!(z[(1, 0, 1, 0)], 3.0);
    }

    #[test]
    #[should_panic(expected = "inner sector lengths differ")]
    fn matmul_rejects_misaligned_sectors() {
        matmul(matrix(2, &[1.0; 4]).view(), column(&[1.0, 2.0, 3.0]).view());
    }

    #[test]
    fn inverse_times_matrix_is_identity() {
        let m = matrix(2, &[4.0, 7.0, 2.0, 6.0]);
        let inv = inverse(m.view());
        let product = matmul(m.view(), inv.view());
        let eye = identity(m.view());
        for (a, b) in product.iter().zip(eye.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn singular_block_becomes_nan() {
        let inv = inverse(matrix(2, &[1.0, 2.0, 2.0, 4.0]).view());
        assert!(inv.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn region_sum_collapses_regions() {
        let x = Array4::from_shape_vec((1, 3, 1, 1), vec![1.0, 2.0, 4.0]).unwrap();
        let z = ssum_regions(x.view());
        assert_eq!(z.dim(), (1, 1, 1, 1));
        assert_eq!(z[(0, 0, 0, 0)], 7.0);
    }

    #[test]
    fn distances_are_symmetric() {
        let x = column(&[0.0, 3.0]);
        let y = column(&[0.0, 4.0]);
        let d = distance_xy(x.view(), y.view());
        assert_eq!(d.dim(), (1, 1, 2, 2));
        assert_eq!(d[(0, 0, 0, 1)], 5.0);
        assert_eq!(d[(0, 0, 1, 0)], 5.0);
        assert_eq!(d[(0, 0, 0, 0)], 0.0);
    }
}
