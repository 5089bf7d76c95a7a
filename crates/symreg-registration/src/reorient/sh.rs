//! Real, even-order spherical harmonic basis.
//!
//! Coefficients of band `l` are stored for `m = -l..=l`, bands in increasing
//! order of even `l`, so the coefficient `(l, m)` sits at
//! `l(l+1)/2 + m`. Negative `m` use `sin(|m| phi)`, positive `m` use
//! `cos(m phi)`, both scaled by `sqrt(2)`.

use std::f64::consts::PI;

use nalgebra::Vector3;

/// Number of coefficients of an even-order series up to `lmax`.
pub fn n_for_l(lmax: usize) -> usize {
    (lmax + 1) * (lmax + 2) / 2
}

/// Largest even order whose coefficient count fits in `n`.
pub fn l_for_n(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let l = ((1.0 + 8.0 * n as f64).sqrt() - 3.0) / 4.0;
    2 * (l + 1e-9).floor() as usize
}

/// Whether `n` is exactly the coefficient count of some even order.
pub fn is_sh_count(n: usize) -> bool {
    let l = ((1.0 + 8.0 * n as f64).sqrt() - 3.0) / 4.0;
    (l - l.round()).abs() < 1e-9
}

/// Storage index of coefficient `(l, m)`.
#[inline]
pub fn index(l: usize, m: i64) -> usize {
    ((l * (l + 1) / 2) as i64 + m) as usize
}

/// Associated Legendre functions `P_l^m(x)` for `0 <= m <= l <= lmax`,
/// with the Condon-Shortley phase. Entry `[l][m]`.
fn legendre(lmax: usize, x: f64) -> Vec<Vec<f64>> {
    let mut p = vec![vec![0.0; lmax + 1]; lmax + 1];
    let s = (1.0 - x * x).max(0.0).sqrt();
    let mut pmm = 1.0;
    for m in 0..=lmax {
        if m > 0 {
            pmm *= -((2 * m - 1) as f64) * s;
        }
        p[m][m] = pmm;
        if m < lmax {
            p[m + 1][m] = x * (2 * m + 1) as f64 * pmm;
        }
        for l in (m + 2)..=lmax {
            p[l][m] = ((2 * l - 1) as f64 * x * p[l - 1][m] - (l + m - 1) as f64 * p[l - 2][m]) / (l - m) as f64;
        }
    }
    p
}

/// `sqrt((2l+1)/(4 pi) * (l-m)!/(l+m)!)`
fn normalisation(l: usize, m: usize) -> f64 {
    let ratio: f64 = ((l - m + 1)..=(l + m)).map(|k| 1.0 / k as f64).product();
    ((2 * l + 1) as f64 / (4.0 * PI) * ratio).sqrt()
}

/// Basis values at a unit direction, `n_for_l(lmax)` entries.
pub fn basis(lmax: usize, direction: &Vector3<f64>) -> Vec<f64> {
    let z = direction[2].clamp(-1.0, 1.0);
    let phi = direction[1].atan2(direction[0]);
    let p = legendre(lmax, z);
    let mut out = vec![0.0; n_for_l(lmax)];
    for l in (0..=lmax).step_by(2) {
        out[index(l, 0)] = normalisation(l, 0) * p[l][0];
        for m in 1..=l {
            let k = std::f64::consts::SQRT_2 * normalisation(l, m) * p[l][m];
            let mi = m as i64;
            out[index(l, mi)] = k * (m as f64 * phi).cos();
            out[index(l, -mi)] = k * (m as f64 * phi).sin();
        }
    }
    out
}
