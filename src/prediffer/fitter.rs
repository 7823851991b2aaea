// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Least-squares normal equations.

use ndarray::prelude::*;

use super::FitterError;
use crate::c64;

/// Accumulates the normal equations `A^T W A x = A^T W r` for a set of real
/// unknowns, one equation at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct Fitter {
    normal: Array2<f64>,
    rhs: Array1<f64>,
    num_equations: usize,
}

impl Fitter {
    pub fn new(num_unknowns: usize) -> Fitter {
        Fitter {
            normal: Array2::zeros((num_unknowns, num_unknowns)),
            rhs: Array1::zeros(num_unknowns),
            num_equations: 0,
        }
    }

    pub fn num_unknowns(&self) -> usize {
        self.rhs.len()
    }

    pub fn num_equations(&self) -> usize {
        self.num_equations
    }

    pub fn normal_matrix(&self) -> ArrayView2<f64> {
        self.normal.view()
    }

    pub fn rhs(&self) -> ArrayView1<f64> {
        self.rhs.view()
    }

    pub fn reset(&mut self) {
        self.normal.fill(0.0);
        self.rhs.fill(0.0);
        self.num_equations = 0;
    }

    /// Add one real equation. `derivs` holds (unknown, partial derivative)
    /// pairs; unknowns not listed have zero derivative. An unknown may be
    /// listed more than once, in which case its partials add.
    pub fn add_equation(&mut self, derivs: &[(usize, f64)], residual: f64, weight: f64) {
        for &(i, di) in derivs {
            let wdi = weight * di;
            self.rhs[i] += wdi * residual;
            for &(j, dj) in derivs {
                self.normal[(i, j)] += wdi * dj;
            }
        }
        self.num_equations += 1;
    }

    /// Add the two real equations (real and imaginary parts) of a complex
    /// residual with complex partial derivatives.
    pub fn add_complex_equation(&mut self, derivs: &[(usize, c64)], residual: c64, weight: f64) {
        for &(i, di) in derivs {
            self.rhs[i] += weight * (di.re * residual.re + di.im * residual.im);
            for &(j, dj) in derivs {
                self.normal[(i, j)] += weight * (di.re * dj.re + di.im * dj.im);
            }
        }
        self.num_equations += 2;
    }

    /// Fold another fitter's equations into this one.
    pub fn merge(&mut self, other: &Fitter) -> Result<(), FitterError> {
        if other.num_unknowns() != self.num_unknowns() {
            return Err(FitterError::SizeMismatch {
                expected: self.num_unknowns(),
                got: other.num_unknowns(),
            });
        }
        self.normal += &other.normal;
        self.rhs += &other.rhs;
        self.num_equations += other.num_equations;
        Ok(())
    }

    /// Solve for the unknowns with Levenberg damping: each diagonal element
    /// is scaled by `1 + damping`. Unknowns that no equation touches get
    /// `damping` on the diagonal and come out as zero.
    pub fn solve(&self, damping: f64) -> Result<Array1<f64>, FitterError> {
        let n = self.num_unknowns();
        let mut m = self.normal.clone();
        for i in 0..n {
            let d = m[(i, i)];
            m[(i, i)] = if d > 0.0 { d * (1.0 + damping) } else { damping };
        }

        // Cholesky decomposition in place; the lower triangle becomes L.
        for j in 0..n {
            let mut pivot = m[(j, j)];
            for k in 0..j {
                pivot -= m[(j, k)] * m[(j, k)];
            }
            if pivot.is_nan() || pivot <= 0.0 {
                return Err(FitterError::NotPositiveDefinite { index: j, pivot });
            }
            let l_jj = pivot.sqrt();
            m[(j, j)] = l_jj;
            for i in j + 1..n {
                let mut s = m[(i, j)];
                for k in 0..j {
                    s -= m[(i, k)] * m[(j, k)];
                }
                m[(i, j)] = s / l_jj;
            }
        }

        // Forward then back substitution.
        let mut x = self.rhs.clone();
        for i in 0..n {
            for k in 0..i {
                x[i] -= m[(i, k)] * x[k];
            }
            x[i] /= m[(i, i)];
        }
        for i in (0..n).rev() {
            for k in i + 1..n {
                x[i] -= m[(k, i)] * x[k];
            }
            x[i] /= m[(i, i)];
        }
        Ok(x)
    }
}
