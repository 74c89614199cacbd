//! Principal component projection of (weighted) pose rows.

use nalgebra::{DMatrix, SymmetricEigen};

use crate::math::KINDA_SMALL_NUMBER;

#[derive(Clone, Debug, PartialEq)]
pub struct PcaProjection {
    pub num_dimensions: usize,
    pub num_components: usize,
    pub mean: Vec<f32>,
    /// Column-major `num_dimensions × num_components`, most significant component first.
    pub projection: Vec<f32>,
    /// Share of the total variance kept by the selected components.
    pub explained_variance: f32,
}

impl PcaProjection {
    /// Fits over row-major `rows` (`num_rows × num_dimensions`) and returns the projection
    /// together with the projected rows (`num_rows × num_components`).
    pub fn fit(
        rows: &[f32],
        num_rows: usize,
        num_dimensions: usize,
        num_components: usize,
    ) -> Option<(Self, Vec<f32>)> {
        let num_components = num_components.min(num_dimensions);
        if num_rows == 0 || num_components == 0 || rows.len() != num_rows * num_dimensions {
            return None;
        }

        let data = DMatrix::from_row_slice(num_rows, num_dimensions, rows).map(|v| v as f64);
        let mean = data.row_mean();
        let mut centered = data;
        for mut row in centered.row_iter_mut() {
            row -= &mean;
        }

        let covariance =
            (centered.transpose() * &centered) / (num_rows.saturating_sub(1).max(1)) as f64;
        let eigen = SymmetricEigen::new(covariance);

        let mut order: Vec<usize> = (0..num_dimensions).collect();
        order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
        let selected = &order[..num_components];

        let projection = DMatrix::from_columns(
            &selected
                .iter()
                .map(|&i| eigen.eigenvectors.column(i).into_owned())
                .collect::<Vec<_>>(),
        );
        let total_variance: f64 = eigen.eigenvalues.iter().sum();
        let kept_variance: f64 = selected.iter().map(|&i| eigen.eigenvalues[i]).sum();
        let explained_variance = if total_variance > KINDA_SMALL_NUMBER as f64 {
            (kept_variance / total_variance) as f32
        } else {
            0.0
        };

        let projected = &centered * &projection;
        let mut projected_rows = Vec::with_capacity(num_rows * num_components);
        for row in projected.row_iter() {
            projected_rows.extend(row.iter().map(|v| *v as f32));
        }

        Some((
            Self {
                num_dimensions,
                num_components,
                mean: mean.iter().map(|v| *v as f32).collect(),
                projection: projection.iter().map(|v| *v as f32).collect(),
                explained_variance,
            },
            projected_rows,
        ))
    }

    /// `(row − mean) · P`
    pub fn project(&self, row: &[f32]) -> Vec<f32> {
        let n = self.num_dimensions;
        (0..self.num_components)
            .map(|component| {
                let column = &self.projection[component * n..(component + 1) * n];
                row.iter()
                    .zip(&self.mean)
                    .zip(column)
                    .map(|((v, m), p)| (v - m) * p)
                    .sum()
            })
            .collect()
    }

    /// `point · Pᵀ + mean`
    pub fn unproject(&self, point: &[f32]) -> Vec<f32> {
        let n = self.num_dimensions;
        let mut row = self.mean.clone();
        for (component, &coefficient) in point.iter().enumerate().take(self.num_components) {
            let column = &self.projection[component * n..(component + 1) * n];
            for (r, p) in row.iter_mut().zip(column) {
                *r += coefficient * p;
            }
        }
        row
    }

    /// Squared error of projecting and unprojecting `row`.
    pub fn reconstruction_error(&self, row: &[f32]) -> f32 {
        self.unproject(&self.project(row))
            .iter()
            .zip(row)
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}
