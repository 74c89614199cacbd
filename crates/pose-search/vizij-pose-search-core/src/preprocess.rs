//! Statistical conditioning of the pose table: identity, per-feature normalization by mean
//! deviation, or ZCA sphering.

use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::index::PreprocessInfo;
use crate::layout::FeatureLayout;
use crate::math::KINDA_SMALL_NUMBER;
use crate::schema::DataPreprocessor;

/// Regularization added to covariance and eigenvalues when sphering.
const SPHERE_EPSILON: f64 = 1e-7;

/// Transforms the row-major `num_poses × layout.num_floats` table in place and returns the
/// transform that maps queries into the same space.
pub fn preprocess(
    values: &mut [f32],
    num_poses: usize,
    layout: &FeatureLayout,
    preprocessor: DataPreprocessor,
) -> PreprocessInfo {
    let num_dimensions = layout.num_floats;
    if num_poses == 0 || num_dimensions == 0 || values.len() != num_poses * num_dimensions {
        return PreprocessInfo::identity(num_dimensions);
    }
    match preprocessor.effective() {
        DataPreprocessor::Normalize => normalize(values, num_poses, layout),
        DataPreprocessor::Sphere => sphere(values, num_poses, layout),
        _ => PreprocessInfo::identity(num_dimensions),
    }
}

/// Column-per-pose `N × P` matrix in f64.
fn pose_matrix(values: &[f32], num_poses: usize, num_dimensions: usize) -> DMatrix<f64> {
    DMatrix::from_fn(num_dimensions, num_poses, |d, p| {
        values[p * num_dimensions + d] as f64
    })
}

fn write_back(values: &mut [f32], matrix: &DMatrix<f64>) {
    let num_dimensions = matrix.nrows();
    for (p, column) in matrix.column_iter().enumerate() {
        for (d, v) in column.iter().enumerate() {
            values[p * num_dimensions + d] = *v as f32;
        }
    }
}

fn center(matrix: &mut DMatrix<f64>) -> DVector<f64> {
    let mean = matrix.column_mean();
    for mut column in matrix.column_iter_mut() {
        column -= &mean;
    }
    mean
}

/// Mean norm of each feature's sub-vector over all (centered) poses, replicated over the
/// feature's floats. Near-zero deviations stay at 1.
fn feature_mean_deviations(centered: &DMatrix<f64>, layout: &FeatureLayout) -> DVector<f64> {
    let num_poses = centered.ncols();
    let mut deviations = DVector::from_element(centered.nrows(), 1.0);
    for feature in &layout.features {
        let size = feature.num_floats();
        let offset = feature.value_offset;
        let block = centered.rows(offset, size);
        let mean_norm = block.column_iter().map(|c| c.norm()).sum::<f64>() / num_poses as f64;
        if mean_norm > KINDA_SMALL_NUMBER as f64 {
            deviations.rows_mut(offset, size).fill(mean_norm);
        }
    }
    deviations
}

fn to_info(transform: &DMatrix<f64>, inverse: &DMatrix<f64>, mean: &DVector<f64>) -> PreprocessInfo {
    // nalgebra storage is column-major already
    PreprocessInfo {
        num_dimensions: mean.len(),
        transformation: transform.iter().map(|v| *v as f32).collect(),
        inverse_transformation: inverse.iter().map(|v| *v as f32).collect(),
        sample_mean: mean.iter().map(|v| *v as f32).collect(),
    }
}

fn normalize(values: &mut [f32], num_poses: usize, layout: &FeatureLayout) -> PreprocessInfo {
    let mut matrix = pose_matrix(values, num_poses, layout.num_floats);
    let mean = center(&mut matrix);
    let deviations = feature_mean_deviations(&matrix, layout);

    let scaling = DMatrix::from_diagonal(&deviations.map(|d| 1.0 / d));
    let inverse_scaling = DMatrix::from_diagonal(&deviations);
    let normalized = &scaling * &matrix;
    write_back(values, &normalized);
    to_info(&scaling, &inverse_scaling, &mean)
}

fn sphere(values: &mut [f32], num_poses: usize, layout: &FeatureLayout) -> PreprocessInfo {
    let num_dimensions = layout.num_floats;
    let mut matrix = pose_matrix(values, num_poses, num_dimensions);
    let mean = center(&mut matrix);
    let deviations = feature_mean_deviations(&matrix, layout);
    let inverse_deviations = deviations.map(|d| 1.0 / d);

    let normalized = DMatrix::from_diagonal(&inverse_deviations) * &matrix;
    let covariance = (&normalized * normalized.transpose()) / num_poses as f64
        + DMatrix::identity(num_dimensions, num_dimensions) * SPHERE_EPSILON;
    let inverse_std = DMatrix::from_diagonal(&covariance.diagonal().map(|v| 1.0 / v.sqrt()));
    let correlation = &inverse_std * &covariance * &inverse_std;

    let eigen = SymmetricEigen::new(correlation);
    let mut order: Vec<usize> = (0..num_dimensions).collect();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .abs()
            .total_cmp(&eigen.eigenvalues[a].abs())
    });
    let eigenvalues = DVector::from_iterator(
        num_dimensions,
        order.iter().map(|&i| eigen.eigenvalues[i] + SPHERE_EPSILON),
    );
    let eigenvectors = DMatrix::from_columns(
        &order
            .iter()
            .map(|&i| eigen.eigenvectors.column(i).into_owned())
            .collect::<Vec<_>>(),
    );

    let zca = &eigenvectors
        * DMatrix::from_diagonal(&eigenvalues.map(|v| 1.0 / v.sqrt()))
        * eigenvectors.transpose()
        * DMatrix::from_diagonal(&inverse_deviations);
    let zca_inverse = DMatrix::from_diagonal(&deviations)
        * &eigenvectors
        * DMatrix::from_diagonal(&eigenvalues.map(f64::sqrt))
        * eigenvectors.transpose();

    let sphered = &zca * &matrix;
    write_back(values, &sphered);
    to_info(&zca, &zca_inverse, &mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{FeatureDescriptor, FeatureType};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn mk_layout() -> FeatureLayout {
        let mut layout = FeatureLayout::default();
        layout.add(FeatureDescriptor::new(0, 0, 0, FeatureType::Position));
        layout.add(FeatureDescriptor::new(0, 0, 0, FeatureType::LinearVelocity));
        layout.finalize();
        layout
    }

    fn mk_table(num_poses: usize) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(7);
        (0..num_poses * 6)
            .map(|i| {
                let scale = if i % 6 < 3 { 10.0 } else { 0.5 };
                rng.gen_range(-1.0..1.0) * scale + (i % 6) as f32
            })
            .collect()
    }

    fn assert_round_trips(preprocessor: DataPreprocessor) {
        let layout = mk_layout();
        let original = mk_table(40);
        let mut values = original.clone();
        let info = preprocess(&mut values, 40, &layout, preprocessor);
        assert!(info.is_valid());
        for pose in 0..40 {
            let raw = &original[pose * 6..(pose + 1) * 6];
            let forward = info.forward(raw);
            for (a, b) in forward.iter().zip(&values[pose * 6..(pose + 1) * 6]) {
                assert_relative_eq!(a, b, epsilon = 1e-3);
            }
            let back = info.inverse(&forward);
            for (a, b) in back.iter().zip(raw) {
                assert_relative_eq!(a, b, epsilon = 1e-3, max_relative = 1e-3);
            }
        }
    }

    #[test]
    fn normalize_round_trips() {
        assert_round_trips(DataPreprocessor::Normalize);
    }

    #[test]
    fn sphere_round_trips() {
        assert_round_trips(DataPreprocessor::Sphere);
    }

    #[test]
    fn normalize_gives_unit_mean_feature_length() {
        let layout = mk_layout();
        let mut values = mk_table(50);
        preprocess(&mut values, 50, &layout, DataPreprocessor::Automatic);
        for feature in &layout.features {
            let mean_norm: f32 = (0..50)
                .map(|p| {
                    let o = p * 6 + feature.value_offset;
                    (values[o].powi(2) + values[o + 1].powi(2) + values[o + 2].powi(2)).sqrt()
                })
                .sum::<f32>()
                / 50.0;
            assert_relative_eq!(mean_norm, 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn constant_features_are_left_unscaled() {
        let layout = mk_layout();
        let mut values = vec![2.0; 4 * 6];
        let info = preprocess(&mut values, 4, &layout, DataPreprocessor::Normalize);
        assert!(values.iter().all(|v| *v == 0.0));
        assert_eq!(info.transformation[0], 1.0);
        assert_eq!(info.sample_mean, vec![2.0; 6]);
    }

    #[test]
    fn none_is_identity() {
        let layout = mk_layout();
        let original = mk_table(5);
        let mut values = original.clone();
        let info = preprocess(&mut values, 5, &layout, DataPreprocessor::None);
        assert_eq!(values, original);
        assert_eq!(info, PreprocessInfo::identity(6));
    }
}
