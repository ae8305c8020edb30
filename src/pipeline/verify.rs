//! Spatial verification of correspondences with RANSAC.
//!
//! A 2D transform from query to gallery keypoint coordinates is estimated per
//! gallery annotation. Correspondences that disagree with the best-supported
//! transform are discarded.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use rand::{rngs::StdRng, seq::index::sample, SeedableRng};

use crate::chipmatch::ChipMatch;
use crate::config::{ResolvedParams, SvTransform};
use crate::features::FeatureStore;
use crate::types::{FeatureSet, Keypoint};
use crate::Result;

/// Configuration for the RANSAC transform estimator.
#[derive(Debug, Clone)]
pub struct SvConfig {
    pub transform: SvTransform,
    /// Inlier threshold as a fraction of the gallery keypoint extent diagonal.
    pub xy_thresh: f64,
    /// Minimum number of inliers for a transform to be accepted.
    pub min_inliers: usize,
    pub max_iterations: usize,
    pub seed: u64,
}

impl SvConfig {
    pub fn from_params(params: &ResolvedParams) -> Self {
        Self {
            transform: params.sv_transform,
            xy_thresh: params.sv_xy_thresh as f64,
            min_inliers: params.sv_min_inliers,
            max_iterations: params.sv_iterations,
            seed: params.sv_seed,
        }
    }
}

/// Result of a successful estimation.
#[derive(Debug, Clone)]
pub struct SvResult {
    /// Maps query coordinates to gallery coordinates.
    pub transform: Matrix3<f64>,
    /// Indices of inlier correspondences, ascending.
    pub inliers: Vec<usize>,
}

fn sample_size(transform: SvTransform) -> usize {
    match transform {
        SvTransform::Affine => 3,
        SvTransform::Homography => 4,
    }
}

/// Estimate a transform mapping `points1` onto `points2`.
///
/// # Arguments
/// * `points1` - query keypoint coordinates
/// * `points2` - corresponding gallery keypoint coordinates
/// * `threshold` - maximum transfer error of an inlier, in gallery units
///
/// # Returns
/// * `None` if no transform reaches `config.min_inliers`
pub fn estimate_transform_ransac(
    points1: &[(f64, f64)],
    points2: &[(f64, f64)],
    threshold: f64,
    config: &SvConfig,
    seed: u64,
) -> Option<SvResult> {
    let n = points1.len();
    let minimal = sample_size(config.transform);
    if n != points2.len() || n < minimal || n < config.min_inliers {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut best: Option<SvResult> = None;
    for _ in 0..config.max_iterations.max(1) {
        let indices = sample(&mut rng, n, minimal).into_vec();
        let src: Vec<(f64, f64)> = indices.iter().map(|&i| points1[i]).collect();
        let dst: Vec<(f64, f64)> = indices.iter().map(|&i| points2[i]).collect();
        let Some(model) = fit(config.transform, &src, &dst) else {
            continue;
        };
        let inliers = find_inliers(points1, points2, &model, threshold);
        if best.as_ref().map_or(true, |b| inliers.len() > b.inliers.len()) {
            best = Some(SvResult {
                transform: model,
                inliers,
            });
            if best.as_ref().map_or(false, |b| b.inliers.len() == n) {
                break;
            }
        }
    }

    // Refit on all inliers of the best model.
    if let Some(result) = best.as_mut() {
        if result.inliers.len() >= minimal {
            let src: Vec<(f64, f64)> = result.inliers.iter().map(|&i| points1[i]).collect();
            let dst: Vec<(f64, f64)> = result.inliers.iter().map(|&i| points2[i]).collect();
            if let Some(refined) = fit(config.transform, &src, &dst) {
                let refined_inliers = find_inliers(points1, points2, &refined, threshold);
                if refined_inliers.len() >= result.inliers.len() {
                    result.transform = refined;
                    result.inliers = refined_inliers;
                }
            }
        }
    }

    best.filter(|r| r.inliers.len() >= config.min_inliers)
}

fn fit(transform: SvTransform, src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Matrix3<f64>> {
    match transform {
        SvTransform::Affine => fit_affine(src, dst),
        SvTransform::Homography => fit_homography(src, dst),
    }
}

/// Least-squares affine transform.
fn fit_affine(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Matrix3<f64>> {
    let n = src.len();
    let design = DMatrix::from_fn(n, 3, |r, c| match c {
        0 => src[r].0,
        1 => src[r].1,
        _ => 1.0,
    });
    let bx = DVector::from_iterator(n, dst.iter().map(|p| p.0));
    let by = DVector::from_iterator(n, dst.iter().map(|p| p.1));

    let svd = design.svd(true, true);
    let max_sv = svd.singular_values.max();
    if max_sv <= 0.0 || svd.singular_values.min() / max_sv < 1e-9 {
        return None;
    }
    let ax = svd.solve(&bx, 1e-12).ok()?;
    let ay = svd.solve(&by, 1e-12).ok()?;
    Some(Matrix3::new(
        ax[0], ax[1], ax[2], //
        ay[0], ay[1], ay[2], //
        0.0, 0.0, 1.0,
    ))
}

/// Translate to the centroid and scale to a mean distance of sqrt(2).
fn normalizing_transform(points: &[(f64, f64)]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-12 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(
        s, 0.0, -s * cx, //
        0.0, s, -s * cy, //
        0.0, 0.0, 1.0,
    ))
}

fn apply(t: &Matrix3<f64>, p: (f64, f64)) -> Option<(f64, f64)> {
    let v = t * Vector3::new(p.0, p.1, 1.0);
    if v.z.abs() < 1e-12 {
        return None;
    }
    Some((v.x / v.z, v.y / v.z))
}

/// Normalized direct linear transform.
fn fit_homography(src: &[(f64, f64)], dst: &[(f64, f64)]) -> Option<Matrix3<f64>> {
    let t1 = normalizing_transform(src)?;
    let t2 = normalizing_transform(dst)?;
    let src_n: Vec<(f64, f64)> = src.iter().map(|&p| apply(&t1, p)).collect::<Option<_>>()?;
    let dst_n: Vec<(f64, f64)> = dst.iter().map(|&p| apply(&t2, p)).collect::<Option<_>>()?;

    let mut a = DMatrix::<f64>::zeros(2 * src.len(), 9);
    for (i, ((x, y), (u, v))) in src_n.iter().zip(dst_n.iter()).enumerate() {
        let r = 2 * i;
        a.row_mut(r)
            .copy_from_slice(&[-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, *u]);
        a.row_mut(r + 1)
            .copy_from_slice(&[0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, *v]);
    }

    // Null vector of A is the eigenvector of A^T A with the smallest eigenvalue.
    let ata = a.transpose() * &a;
    let eigen = ata.symmetric_eigen();
    let (min_idx, _) = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h = eigen.eigenvectors.column(min_idx);
    let h_n = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t2_inv = t2.try_inverse()?;
    let mut h = t2_inv * h_n * t1;
    let scale = h[(2, 2)];
    if scale.abs() < 1e-12 {
        return None;
    }
    h /= scale;
    Some(h)
}

fn find_inliers(
    points1: &[(f64, f64)],
    points2: &[(f64, f64)],
    model: &Matrix3<f64>,
    threshold: f64,
) -> Vec<usize> {
    let threshold_sq = threshold * threshold;
    points1
        .iter()
        .zip(points2.iter())
        .enumerate()
        .filter_map(|(i, (p1, p2))| {
            let (x, y) = apply(model, *p1)?;
            let error_sq = (x - p2.0).powi(2) + (y - p2.1).powi(2);
            (error_sq <= threshold_sq).then_some(i)
        })
        .collect()
}

/// Diagonal of the bounding box of `keypoints`.
pub fn extent_diagonal(keypoints: &[Keypoint]) -> f64 {
    if keypoints.is_empty() {
        return 0.0;
    }
    let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
    let (mut max_x, mut max_y) = (f64::MIN, f64::MIN);
    for kp in keypoints {
        min_x = min_x.min(kp.x as f64);
        min_y = min_y.min(kp.y as f64);
        max_x = max_x.max(kp.x as f64);
        max_y = max_y.max(kp.y as f64);
    }
    ((max_x - min_x).powi(2) + (max_y - min_y).powi(2)).sqrt()
}

/// Verify every gallery annotation of `cm` with enough correspondences.
///
/// Annotations below the minimum count, without a consensus transform, or
/// whose features cannot be read keep their unverified correspondences.
pub fn verify_chipmatch(
    cm: &mut ChipMatch,
    query: &FeatureSet,
    store: &dyn FeatureStore,
    config: &SvConfig,
) -> Result<()> {
    for dx in 0..cm.len() {
        if cm.fm[dx].len() < config.min_inliers.max(sample_size(config.transform)) {
            continue;
        }
        let daid = cm.daids[dx];
        let gallery = match store.get_descriptors(daid) {
            Ok(gallery) => gallery,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::warn!(daid, error = %err, "Cannot verify annotation; keeping matches");
                continue;
            }
        };

        let mut points1 = Vec::with_capacity(cm.fm[dx].len());
        let mut points2 = Vec::with_capacity(cm.fm[dx].len());
        for &(qfx, dfx) in &cm.fm[dx] {
            let (Some(q), Some(d)) = (query.keypoints.get(qfx), gallery.keypoints.get(dfx)) else {
                continue;
            };
            points1.push((q.x as f64, q.y as f64));
            points2.push((d.x as f64, d.y as f64));
        }
        if points1.len() != cm.fm[dx].len() {
            tracing::warn!(daid, "Correspondences reference missing keypoints; keeping matches");
            continue;
        }

        let threshold = (config.xy_thresh * extent_diagonal(&gallery.keypoints)).max(1e-6);
        let seed = config.seed ^ cm.qaid.rotate_left(32) ^ daid;
        match estimate_transform_ransac(&points1, &points2, threshold, config, seed) {
            Some(result) => {
                tracing::debug!(
                    qaid = cm.qaid,
                    daid,
                    before = points1.len(),
                    inliers = result.inliers.len(),
                    "Spatially verified"
                );
                cm.retain_correspondences(dx, &result.inliers);
                cm.homographies[dx] = Some(result.transform);
            }
            None => {
                tracing::debug!(qaid = cm.qaid, daid, "No consensus transform; keeping matches");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(transform: SvTransform) -> SvConfig {
        SvConfig {
            transform,
            xy_thresh: 0.01,
            min_inliers: 4,
            max_iterations: 200,
            seed: 0,
        }
    }

    fn translated_grid(dx: f64, dy: f64) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
        let mut src = Vec::new();
        let mut dst = Vec::new();
        for i in 0..5 {
            for j in 0..4 {
                let p = (i as f64 * 10.0 + j as f64, j as f64 * 12.0 + (i * i) as f64);
                src.push(p);
                dst.push((p.0 + dx, p.1 + dy));
            }
        }
        (src, dst)
    }

    #[test]
    fn affine_recovers_translation() {
        let (src, dst) = translated_grid(3.0, -2.0);
        let result =
            estimate_transform_ransac(&src, &dst, 0.5, &config(SvTransform::Affine), 1).unwrap();
        assert_eq!(result.inliers.len(), src.len());
        assert!((result.transform[(0, 2)] - 3.0).abs() < 1e-6);
        assert!((result.transform[(1, 2)] + 2.0).abs() < 1e-6);
    }

    #[test]
    fn homography_rejects_outliers() {
        let (mut src, mut dst) = translated_grid(5.0, 5.0);
        src.push((1.0, 1.0));
        dst.push((90.0, -40.0));
        src.push((20.0, 30.0));
        dst.push((-60.0, 70.0));
        let result =
            estimate_transform_ransac(&src, &dst, 0.5, &config(SvTransform::Homography), 3)
                .unwrap();
        assert_eq!(result.inliers.len(), 20);
        assert!(!result.inliers.contains(&20));
        assert!(!result.inliers.contains(&21));
    }

    #[test]
    fn too_few_correspondences_is_none() {
        let (src, dst) = translated_grid(1.0, 1.0);
        assert!(
            estimate_transform_ransac(&src[..3], &dst[..3], 0.5, &config(SvTransform::Affine), 0)
                .is_none()
        );
    }

    #[test]
    fn diagonal_of_extent() {
        let kps = vec![Keypoint::new(0.0, 0.0), Keypoint::new(3.0, 4.0)];
        assert!((extent_diagonal(&kps) - 5.0).abs() < 1e-9);
        assert_eq!(extent_diagonal(&[]), 0.0);
    }
}
