use approx::assert_relative_eq;
use cds_mvsnet::{
    correlate, softmax_depth, CameraPair, Conv3dRegularizer, DepthMode, DepthNet,
    DepthRangeSampler, FeatureMap, Stage, ViewContribution, ViewPair, VisibilityNet,
};
use nalgebra::{Matrix3, Vector3};
use ndarray::{arr1, Array1, Array2, Array3, Array4, Array5, Axis};
use quickcheck::TestResult;
use quickcheck_macros::quickcheck;
use rand::SeedableRng;
use rand_pcg::Pcg64;

fn bounded(values: &[f32]) -> bool {
    values.iter().all(|v| v.is_finite() && v.abs() < 1e4)
}

#[quickcheck]
fn softmax_is_a_distribution(scores: Vec<f32>) -> TestResult {
    if scores.is_empty() || !bounded(&scores) {
        return TestResult::discard();
    }
    let n = scores.len();
    let volume = Array4::from_shape_vec((1, n, 1, 1), scores).unwrap();
    let prob = softmax_depth(volume.view());
    let sum = prob.sum();
    TestResult::from_bool((sum - 1.0).abs() < 1e-4 && prob.iter().all(|&p| p >= 0.0))
}

#[quickcheck]
fn window_scale_is_monotonic(a: f32, b: f32) -> TestResult {
    if !a.is_finite() || !b.is_finite() {
        return TestResult::discard();
    }
    let sampler = DepthRangeSampler::default();
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    TestResult::from_bool(sampler.window_scale(lo) <= sampler.window_scale(hi))
}

#[quickcheck]
fn windows_stay_inside_the_range(centers: Vec<f32>, uncertainty: Vec<f32>, interval: u8) -> TestResult {
    if centers.is_empty() || uncertainty.len() < centers.len() {
        return TestResult::discard();
    }
    let n = centers.len();
    let current = Array3::from_shape_vec((1, 1, n), centers).unwrap();
    let uncertainty = Array3::from_shape_vec((1, 1, n), uncertainty[..n].to_vec()).unwrap();
    let step = 0.25 + interval as f32;
    let range = DepthRangeSampler::default()
        .around(
            current.view(),
            8,
            arr1(&[step]).view(),
            Some(uncertainty.view()),
            arr1(&[10.0]).view(),
            arr1(&[100.0]).view(),
        )
        .unwrap();
    let ok = range.samples.lanes(Axis(1)).into_iter().all(|lane| {
        lane.iter().all(|&d| (10.0..=100.0).contains(&d))
            && lane.windows(2).into_iter().all(|w| w[1] > w[0])
    });
    TestResult::from_bool(ok)
}

fn product(seed: f32) -> Array5<f32> {
    Array5::from_shape_fn((1, 3, 4, 2, 3), |(_, c, d, y, x)| {
        (seed * 1.7 + c as f32 - 0.4 * d as f32 + 0.9 * y as f32 - x as f32).cos()
    })
}

#[quickcheck]
fn aggregation_ignores_view_order(weights: Vec<u8>) -> TestResult {
    if weights.len() < 2 || weights.len() > 6 {
        return TestResult::discard();
    }
    let contributions = |order: &mut dyn Iterator<Item = usize>| {
        order
            .map(|v| {
                ViewContribution::new(
                    product(v as f32),
                    Array3::from_elem((1, 2, 3), weights[v] as f32 / 255.0),
                    arr1(&[v as f32]),
                    None,
                )
                .unwrap()
            })
            .reduce(ViewContribution::combine)
            .unwrap()
            .finish()
            .unwrap()
    };
    let forward = contributions(&mut (0..weights.len()));
    let backward = contributions(&mut (0..weights.len()).rev());
    let close = forward
        .volume
        .iter()
        .zip(backward.volume.iter())
        .all(|(a, b)| (a - b).abs() < 1e-4);
    TestResult::from_bool(close && (forward.norm_curvature[0] - backward.norm_curvature[0]).abs() < 1e-5)
}

#[test]
fn fully_visible_single_view_is_the_raw_product() {
    let reference = Array4::from_shape_fn((1, 3, 2, 3), |(_, c, y, x)| 0.5 + (c + y * x) as f32);
    let warped = product(0.3);
    let raw = correlate(reference.view(), warped.clone()).unwrap();
    let aggregation = ViewContribution::new(
        raw.clone(),
        Array3::ones((1, 2, 3)),
        Array1::zeros(1),
        None,
    )
    .unwrap()
    .finish()
    .unwrap();
    for (&a, &r) in aggregation.volume.iter().zip(raw.iter()) {
        assert_relative_eq!(a, r, epsilon = 1e-4, max_relative = 1e-5);
    }
}

#[test]
fn stage_ignores_source_view_order() {
    let mut rng = Pcg64::seed_from_u64(21);
    let stage = Stage::new(
        0,
        6,
        1.0,
        VisibilityNet::new(&mut rng),
        DepthNet::new(DepthMode::Unification),
        None,
    );
    let regularizer = Conv3dRegularizer::new(4, 4, &mut rng);
    let k = Matrix3::new(10.0, 0.0, 5.0, 0.0, 10.0, 4.0, 0.0, 0.0, 1.0);
    let camera = |tx: f64| CameraPair::from_parts(k, Matrix3::identity(), Vector3::new(tx, 0.0, 0.0));
    let map = |seed: f32| FeatureMap {
        features: Array4::from_shape_fn((1, 4, 8, 10), |(_, c, y, x)| {
            (seed + 0.7 * c as f32 + 0.5 * x as f32 - 0.2 * y as f32).sin()
        }),
        nc_sum: arr1(&[seed]),
        nc_map: Array3::from_shape_fn((1, 8, 10), |(_, y, x)| ((y + x) % 4) as f32 * 0.2),
    };
    let (reference, left, right) = (map(0.0), map(0.4), map(1.1));
    let (to_left, to_right) = (
        ViewPair {
            reference: &reference,
            source: &left,
        },
        ViewPair {
            reference: &reference,
            source: &right,
        },
    );
    let range = DepthRangeSampler::default()
        .uniform(arr1(&[2.0]).view(), arr1(&[12.0]).view(), 6, 8, 10)
        .unwrap();
    let projections = |order: [f64; 3]| Array2::from_shape_fn((1, 3), |(_, v)| camera(order[v]));

    let a = stage
        .forward(
            &[to_left, to_right],
            projections([0.0, -0.3, 0.2]).view(),
            &range,
            &regularizer,
            None,
        )
        .unwrap();
    let b = stage
        .forward(
            &[to_right, to_left],
            projections([0.0, 0.2, -0.3]).view(),
            &range,
            &regularizer,
            None,
        )
        .unwrap();
    for (x, y) in a.depth.iter().zip(b.depth.iter()) {
        assert_relative_eq!(x, y, epsilon = 1e-3);
    }
    for (x, y) in a.prob_volume.iter().zip(b.prob_volume.iter()) {
        assert_relative_eq!(x, y, epsilon = 1e-5);
    }
}
