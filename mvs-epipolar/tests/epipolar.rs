use approx::assert_relative_eq;
use mvs_epipolar::{epipole, fundamental_matrix, CameraPair, FundamentalMatrix};
use nalgebra::{Matrix3, Rotation3, Vector3, Vector4};

const RESIDUAL_THRESHOLD: f64 = 1e-9;

fn intrinsics() -> Matrix3<f64> {
    Matrix3::new(361.5, 0.0, 82.9, 0.0, 360.4, 66.4, 0.0, 0.0, 1.0)
}

fn some_cameras() -> Vec<CameraPair> {
    vec![
        CameraPair::from_parts(intrinsics(), Matrix3::identity(), Vector3::new(0.0, 0.0, 5.0)),
        CameraPair::from_parts(
            intrinsics(),
            *Rotation3::from_euler_angles(0.02, -0.15, 0.01).matrix(),
            Vector3::new(0.6, 0.05, 5.1),
        ),
        CameraPair::from_parts(
            intrinsics(),
            *Rotation3::from_euler_angles(-0.05, 0.12, -0.03).matrix(),
            Vector3::new(-0.4, 0.3, 4.8),
        ),
    ]
}

fn some_points() -> Vec<Vector4<f64>> {
    (0..20)
        .map(|i| {
            let t = i as f64;
            Vector4::new(
                (t * 0.37).sin() * 0.8,
                (t * 0.21).cos() * 0.6,
                (t * 0.13).sin() * 0.5,
                1.0,
            )
        })
        .collect()
}

#[test]
fn correspondences_satisfy_constraint() {
    let cameras = some_cameras();
    let reference = &cameras[0];
    for source in &cameras[1..] {
        let f = fundamental_matrix(reference, source).expect("cameras have a baseline");
        let f = FundamentalMatrix(f.0 / f.0.norm());
        for point in some_points() {
            let a = reference.camera_matrix().project(point).unwrap();
            let b = source.camera_matrix().project(point).unwrap();
            let scale = a.coords.norm() * b.coords.norm();
            assert!(f.residual(a, b).abs() / scale < RESIDUAL_THRESHOLD);
        }
    }
}

#[test]
fn epipoles_are_projected_centers() {
    let cameras = some_cameras();
    let reference = cameras[0].camera_matrix();
    for source in &cameras[1..] {
        let source = source.camera_matrix();
        let f = FundamentalMatrix::from_cameras(&reference, &source).unwrap();

        let expected_ref = (reference.projection() * source.center().unwrap()).normalize();
        let expected_ref = if expected_ref.z < 0.0 { -expected_ref } else { expected_ref };
        assert_relative_eq!(epipole(&f).unwrap(), expected_ref, epsilon = 1e-6);

        let expected_src = (source.projection() * reference.center().unwrap()).normalize();
        let expected_src = if expected_src.z < 0.0 { -expected_src } else { expected_src };
        assert_relative_eq!(epipole(&f.transpose()).unwrap(), expected_src, epsilon = 1e-6);
    }
}

#[test]
fn relative_transform_maps_reference_pixels() {
    let cameras = some_cameras();
    let reference = cameras[0].camera_matrix();
    let source = cameras[1].camera_matrix();
    let relative = source.relative_to(&reference).unwrap();
    for point in some_points() {
        let in_ref = reference.0 * point;
        let in_src = relative * in_ref;
        let expected = source.0 * point;
        assert_relative_eq!(in_src, expected, epsilon = 1e-9);
    }
}
