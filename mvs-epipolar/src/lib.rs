//! Two-view geometry for plane-sweep multi-view stereo.
//!
//! Multi-view stereo datasets describe every view with a pair of 4x4 matrices: the
//! extrinsic transform from world to camera and a 4x4 embedding of the 3x3 intrinsic
//! matrix. This crate turns such a [`CameraPair`] into a single [`CameraMatrix`], and
//! relates two cameras through their [`FundamentalMatrix`] and epipoles.
//!
//! The fundamental matrix `F` produced here satisfies
//!
//! ```text
//! transpose(x_src) * F * x_ref = 0
//! ```
//!
//! where `x_ref` and `x_src` are homogeneous pixel coordinates of the same 3d point
//! seen by the reference and the source camera. The right null vector of `F` is the
//! epipole in the reference image (the projection of the source optical center) and
//! the right null vector of `transpose(F)` is the epipole in the source image.
//!
//! ```
//! use mvs_epipolar::{CameraPair, FundamentalMatrix};
//! use nalgebra::{Matrix3, Vector3};
//!
//! let k = Matrix3::new(100.0, 0.0, 32.0, 0.0, 100.0, 32.0, 0.0, 0.0, 1.0);
//! let reference = CameraPair::from_parts(k, Matrix3::identity(), Vector3::zeros());
//! let source = CameraPair::from_parts(k, Matrix3::identity(), Vector3::new(-0.5, 0.0, 0.0));
//! let f = FundamentalMatrix::from_cameras(&reference.camera_matrix(), &source.camera_matrix()).unwrap();
//! // A sideways baseline puts the epipole at infinity along the x axis.
//! let epipole = f.epipole().unwrap();
//! assert!(epipole.z.abs() < 1e-9);
//! assert!((epipole.x.abs() - 1.0).abs() < 1e-9);
//! ```

use derive_more::{AsRef, Deref, From, Into};
use float_ord::FloatOrd;
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Point2, RowVector4, Vector3, Vector4};

#[cfg(feature = "serde-serialize")]
use serde::{Deserialize, Serialize};

/// Convergence threshold of the symmetric eigen decomposition used to find null vectors.
const EIGEN_EPSILON: f64 = 1e-12;
/// Iteration cap of the symmetric eigen decomposition used to find null vectors.
const EIGEN_ITERATIONS: usize = 1000;
/// Relative magnitude below which the epipole of the reference center is considered zero.
const DEGENERATE_BASELINE: f64 = 1e-12;

/// The calibration of one view as stored by multi-view stereo datasets.
///
/// Only the top-left 3x3 block of `intrinsic` is used. The last row of `extrinsic` is
/// kept as-is in the combined [`CameraMatrix`], which makes the combined matrix
/// invertible for any rigid extrinsic and invertible intrinsic.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraPair {
    /// World to camera transform.
    pub extrinsic: Matrix4<f64>,
    /// Intrinsic matrix embedded in the top-left corner of a 4x4 matrix.
    pub intrinsic: Matrix4<f64>,
}

impl CameraPair {
    pub fn new(extrinsic: Matrix4<f64>, intrinsic: Matrix4<f64>) -> Self {
        Self {
            extrinsic,
            intrinsic,
        }
    }

    /// Builds a camera pair from a 3x3 intrinsic matrix and a world to camera
    /// rotation and translation.
    pub fn from_parts(
        intrinsics: Matrix3<f64>,
        rotation: Matrix3<f64>,
        translation: Vector3<f64>,
    ) -> Self {
        let mut extrinsic = Matrix4::identity();
        extrinsic.fixed_slice_mut::<3, 3>(0, 0).copy_from(&rotation);
        extrinsic.fixed_slice_mut::<3, 1>(0, 3).copy_from(&translation);
        let mut intrinsic = Matrix4::identity();
        intrinsic.fixed_slice_mut::<3, 3>(0, 0).copy_from(&intrinsics);
        Self {
            extrinsic,
            intrinsic,
        }
    }

    /// The 3x3 intrinsic matrix.
    pub fn intrinsics(&self) -> Matrix3<f64> {
        self.intrinsic.fixed_slice::<3, 3>(0, 0).into_owned()
    }

    /// Returns a copy of this camera with the intrinsics rescaled for an image
    /// that is `factor` times the size of the original one.
    ///
    /// Multi-view stereo cascades keep one camera per resolution stage.
    pub fn scaled(&self, factor: f64) -> Self {
        let mut intrinsic = self.intrinsic;
        for row in 0..2 {
            for col in 0..3 {
                intrinsic[(row, col)] *= factor;
            }
        }
        Self {
            extrinsic: self.extrinsic,
            intrinsic,
        }
    }

    /// Combines the intrinsics and extrinsics into a single projection.
    ///
    /// The top 3x4 block becomes `K * E[:3, :4]`, the last row is the last row of the extrinsic.
    pub fn camera_matrix(&self) -> CameraMatrix {
        let projection: Matrix3x4<f64> =
            self.intrinsics() * self.extrinsic.fixed_slice::<3, 4>(0, 0);
        let mut combined = self.extrinsic;
        combined.fixed_slice_mut::<3, 4>(0, 0).copy_from(&projection);
        CameraMatrix(combined)
    }
}

/// A projection from homogeneous world coordinates to homogeneous pixel coordinates,
/// stored as a 4x4 matrix so that it can be inverted.
#[derive(Debug, Clone, Copy, PartialEq, AsRef, Deref, From, Into)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct CameraMatrix(pub Matrix4<f64>);

impl CameraMatrix {
    /// The 3x4 projection part of the matrix.
    pub fn projection(&self) -> Matrix3x4<f64> {
        self.0.fixed_slice::<3, 4>(0, 0).into_owned()
    }

    /// The optical center in homogeneous world coordinates.
    ///
    /// Returns `None` if the left 3x3 block of the projection is singular.
    pub fn center(&self) -> Option<Vector4<f64>> {
        let m = self.0.fixed_slice::<3, 3>(0, 0).into_owned();
        let p4 = self.0.fixed_slice::<3, 1>(0, 3).into_owned();
        let c = -(m.try_inverse()? * p4);
        Some(c.push(1.0))
    }

    /// The transform that maps homogeneous pixel coordinates scaled by depth in the
    /// `reference` camera to homogeneous pixel coordinates of this camera.
    ///
    /// This is `self * inverse(reference)`, the matrix plane-sweep warping is built on.
    pub fn relative_to(&self, reference: &CameraMatrix) -> Option<Matrix4<f64>> {
        Some(self.0 * reference.0.try_inverse()?)
    }

    /// Projects a world point into pixel coordinates.
    pub fn project(&self, point: Vector4<f64>) -> Option<Point2<f64>> {
        Point2::from_homogeneous(self.projection() * point)
    }
}

/// Encodes the epipolar constraint between a reference and a source camera.
///
/// See the crate documentation for the convention.
#[derive(Debug, Clone, Copy, PartialEq, AsRef, Deref, From, Into)]
pub struct FundamentalMatrix(pub Matrix3<f64>);

impl FundamentalMatrix {
    /// Computes `F = [e_src]x * P_src * pinv(P_ref)` where `e_src` is the projection of the
    /// reference optical center into the source camera.
    ///
    /// Returns `None` if either camera is degenerate or if both cameras share their
    /// optical center, in which case there is no epipolar geometry.
    pub fn from_cameras(reference: &CameraMatrix, source: &CameraMatrix) -> Option<Self> {
        let p_ref = reference.projection();
        let p_src = source.projection();
        let center = reference.center()?;
        let epipole = p_src * center;
        if epipole.norm() <= DEGENERATE_BASELINE * p_src.norm() * center.norm() {
            return None;
        }
        let pseudo_inverse = p_ref.transpose() * (p_ref * p_ref.transpose()).try_inverse()?;
        Some(Self(epipole.cross_matrix() * p_src * pseudo_inverse))
    }

    /// The fundamental matrix with the roles of the two cameras swapped.
    pub fn transpose(&self) -> Self {
        Self(self.0.transpose())
    }

    /// The right null vector of the matrix as a unit homogeneous point.
    ///
    /// The sign is chosen so that the last non-zero component is positive. An epipole
    /// at infinity has a zero `z` component and still describes the epipolar direction.
    pub fn epipole(&self) -> Option<Vector3<f64>> {
        let norm = self.0.norm();
        if norm == 0.0 || !norm.is_finite() {
            return None;
        }
        let f = self.0 / norm;
        let ftf = f.transpose() * f;
        let eigens = ftf.try_symmetric_eigen(EIGEN_EPSILON, EIGEN_ITERATIONS)?;
        let null = eigens
            .eigenvalues
            .iter()
            .enumerate()
            .min_by_key(|&(_, &n)| FloatOrd(n))
            .map(|(ix, _)| eigens.eigenvectors.column(ix).into_owned())?;
        let null = null.normalize();
        let sign_component = if null.z.abs() > f64::EPSILON {
            null.z
        } else if null.y.abs() > f64::EPSILON {
            null.y
        } else {
            null.x
        };
        Some(if sign_component < 0.0 { -null } else { null })
    }

    /// Algebraic residual `transpose(x_src) * F * x_ref` of a pixel correspondence.
    pub fn residual(&self, reference: Point2<f64>, source: Point2<f64>) -> f64 {
        source.to_homogeneous().dot(&(self.0 * reference.to_homogeneous()))
    }
}

/// Fundamental matrix between the reference and source view of a stereo pair.
pub fn fundamental_matrix(reference: &CameraPair, source: &CameraPair) -> Option<FundamentalMatrix> {
    FundamentalMatrix::from_cameras(&reference.camera_matrix(), &source.camera_matrix())
}

/// The epipole of the image on the right-hand side of the constraint.
///
/// Use `epipole(&f)` for the reference image and `epipole(&f.transpose())` for the source image.
pub fn epipole(f: &FundamentalMatrix) -> Option<Vector3<f64>> {
    f.epipole()
}

/// Appends the homogeneous row `[0, 0, 0, 1]` to a 3x4 projection.
pub fn to_camera_matrix(projection: &Matrix3x4<f64>) -> CameraMatrix {
    let mut m = Matrix4::identity();
    m.fixed_slice_mut::<3, 4>(0, 0).copy_from(projection);
    m.set_row(3, &RowVector4::new(0.0, 0.0, 0.0, 1.0));
    CameraMatrix(m)
}
