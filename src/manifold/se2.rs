//! SE(2) - Special Euclidean Group in 2D
//!
//! Rigid body transformations of the plane (rotation + translation).
//! Tangent elements are `[dx, dy, dtheta]`; the retraction is the group
//! exponential applied on the right, `g ⊕ ξ = g · exp(ξ)`.

use nalgebra::{Matrix2, UnitComplex, Vector2, Vector3};
use std::fmt;
use std::fmt::{Display, Formatter};

/// SE(2) group element representing a rigid body transformation in 2D.
#[derive(Clone, PartialEq, Debug)]
pub struct SE2 {
    /// Translation part
    translation: Vector2<f64>,
    /// Rotation part as a unit complex number
    rotation: UnitComplex<f64>,
}

impl Display for SE2 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SE2(x: {:.4}, y: {:.4}, theta: {:.4})",
            self.translation.x,
            self.translation.y,
            self.angle()
        )
    }
}

impl SE2 {
    /// Degrees of freedom - dimension of the tangent space
    pub const DOF: usize = 3;

    /// The identity transformation.
    pub fn identity() -> Self {
        SE2 {
            translation: Vector2::zeros(),
            rotation: UnitComplex::identity(),
        }
    }

    /// Create SE2 from translation components and angle.
    pub fn from_xy_angle(x: f64, y: f64, theta: f64) -> Self {
        SE2 {
            translation: Vector2::new(x, y),
            rotation: UnitComplex::from_angle(theta),
        }
    }

    /// Get the x component of translation.
    pub fn x(&self) -> f64 {
        self.translation.x
    }

    /// Get the y component of translation.
    pub fn y(&self) -> f64 {
        self.translation.y
    }

    /// Get the rotation angle in radians.
    pub fn angle(&self) -> f64 {
        self.rotation.angle()
    }

    /// Get the translation part.
    pub fn translation(&self) -> Vector2<f64> {
        self.translation
    }

    /// Get the 2x2 rotation matrix.
    pub fn rotation_matrix(&self) -> Matrix2<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Group composition: `self · other`.
    pub fn compose(&self, other: &SE2) -> SE2 {
        SE2 {
            translation: self.translation + self.rotation * other.translation,
            rotation: self.rotation * other.rotation,
        }
    }

    /// Group inverse.
    pub fn inverse(&self) -> SE2 {
        let inv_rot = self.rotation.inverse();
        SE2 {
            translation: -(inv_rot * self.translation),
            rotation: inv_rot,
        }
    }

    /// Relative transformation `self⁻¹ · other`.
    pub fn between(&self, other: &SE2) -> SE2 {
        self.inverse().compose(other)
    }

    /// Exponential map from the tangent space `[vx, vy, omega]`.
    pub fn exp(xi: &Vector3<f64>) -> SE2 {
        let v = Vector2::new(xi.x, xi.y);
        let omega = xi.z;
        SE2 {
            translation: Self::left_jacobian_v(omega) * v,
            rotation: UnitComplex::from_angle(omega),
        }
    }

    /// Logarithmic map to the tangent space `[vx, vy, omega]`.
    pub fn log(&self) -> Vector3<f64> {
        let omega = self.rotation.angle();
        let v_inv = Self::left_jacobian_v(omega)
            .try_inverse()
            .unwrap_or_else(Matrix2::identity);
        let v = v_inv * self.translation;
        Vector3::new(v.x, v.y, omega)
    }

    /// Retraction: apply a right tangent perturbation, `self · exp(xi)`.
    pub fn retract(&self, xi: &Vector3<f64>) -> SE2 {
        self.compose(&Self::exp(xi))
    }

    /// Local coordinates of `other` relative to `self`: `log(self⁻¹ · other)`.
    pub fn local(&self, other: &SE2) -> Vector3<f64> {
        self.between(other).log()
    }

    // The V matrix mapping tangent translation to group translation.
    fn left_jacobian_v(omega: f64) -> Matrix2<f64> {
        if omega.abs() < 1e-10 {
            // second-order Taylor expansion around omega = 0
            Matrix2::new(
                1.0 - omega * omega / 6.0,
                -omega / 2.0,
                omega / 2.0,
                1.0 - omega * omega / 6.0,
            )
        } else {
            let s = omega.sin() / omega;
            let c = (1.0 - omega.cos()) / omega;
            Matrix2::new(s, -c, c, s)
        }
    }
}
