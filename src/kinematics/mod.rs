//! Planar revolute-chain kinematics with collision spheres
//!
//! Link frame `i` sits at the end of link `i` with its x axis along the link,
//! rotated by the cumulative angle `θ_i = θ_base + Σ_{k≤i} q_k`. Body spheres
//! are attached to link frames, so the obstacle factors only need sphere
//! centres and their Jacobians with respect to the joint angles.

use nalgebra::{DMatrix, DVector, Vector2, Vector3};

use crate::error::{PlannerError, PlannerResult};

/// Collision sphere rigidly attached to a link
#[derive(Debug, Clone, PartialEq)]
pub struct BodySphere {
    /// Index of the link frame the sphere is attached to
    pub link: usize,
    pub radius: f64,
    /// Centre in the link frame
    pub offset: Vector2<f64>,
}

impl BodySphere {
    pub fn new(link: usize, radius: f64, offset: Vector2<f64>) -> Self {
        Self {
            link,
            radius,
            offset,
        }
    }
}

/// Serial chain of revolute joints moving in the plane
#[derive(Debug, Clone)]
pub struct PlanarArm {
    link_lengths: Vec<f64>,
    /// Base pose `(x, y, θ)`
    base: Vector3<f64>,
    spheres: Vec<BodySphere>,
}

impl PlanarArm {
    pub fn new(
        link_lengths: Vec<f64>,
        base: Vector3<f64>,
        spheres: Vec<BodySphere>,
    ) -> PlannerResult<Self> {
        if link_lengths.is_empty() {
            return Err(PlannerError::InvalidInput(
                "arm needs at least one link".to_string(),
            ));
        }
        if let Some(sphere) = spheres.iter().find(|s| s.link >= link_lengths.len()) {
            return Err(PlannerError::InvalidInput(format!(
                "sphere attached to link {} but the arm has {} links",
                sphere.link,
                link_lengths.len()
            )));
        }
        if let Some(sphere) = spheres.iter().find(|s| s.radius < 0.0 || s.radius.is_nan()) {
            return Err(PlannerError::InvalidInput(format!(
                "sphere radius must be non-negative, got {}",
                sphere.radius
            )));
        }
        Ok(Self {
            link_lengths,
            base,
            spheres,
        })
    }

    /// Two 0.5 m links at the origin, six 1 cm spheres spread along each link
    pub fn simple_two_links() -> Self {
        let spheres = (0..2)
            .flat_map(|link| {
                (0..6).map(move |i| {
                    BodySphere::new(link, 0.01, Vector2::new(-0.5 + 0.1 * i as f64, 0.0))
                })
            })
            .collect();
        Self {
            link_lengths: vec![0.5, 0.5],
            base: Vector3::zeros(),
            spheres,
        }
    }

    /// Arm whose only collision geometry is a zero-radius sphere at each link end
    pub fn with_joint_spheres(link_lengths: Vec<f64>, base: Vector3<f64>) -> PlannerResult<Self> {
        let spheres = (0..link_lengths.len())
            .map(|link| BodySphere::new(link, 0.0, Vector2::zeros()))
            .collect();
        Self::new(link_lengths, base, spheres)
    }

    /// Degrees of freedom
    pub fn dof(&self) -> usize {
        self.link_lengths.len()
    }

    pub fn link_lengths(&self) -> &[f64] {
        &self.link_lengths
    }

    pub fn base(&self) -> &Vector3<f64> {
        &self.base
    }

    pub fn spheres(&self) -> &[BodySphere] {
        &self.spheres
    }

    fn check_dimension(&self, q: &DVector<f64>) -> PlannerResult<()> {
        if q.len() != self.dof() {
            return Err(PlannerError::InvalidInput(format!(
                "configuration has {} entries, arm has {} joints",
                q.len(),
                self.dof()
            )));
        }
        Ok(())
    }

    fn cumulative_angles(&self, q: &DVector<f64>) -> Vec<f64> {
        q.iter()
            .scan(self.base.z, |theta, qi| {
                *theta += qi;
                Some(*theta)
            })
            .collect()
    }

    /// Positions of the base and every link end, each with its `2 x dof` Jacobian.
    pub fn forward_kinematics(
        &self,
        q: &DVector<f64>,
    ) -> PlannerResult<(Vec<Vector2<f64>>, Vec<DMatrix<f64>>)> {
        self.check_dimension(q)?;
        let dof = self.dof();
        let theta = self.cumulative_angles(q);

        let mut positions = Vec::with_capacity(dof + 1);
        let mut jacobians = Vec::with_capacity(dof + 1);
        let mut point = self.base.xy();
        positions.push(point);
        jacobians.push(DMatrix::zeros(2, dof));

        for i in 0..dof {
            point += self.link_lengths[i] * Vector2::new(theta[i].cos(), theta[i].sin());
            positions.push(point);
            jacobians.push(self.link_end_jacobian(&theta, i, &Vector2::zeros()));
        }
        Ok((positions, jacobians))
    }

    /// Positions only, for rendering
    pub fn joint_positions(&self, q: &DVector<f64>) -> PlannerResult<Vec<Vector2<f64>>> {
        self.forward_kinematics(q).map(|(positions, _)| positions)
    }

    /// Centres of all body spheres, each with its `2 x dof` Jacobian.
    pub fn sphere_centers(
        &self,
        q: &DVector<f64>,
    ) -> PlannerResult<(Vec<Vector2<f64>>, Vec<DMatrix<f64>>)> {
        self.check_dimension(q)?;
        let theta = self.cumulative_angles(q);

        let mut link_ends = Vec::with_capacity(self.dof());
        let mut point = self.base.xy();
        for (length, angle) in self.link_lengths.iter().zip(&theta) {
            point += *length * Vector2::new(angle.cos(), angle.sin());
            link_ends.push(point);
        }

        let mut centers = Vec::with_capacity(self.spheres.len());
        let mut jacobians = Vec::with_capacity(self.spheres.len());
        for sphere in &self.spheres {
            let (s, c) = theta[sphere.link].sin_cos();
            let rotated = Vector2::new(
                c * sphere.offset.x - s * sphere.offset.y,
                s * sphere.offset.x + c * sphere.offset.y,
            );
            centers.push(link_ends[sphere.link] + rotated);
            jacobians.push(self.link_end_jacobian(&theta, sphere.link, &sphere.offset));
        }
        Ok((centers, jacobians))
    }

    /// Jacobian of a point fixed at `offset` in link frame `link`
    fn link_end_jacobian(&self, theta: &[f64], link: usize, offset: &Vector2<f64>) -> DMatrix<f64> {
        let mut jacobian = DMatrix::zeros(2, self.dof());
        let (s_link, c_link) = theta[link].sin_cos();
        let offset_term = Vector2::new(
            -s_link * offset.x - c_link * offset.y,
            c_link * offset.x - s_link * offset.y,
        );
        for k in 0..=link {
            let mut column = offset_term;
            for j in k..=link {
                column += self.link_lengths[j] * Vector2::new(-theta[j].sin(), theta[j].cos());
            }
            jacobian[(0, k)] = column.x;
            jacobian[(1, k)] = column.y;
        }
        jacobian
    }
}
