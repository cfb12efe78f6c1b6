//! Knot-point trajectories and their Gaussian-process interpolation.
//!
//! A [`Trajectory`] is a sequence of `(configuration, velocity)` knots spaced
//! `delta_t` apart. [`interpolate`] densifies it with the GP posterior mean of
//! the constant-velocity prior; the result is evaluated lazily and can be
//! iterated any number of times.

use nalgebra::{DMatrix, DVector, Vector2};

use crate::core::variable::{Key, Values};
use crate::error::{PlannerError, PlannerResult};
use crate::factors::{GaussianProcessInterpolator, GaussianProcessModel};
use crate::kinematics::PlanarArm;

/// One configuration and velocity at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectorySample {
    /// Seconds from the start of the trajectory
    pub time: f64,
    pub configuration: DVector<f64>,
    pub velocity: DVector<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    delta_t: f64,
    configurations: Vec<DVector<f64>>,
    velocities: Vec<DVector<f64>>,
}

impl Trajectory {
    /// Build from knots. All configurations and velocities share one dimension.
    pub fn new(
        delta_t: f64,
        configurations: Vec<DVector<f64>>,
        velocities: Vec<DVector<f64>>,
    ) -> PlannerResult<Self> {
        if !(delta_t > 0.0 && delta_t.is_finite()) {
            return Err(PlannerError::InvalidInput(format!(
                "time step must be positive, got {delta_t}"
            )));
        }
        if configurations.is_empty() || configurations.len() != velocities.len() {
            return Err(PlannerError::InvalidInput(format!(
                "{} configurations and {} velocities",
                configurations.len(),
                velocities.len()
            )));
        }
        let dof = configurations[0].len();
        if configurations
            .iter()
            .chain(&velocities)
            .any(|v| v.len() != dof)
        {
            return Err(PlannerError::InvalidInput(format!(
                "every knot must have dimension {dof}"
            )));
        }
        Ok(Self {
            delta_t,
            configurations,
            velocities,
        })
    }

    /// Constant-velocity straight line from `start` to `end` over `steps`
    /// intervals spanning `total_time`
    pub fn straight_line(
        start: &DVector<f64>,
        end: &DVector<f64>,
        steps: usize,
        total_time: f64,
    ) -> PlannerResult<Self> {
        if steps == 0 {
            return Err(PlannerError::InvalidInput(
                "a trajectory needs at least one interval".to_string(),
            ));
        }
        if start.len() != end.len() {
            return Err(PlannerError::InvalidInput(format!(
                "start has dimension {}, end has {}",
                start.len(),
                end.len()
            )));
        }
        let velocity = (end - start) / total_time;
        let configurations = (0..=steps)
            .map(|i| start + (end - start) * (i as f64 / steps as f64))
            .collect();
        let velocities = vec![velocity; steps + 1];
        Self::new(total_time / steps as f64, configurations, velocities)
    }

    /// Read knots `x0, v0 .. x{steps}, v{steps}` from `values`
    pub fn from_values(values: &Values, steps: usize, delta_t: f64) -> PlannerResult<Self> {
        let mut configurations = Vec::with_capacity(steps + 1);
        let mut velocities = Vec::with_capacity(steps + 1);
        for i in 0..=steps {
            configurations.push(values.at(&Key::conf(i))?.clone());
            velocities.push(values.at(&Key::vel(i))?.clone());
        }
        Self::new(delta_t, configurations, velocities)
    }

    pub fn to_values(&self) -> Values {
        self.configurations
            .iter()
            .zip(&self.velocities)
            .enumerate()
            .flat_map(|(i, (x, v))| [(Key::conf(i), x.clone()), (Key::vel(i), v.clone())])
            .collect()
    }

    pub fn delta_t(&self) -> f64 {
        self.delta_t
    }

    /// Number of knots
    pub fn len(&self) -> usize {
        self.configurations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configurations.is_empty()
    }

    /// Number of intervals between knots
    pub fn steps(&self) -> usize {
        self.len() - 1
    }

    pub fn dof(&self) -> usize {
        self.configurations[0].len()
    }

    pub fn configurations(&self) -> &[DVector<f64>] {
        &self.configurations
    }

    pub fn velocities(&self) -> &[DVector<f64>] {
        &self.velocities
    }

    pub fn sample(&self, index: usize) -> Option<TrajectorySample> {
        Some(TrajectorySample {
            time: index as f64 * self.delta_t,
            configuration: self.configurations.get(index)?.clone(),
            velocity: self.velocities.get(index)?.clone(),
        })
    }

    /// Base and joint positions of `arm` at every knot
    pub fn joint_positions(&self, arm: &PlanarArm) -> PlannerResult<Vec<Vec<Vector2<f64>>>> {
        self.configurations
            .iter()
            .map(|q| arm.joint_positions(q))
            .collect()
    }

    /// Densify with `samples_per_interval` GP-interpolated points per interval
    pub fn interpolate(
        &self,
        model: &GaussianProcessModel,
        samples_per_interval: usize,
    ) -> PlannerResult<InterpolatedTrajectory<'_>> {
        InterpolatedTrajectory::new(self, model, self.delta_t, samples_per_interval)
    }
}

/// Densify `trajectory` using the constant-velocity GP with power spectral
/// density `qc` and knot spacing `delta_t`.
pub fn interpolate<'a>(
    trajectory: &'a Trajectory,
    qc: &DMatrix<f64>,
    delta_t: f64,
    samples_per_interval: usize,
) -> PlannerResult<InterpolatedTrajectory<'a>> {
    let model = GaussianProcessModel::new(qc.clone())?;
    InterpolatedTrajectory::new(trajectory, &model, delta_t, samples_per_interval)
}

/// Lazily evaluated dense view of a [`Trajectory`].
///
/// Holds one interpolator per in-between sample; points are only computed
/// when requested.
#[derive(Debug, Clone)]
pub struct InterpolatedTrajectory<'a> {
    trajectory: &'a Trajectory,
    delta_t: f64,
    interpolators: Vec<GaussianProcessInterpolator>,
}

impl<'a> InterpolatedTrajectory<'a> {
    fn new(
        trajectory: &'a Trajectory,
        model: &GaussianProcessModel,
        delta_t: f64,
        samples_per_interval: usize,
    ) -> PlannerResult<Self> {
        if model.dof() != trajectory.dof() {
            return Err(PlannerError::InvalidInput(format!(
                "GP model has {} degrees of freedom, trajectory has {}",
                model.dof(),
                trajectory.dof()
            )));
        }
        let parts = (samples_per_interval + 1) as f64;
        let interpolators = (1..=samples_per_interval)
            .map(|j| GaussianProcessInterpolator::new(model, delta_t, j as f64 * delta_t / parts))
            .collect::<PlannerResult<Vec<_>>>()?;
        Ok(Self {
            trajectory,
            delta_t,
            interpolators,
        })
    }

    pub fn samples_per_interval(&self) -> usize {
        self.interpolators.len()
    }

    /// `N·(s+1) + 1` for `N` intervals and `s` samples per interval
    pub fn len(&self) -> usize {
        self.trajectory.steps() * (self.samples_per_interval() + 1) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Sample at dense index `index`
    pub fn get(&self, index: usize) -> Option<TrajectorySample> {
        if index >= self.len() {
            return None;
        }
        let per_interval = self.samples_per_interval() + 1;
        let (interval, offset) = (index / per_interval, index % per_interval);
        let time = interval as f64 * self.delta_t + offset as f64 * self.delta_t / per_interval as f64;
        if offset == 0 {
            let mut knot = self.trajectory.sample(interval)?;
            knot.time = time;
            return Some(knot);
        }

        let configurations = self.trajectory.configurations();
        let velocities = self.trajectory.velocities();
        let (configuration, velocity) = self.interpolators[offset - 1].interpolate(
            &configurations[interval],
            &velocities[interval],
            &configurations[interval + 1],
            &velocities[interval + 1],
        );
        Some(TrajectorySample {
            time,
            configuration,
            velocity,
        })
    }

    /// Iterate from the first sample; may be called any number of times
    pub fn iter(&self) -> InterpolatedIter<'_, 'a> {
        InterpolatedIter {
            source: self,
            next: 0,
        }
    }

    /// Dense samples as `x{i}, v{i}` values
    pub fn to_values(&self) -> Values {
        self.iter()
            .enumerate()
            .flat_map(|(i, s)| [(Key::conf(i), s.configuration), (Key::vel(i), s.velocity)])
            .collect()
    }

    /// Base and joint positions of `arm` at every dense sample
    pub fn joint_positions(&self, arm: &PlanarArm) -> PlannerResult<Vec<Vec<Vector2<f64>>>> {
        self.iter()
            .map(|s| arm.joint_positions(&s.configuration))
            .collect()
    }
}

pub struct InterpolatedIter<'s, 'a> {
    source: &'s InterpolatedTrajectory<'a>,
    next: usize,
}

impl Iterator for InterpolatedIter<'_, '_> {
    type Item = TrajectorySample;

    fn next(&mut self) -> Option<Self::Item> {
        let sample = self.source.get(self.next)?;
        self.next += 1;
        Some(sample)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.source.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for InterpolatedIter<'_, '_> {}

impl<'s, 'a> IntoIterator for &'s InterpolatedTrajectory<'a> {
    type Item = TrajectorySample;
    type IntoIter = InterpolatedIter<'s, 'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    fn curved() -> Trajectory {
        Trajectory::new(
            0.5,
            vec![dvector![0.0, 0.0], dvector![0.3, -0.1], dvector![1.0, 0.2]],
            vec![dvector![0.4, 0.0], dvector![1.0, 0.1], dvector![0.0, 0.0]],
        )
        .unwrap()
    }

    #[test]
    fn test_straight_line_has_constant_velocity() {
        let trajectory =
            Trajectory::straight_line(&dvector![0.0, 0.0], &dvector![1.0, -2.0], 4, 2.0).unwrap();
        assert_eq!(trajectory.len(), 5);
        assert!((trajectory.delta_t() - 0.5).abs() < 1e-15);
        assert_eq!(trajectory.configurations()[2], dvector![0.5, -1.0]);
        for v in trajectory.velocities() {
            assert_eq!(*v, dvector![0.5, -1.0]);
        }
    }

    #[test]
    fn test_values_round_trip() {
        let trajectory = curved();
        let values = trajectory.to_values();
        assert_eq!(values.len(), 6);
        let back = Trajectory::from_values(&values, 2, 0.5).unwrap();
        assert_eq!(back, trajectory);
        assert!(matches!(
            Trajectory::from_values(&values, 3, 0.5),
            Err(PlannerError::InvalidState(_))
        ));
    }

    #[test]
    fn test_zero_samples_returns_knots() {
        let trajectory = curved();
        let model = GaussianProcessModel::isotropic(2, 1.0).unwrap();
        let dense = trajectory.interpolate(&model, 0).unwrap();
        assert_eq!(dense.len(), 3);
        let samples: Vec<_> = dense.iter().collect();
        for (i, sample) in samples.iter().enumerate() {
            assert_eq!(sample.configuration, trajectory.configurations()[i]);
            assert_eq!(sample.velocity, trajectory.velocities()[i]);
        }
    }

    #[test]
    fn test_length_and_restart() {
        let trajectory = curved();
        let dense = interpolate(&trajectory, &DMatrix::identity(2, 2), 0.5, 5).unwrap();
        assert_eq!(dense.len(), 2 * 6 + 1);
        assert_eq!(dense.iter().len(), 13);

        let first: Vec<_> = dense.iter().collect();
        let second: Vec<_> = (&dense).into_iter().collect();
        assert_eq!(first, second);
        assert_eq!(first[6].configuration, trajectory.configurations()[1]);
        assert_eq!(first[12].configuration, trajectory.configurations()[2]);
        assert!((first[3].time - 0.25).abs() < 1e-12);
        assert!(dense.get(13).is_none());
    }

    #[test]
    fn test_constant_velocity_is_interpolated_exactly() {
        let trajectory =
            Trajectory::straight_line(&dvector![0.0, 1.0], &dvector![1.0, 0.0], 2, 1.0).unwrap();
        let model = GaussianProcessModel::isotropic(2, 1.0).unwrap();
        let dense = trajectory.interpolate(&model, 3).unwrap();
        for sample in &dense {
            let expected = dvector![sample.time, 1.0 - sample.time];
            assert!((sample.configuration - expected).norm() < 1e-12);
            assert!((sample.velocity - dvector![1.0, -1.0]).norm() < 1e-12);
        }
    }

    #[test]
    fn test_joint_positions_per_sample() {
        let arm = PlanarArm::simple_two_links();
        let trajectory = curved();
        let positions = trajectory.joint_positions(&arm).unwrap();
        assert_eq!(positions.len(), 3);
        assert_eq!(positions[0].len(), 3);
        assert!((positions[0][2] - Vector2::new(1.0, 0.0)).norm() < 1e-12);

        let model = GaussianProcessModel::isotropic(2, 1.0).unwrap();
        let dense = trajectory.interpolate(&model, 2).unwrap();
        assert_eq!(dense.joint_positions(&arm).unwrap().len(), dense.len());
    }

    #[test]
    fn test_mismatched_model_is_rejected() {
        let model = GaussianProcessModel::isotropic(3, 1.0).unwrap();
        assert!(curved().interpolate(&model, 2).is_err());
    }
}
