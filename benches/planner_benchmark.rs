//! Batch planning vs incremental replanning
//!
//! Times the three batch optimizers on the two-link arm demo problem and
//! compares a from-scratch batch solve of the replanned problem with an
//! incremental goal change on a warm session.
//!
//! ```bash
//! cargo bench --bench planner_benchmark
//! ```

use std::f64::consts::FRAC_PI_2;
use std::hint::black_box;
use std::sync::Arc;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use gpmp_planner::{
    IncrementalTrajOptimizer, Key, OccupancyGrid, OptimizerConfig, OptimizerType, PlanarArm,
    PlanarSdf, PlannerConfig, Trajectory, Values, batch_trajectory_optimize,
};
use nalgebra::{DVector, dvector};

struct Scenario {
    arm: Arc<PlanarArm>,
    sdf: Arc<PlanarSdf>,
    start: DVector<f64>,
    goal: DVector<f64>,
    replan_goal: DVector<f64>,
    zero: DVector<f64>,
}

impl Scenario {
    fn new() -> Self {
        let sdf = PlanarSdf::from_provider(&OccupancyGrid::one_obstacle())
            .unwrap_or_else(|e| panic!("demo map: {e}"));
        Self {
            arm: Arc::new(PlanarArm::simple_two_links()),
            sdf: Arc::new(sdf),
            start: dvector![0.0, 0.0],
            goal: dvector![FRAC_PI_2, 0.0],
            replan_goal: dvector![FRAC_PI_2 + 0.4, -FRAC_PI_2 / 2.0],
            zero: DVector::zeros(2),
        }
    }

    fn batch(&self, goal: &DVector<f64>, config: &PlannerConfig) -> Values {
        let init = Trajectory::straight_line(&self.start, goal, config.total_time_steps, config.total_time_sec)
            .unwrap_or_else(|e| panic!("initial trajectory: {e}"));
        batch_trajectory_optimize(
            Arc::clone(&self.arm),
            Arc::clone(&self.sdf),
            &self.start,
            &self.zero,
            goal,
            &self.zero,
            &init.to_values(),
            config,
        )
        .unwrap_or_else(|e| panic!("batch solve: {e}"))
        .values
    }

    fn warm_session(&self, config: &PlannerConfig, values: &Values) -> IncrementalTrajOptimizer {
        let mut session =
            IncrementalTrajOptimizer::new(Arc::clone(&self.arm), Arc::clone(&self.sdf), config.clone())
                .unwrap_or_else(|e| panic!("session: {e}"));
        session
            .init_factor_graph(&self.start, &self.zero, &self.goal, &self.zero)
            .and_then(|_| session.init_values(values))
            .and_then(|_| session.update().map(|_| ()))
            .unwrap_or_else(|e| panic!("first update: {e}"));
        session
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    gpmp_planner::init_logger_with_level(tracing::Level::WARN);
    let scenario = Scenario::new();

    let mut group = c.benchmark_group("batch");
    for optimizer in [
        OptimizerType::GaussNewton,
        OptimizerType::DogLeg,
        OptimizerType::LevenbergMarquardt,
    ] {
        let config = PlannerConfig::default()
            .with_optimizer(OptimizerConfig::new().with_optimizer_type(optimizer));
        group.bench_function(optimizer.to_string(), |b| {
            b.iter(|| black_box(scenario.batch(&scenario.goal, &config)))
        });
    }
    group.finish();

    let config = PlannerConfig::default();
    let original = scenario.batch(&scenario.goal, &config);
    let replan_index = 5;

    let mut group = c.benchmark_group("replan");
    group.bench_function("batch from scratch", |b| {
        b.iter(|| black_box(scenario.batch(&scenario.replan_goal, &config)))
    });
    group.bench_function("incremental goal change", |b| {
        b.iter_batched(
            || scenario.warm_session(&config, &original),
            |mut session| {
                let conf = original.get(&Key::conf(replan_index)).cloned().unwrap_or_else(|| DVector::zeros(2));
                let vel = original.get(&Key::vel(replan_index)).cloned().unwrap_or_else(|| DVector::zeros(2));
                session
                    .fix_config_and_vel(replan_index, &conf, &vel)
                    .and_then(|_| session.change_goal_config_and_vel(&scenario.replan_goal, &scenario.zero))
                    .and_then(|_| session.update())
                    .unwrap_or_else(|e| panic!("replan: {e}"))
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
