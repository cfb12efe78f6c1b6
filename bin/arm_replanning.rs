use std::f64::consts::FRAC_PI_2;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gpmp_planner::{
    IncrementalTrajOptimizer, Key, OccupancyGrid, OptimizerConfig, OptimizerType, PlanarArm,
    PlanarSdf, PlannerConfig, ReplanPolicy, Trajectory, Values, batch_trajectory_optimize,
    build_trajectory_graph, init_logger, interpolate, planner::max_obstacle_cost,
};
use nalgebra::{DVector, dvector};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "arm_replanning")]
#[command(about = "Plan a 2-link arm trajectory around one obstacle, then replan to a new goal mid-way")]
struct Args {
    /// Knot index at which the goal changes
    #[arg(long, default_value = "5")]
    replan_index: usize,

    /// Optimizer type: "gn" (Gauss-Newton), "dl" (Dog Leg) or "lm" (Levenberg-Marquardt)
    #[arg(short, long, default_value = "gn")]
    optimizer: String,

    /// Also pin every knot before the replan index
    #[arg(long)]
    fix_prefix: bool,

    /// GP-interpolated samples per interval in the exported trajectories
    #[arg(long, default_value = "0")]
    interpolation: usize,

    /// Optional path to write joint positions of both trajectories as CSV
    #[arg(long)]
    save_output: Option<PathBuf>,
}

/// One joint position of one trajectory sample
#[derive(Debug, Serialize)]
struct JointSample {
    trajectory: &'static str,
    sample: usize,
    time: f64,
    joint: usize,
    x: f64,
    y: f64,
}

fn parse_optimizer(name: &str) -> Result<OptimizerType, String> {
    match name {
        "gn" => Ok(OptimizerType::GaussNewton),
        "dl" => Ok(OptimizerType::DogLeg),
        "lm" => Ok(OptimizerType::LevenbergMarquardt),
        other => Err(format!("unknown optimizer '{other}', expected gn, dl or lm")),
    }
}

fn joint_samples(
    name: &'static str,
    values: &Values,
    arm: &PlanarArm,
    config: &PlannerConfig,
    interpolation: usize,
) -> Result<Vec<JointSample>, Box<dyn std::error::Error>> {
    let trajectory = Trajectory::from_values(values, config.total_time_steps, config.delta_t())?;
    let dense = interpolate(&trajectory, &config.qc, config.delta_t(), interpolation)?;
    let mut rows = Vec::new();
    for (sample, state) in dense.iter().enumerate() {
        for (joint, position) in arm.joint_positions(&state.configuration)?.iter().enumerate() {
            rows.push(JointSample {
                trajectory: name,
                sample,
                time: state.time,
                joint,
                x: position.x,
                y: position.y,
            });
        }
    }
    Ok(rows)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();
    let args = Args::parse();

    let policy = if args.fix_prefix {
        ReplanPolicy::FixExecutedPrefix
    } else {
        ReplanPolicy::FixCurrentState
    };
    let config = PlannerConfig::new(2)
        .with_optimizer(OptimizerConfig::new().with_optimizer_type(parse_optimizer(&args.optimizer)?))
        .with_replan_policy(policy);
    config.validate()?;

    let sdf = Arc::new(PlanarSdf::from_provider(&OccupancyGrid::one_obstacle())?);
    let arm = Arc::new(PlanarArm::simple_two_links());

    let start_conf = dvector![0.0, 0.0];
    let start_vel = DVector::zeros(2);
    let end_conf = dvector![FRAC_PI_2, 0.0];
    let end_vel = DVector::zeros(2);
    let replan_end_conf = dvector![FRAC_PI_2 + 0.4, -FRAC_PI_2 / 2.0];

    let init = Trajectory::straight_line(
        &start_conf,
        &end_conf,
        config.total_time_steps,
        config.total_time_sec,
    )?;
    let batch = batch_trajectory_optimize(
        Arc::clone(&arm),
        Arc::clone(&sdf),
        &start_conf,
        &start_vel,
        &end_conf,
        &end_vel,
        &init.to_values(),
        &config,
    )?;
    if !batch.status.is_converged() {
        warn!(status = %batch.status, "batch optimization stopped before converging");
    }
    let original = batch.values;

    let graph = build_trajectory_graph(
        Arc::clone(&arm),
        Arc::clone(&sdf),
        &start_conf,
        &start_vel,
        &end_conf,
        &end_vel,
        &config,
    )?;
    info!(
        status = %batch.status,
        iterations = batch.iterations,
        final_error = batch.final_error,
        max_obstacle_cost = max_obstacle_cost(&graph, &original)?,
        "original trajectory"
    );

    let mut session = IncrementalTrajOptimizer::new(Arc::clone(&arm), Arc::clone(&sdf), config.clone())?;
    session.init_factor_graph(&start_conf, &start_vel, &end_conf, &end_vel)?;
    session.init_values(&original)?;
    let first = session.update()?;
    info!(cliques = first.cliques_total, "incremental optimizer accepted the original trajectory");

    let current_conf = original.at(&Key::conf(args.replan_index))?;
    let current_vel = original.at(&Key::vel(args.replan_index))?;
    session.fix_config_and_vel(args.replan_index, current_conf, current_vel)?;
    session.change_goal_config_and_vel(&replan_end_conf, &end_vel)?;
    let replan = session.update()?;
    info!(
        recomputed = replan.cliques_recomputed,
        total = replan.cliques_total,
        policy = %config.replan_policy,
        "replanned to the new goal"
    );
    let replanned = session.values()?;
    println!("{replanned}");

    if let Some(path) = args.save_output {
        let mut writer = csv::Writer::from_path(&path)?;
        for (name, values) in [("original", &original), ("replanned", &replanned)] {
            for row in joint_samples(name, values, &arm, &config, args.interpolation)? {
                writer.serialize(row)?;
            }
        }
        writer.flush()?;
        info!("Joint positions written to {}", path.display());
    }
    Ok(())
}
