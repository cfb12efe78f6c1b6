//! Integration tests for incremental replanning
//!
//! Plans the two-link arm trajectory in batch, hands it to an incremental
//! session, then pins the state at step 5 and moves the goal. Checks that the
//! update only re-eliminates the end of the Bayes tree, that the executed
//! part of the plan does not move, and that bad edits leave the session intact.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use gpmp_planner::{
    FactorId, IncrementalConfig, IncrementalOptimizer, IncrementalTrajOptimizer, Key,
    PlannerConfig, PlannerError, ReplanPolicy, Values, batch_trajectory_optimize,
    build_trajectory_graph,
};

use planning_test_utils::*;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn original_plan(config: &PlannerConfig) -> Result<Values, Box<dyn std::error::Error>> {
    let result = batch_trajectory_optimize(
        two_link_arm(),
        off_path_obstacle_sdf()?,
        &start_conf(),
        &zero_vel(),
        &goal_conf(),
        &zero_vel(),
        &straight_line_values(config)?,
        config,
    )?;
    assert!(result.status.is_converged(), "{}", result.status);
    Ok(result.values)
}

fn warm_session(
    config: &PlannerConfig,
    original: &Values,
) -> Result<IncrementalTrajOptimizer, Box<dyn std::error::Error>> {
    let mut session =
        IncrementalTrajOptimizer::new(two_link_arm(), off_path_obstacle_sdf()?, config.clone())?;
    session.init_factor_graph(&start_conf(), &zero_vel(), &goal_conf(), &zero_vel())?;
    session.init_values(original)?;
    session.update()?;
    Ok(session)
}

fn replan(session: &mut IncrementalTrajOptimizer, original: &Values) -> TestResult {
    let conf = original.at(&Key::conf(REPLAN_INDEX))?;
    let vel = original.at(&Key::vel(REPLAN_INDEX))?;
    session.fix_config_and_vel(REPLAN_INDEX, conf, vel)?;
    session.change_goal_config_and_vel(&replan_goal_conf(), &zero_vel())?;
    Ok(())
}

#[test]
fn test_session_accepts_batch_plan() -> TestResult {
    let config = PlannerConfig::default();
    let original = original_plan(&config)?;
    let session = warm_session(&config, &original)?;

    assert!(max_knot_difference(&original, &session.values()?, 10)? < 1e-6);
    // {x_i, v_i} per step, the last two steps share the root
    assert_eq!(session.optimizer().bayes_tree().len(), 10);
    Ok(())
}

/// Scenario: the goal moves to (π/2 + 0.4, −π/4) at step 5. The update
/// re-eliminates fewer cliques than a full solve and steps 0–5 stay put.
#[test]
fn test_goal_change_at_step_five() -> TestResult {
    let config = PlannerConfig::default();
    let original = original_plan(&config)?;
    let mut session = warm_session(&config, &original)?;

    replan(&mut session, &original)?;
    let result = session.update()?;
    assert!(
        result.cliques_recomputed < result.cliques_total,
        "recomputed {} of {}",
        result.cliques_recomputed,
        result.cliques_total
    );
    assert!(result.cliques_back_substituted < result.cliques_total);

    let replanned = session.values()?;
    assert!(max_knot_difference(&original, &replanned, REPLAN_INDEX)? < 1e-6);
    assert_eq!(
        replanned.at(&Key::conf(REPLAN_INDEX))?,
        original.at(&Key::conf(REPLAN_INDEX))?
    );

    let goal = replanned.at(&Key::conf(config.total_time_steps))?;
    assert!((goal - replan_goal_conf()).norm() < 1e-3);

    let trajectory = session.trajectory()?;
    assert_eq!(trajectory.len(), 11);
    Ok(())
}

#[test]
fn test_fixed_state_survives_further_optimization() -> TestResult {
    let config = PlannerConfig::default();
    let original = original_plan(&config)?;
    let mut session = warm_session(&config, &original)?;
    replan(&mut session, &original)?;
    session.update()?;

    // A second update with nothing staged refreshes the estimate only
    session.update()?;
    let values = session.values()?;
    for key in [Key::conf(REPLAN_INDEX), Key::vel(REPLAN_INDEX)] {
        assert_eq!(values.at(&key)?, original.at(&key)?);
    }
    Ok(())
}

#[test]
fn test_executed_prefix_policy_pins_every_past_knot() -> TestResult {
    let config = PlannerConfig::default().with_replan_policy(ReplanPolicy::FixExecutedPrefix);
    let original = original_plan(&config)?;
    let mut session = warm_session(&config, &original)?;

    replan(&mut session, &original)?;
    session.update()?;
    let replanned = session.values()?;
    assert!(max_knot_difference(&original, &replanned, REPLAN_INDEX)? < 1e-6);

    let pinned = session.optimizer().graph().pinned_keys();
    assert_eq!(pinned.len(), 2 * (REPLAN_INDEX + 1));
    Ok(())
}

#[test]
fn test_fixing_missing_knot_is_invalid_state() -> TestResult {
    let config = PlannerConfig::default();
    let original = original_plan(&config)?;
    let mut session = warm_session(&config, &original)?;
    let result = session.fix_config_and_vel(11, &start_conf(), &zero_vel());
    assert!(matches!(result, Err(PlannerError::InvalidState(_))));
    Ok(())
}

/// An update naming a factor that does not exist fails and leaves the
/// estimate and the tree untouched.
#[test]
fn test_bogus_factor_id_leaves_estimate_untouched() -> TestResult {
    let config = PlannerConfig::default();
    let original = original_plan(&config)?;
    let graph = build_trajectory_graph(
        two_link_arm(),
        off_path_obstacle_sdf()?,
        &start_conf(),
        &zero_vel(),
        &goal_conf(),
        &zero_vel(),
        &config,
    )?;

    let mut isam = IncrementalOptimizer::new(IncrementalConfig::default())?;
    isam.insert_values(&original)?;
    let factors = graph.iter().map(|(_, factor)| factor.clone()).collect();
    isam.update(factors, &[])?;

    let before = isam.estimate()?;
    let cliques = isam.bayes_tree().len();
    let result = isam.update(Vec::new(), &[FactorId(10_000)]);
    assert!(matches!(result, Err(PlannerError::InvalidState(_))));
    assert_eq!(isam.estimate()?, before);
    assert_eq!(isam.bayes_tree().len(), cliques);
    Ok(())
}

#[test]
fn test_failed_session_update_keeps_staged_edits() -> TestResult {
    let config = PlannerConfig::default();
    let original = original_plan(&config)?;
    let mut session =
        IncrementalTrajOptimizer::new(two_link_arm(), off_path_obstacle_sdf()?, config.clone())?;
    session.init_factor_graph(&start_conf(), &zero_vel(), &goal_conf(), &zero_vel())?;

    // No initial values yet: the staged factors reference unknown variables
    assert!(matches!(
        session.update(),
        Err(PlannerError::InvalidState(_))
    ));

    session.init_values(&original)?;
    let result = session.update()?;
    assert_eq!(result.cliques_total, 10);
    Ok(())
}
