//! Shared helpers for the incremental-smoother integration tests: builders
//! for planar pose-chain problems in both vector (linear) and SE(2) form.

// Allow expect()/unwrap() in test code
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(dead_code)]

use crest_solver::core::key::{Key, key};
use crest_solver::core::values::{Value, Values};
use crest_solver::factors::{
    BetweenFactor, DiagonalNoise, NonlinearFactor, PriorFactor, Se2BetweenFactor, Se2PriorFactor,
};
use crest_solver::manifold::SE2;
use crest_solver::optimizer::Isam2;
use nalgebra::{DVector, dvector};

pub fn pose_key(i: u64) -> Key {
    key('x', i)
}

pub fn prior_noise() -> DiagonalNoise {
    DiagonalNoise::from_sigmas(dvector![0.3, 0.3, 0.1]).unwrap()
}

pub fn odometry_noise() -> DiagonalNoise {
    DiagonalNoise::from_sigmas(dvector![0.2, 0.2, 0.1]).unwrap()
}

/// Prior factor fixing a vector pose.
pub fn vector_prior(i: u64, pose: DVector<f64>) -> Box<dyn NonlinearFactor> {
    Box::new(PriorFactor::new(pose_key(i), pose, prior_noise()))
}

/// Odometry constraint between consecutive vector poses.
pub fn vector_odometry(from: u64, to: u64, motion: DVector<f64>) -> Box<dyn NonlinearFactor> {
    Box::new(BetweenFactor::new(
        pose_key(from),
        pose_key(to),
        motion,
        odometry_noise(),
    ))
}

pub fn se2_prior(i: u64, pose: SE2) -> Box<dyn NonlinearFactor> {
    Box::new(Se2PriorFactor::new(pose_key(i), pose, prior_noise()))
}

pub fn se2_odometry(from: u64, to: u64, motion: SE2) -> Box<dyn NonlinearFactor> {
    Box::new(Se2BetweenFactor::new(
        pose_key(from),
        pose_key(to),
        motion,
        odometry_noise(),
    ))
}

pub fn single_value(key: Key, value: Value) -> Values {
    let mut values = Values::new();
    values.insert(key, value).unwrap();
    values
}

/// Build an n-pose vector chain incrementally: one update per pose, each
/// advancing by `step` along x, with initial guesses offset by `guess_offset`.
/// Returns the smoother after n updates.
pub fn build_vector_chain(isam: &mut Isam2, n: u64, step: f64, guess_offset: f64) {
    for i in 0..n {
        let truth = dvector![step * i as f64, 0.0, 0.0];
        let guess = dvector![step * i as f64 + guess_offset, 0.0, 0.0];
        let values = single_value(pose_key(i), Value::Vector(guess));
        let factors: Vec<Box<dyn NonlinearFactor>> = if i == 0 {
            vec![vector_prior(0, truth)]
        } else {
            vec![vector_odometry(i - 1, i, dvector![step, 0.0, 0.0])]
        };
        isam.update(factors, values, &[], None, false)
            .expect("chain update succeeds");
    }
}

/// As `build_vector_chain` but on SE(2) poses.
pub fn build_se2_chain(isam: &mut Isam2, n: u64, step: f64, guess_offset: f64) {
    for i in 0..n {
        let truth = SE2::from_xy_angle(step * i as f64, 0.0, 0.0);
        let guess = SE2::from_xy_angle(step * i as f64 + guess_offset, 0.0, 0.01);
        let values = single_value(pose_key(i), Value::Se2(guess));
        let factors: Vec<Box<dyn NonlinearFactor>> = if i == 0 {
            vec![se2_prior(0, truth)]
        } else {
            vec![se2_odometry(i - 1, i, SE2::from_xy_angle(step, 0.0, 0.0))]
        };
        isam.update(factors, values, &[], None, false)
            .expect("chain update succeeds");
    }
}

/// Max-norm difference between two estimates of the same vector variable.
pub fn estimate_diff(a: &Values, b: &Values, key: &Key) -> f64 {
    let va = a.get(key).unwrap().as_vector().unwrap();
    let vb = b.get(key).unwrap().as_vector().unwrap();
    (va - vb).amax()
}
