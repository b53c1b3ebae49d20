use anyhow::{Context, Result};
use rand::Rng;
use rand::seq::IndexedRandom;
use tracing::info;

use crate::env::{ActionMask, GameEnv};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Policy {
    /// Uniform over the actions the mask currently allows.
    Random,
    /// Always action 0.
    Null,
}

impl Policy {
    pub fn choose<R: Rng>(&self, mask: &ActionMask, rng: &mut R) -> usize {
        match self {
            Policy::Random => mask.valid_actions().choose(rng).copied().unwrap_or(0),
            Policy::Null => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeStats {
    pub avg_reward: f64,
    pub avg_steps: f64,
    pub max_reward: f64,
    pub episodes: usize,
}

/// Plays `episodes` episodes. An episode ends when the game reports `done`
/// or after `time_limit` steps, whichever comes first.
pub fn run_episodes<R: Rng>(
    env: &mut GameEnv,
    policy: Policy,
    episodes: usize,
    time_limit: Option<u64>,
    rng: &mut R,
) -> Result<EpisodeStats> {
    let episodes = episodes.max(1);
    let mut total_reward = 0.0f64;
    let mut total_steps = 0u64;
    let mut max_reward = f64::NEG_INFINITY;

    for episode in 0..episodes {
        let reset = env
            .reset()
            .with_context(|| format!("reset failed in episode {episode}"))?;
        let mut mask = reset.action_mask;
        let mut ep_reward = 0.0f64;
        let mut ep_steps = 0u64;

        loop {
            let action = policy.choose(&mask, rng);
            let result = env
                .step(action)
                .with_context(|| format!("step {ep_steps} failed in episode {episode}"))?;
            ep_reward += result.reward;
            ep_steps += 1;
            mask = result.action_mask;

            if result.done || time_limit.is_some_and(|limit| ep_steps >= limit) {
                break;
            }
        }

        info!(episode, reward = ep_reward, steps = ep_steps, "episode complete");
        total_reward += ep_reward;
        total_steps += ep_steps;
        max_reward = max_reward.max(ep_reward);
    }

    let denom = episodes as f64;
    Ok(EpisodeStats {
        avg_reward: total_reward / denom,
        avg_steps: total_steps as f64 / denom,
        max_reward,
        episodes,
    })
}
