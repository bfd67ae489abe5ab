// src/mcts/evaluator.rs
// 状态评估接口定义

use std::sync::Mutex;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::game_env::BackgammonEnv;

/// 评估器特征 (Trait)
///
/// 为搜索提供两个能力: 状态价值 (每个玩家一项) 与先验分布。
/// 价值网络只训练价值头, 因此先验退化为合法动作上的均匀分布。
pub trait Evaluator: Send + Sync {
    /// 评估状态, 返回每个玩家视角的价值向量。
    /// 关停期间允许返回错误, 调用方据此结束循环。
    fn evaluate(&self, env: &BackgammonEnv) -> Result<Vec<f64>>;

    /// 决策节点上的先验 (动作, 概率) 列表
    fn prior(&self, env: &BackgammonEnv) -> Vec<(i64, f64)>;
}

/// 合法动作上的均匀先验
pub fn uniform_prior(env: &BackgammonEnv) -> Vec<(i64, f64)> {
    let actions = env.legal_actions();
    let p = 1.0 / actions.len().max(1) as f64;
    actions.into_iter().map(|a| (a, p)).collect()
}

/// 随机走子评估器: 用若干局随机对局的平均终局收益估值。
/// 作为评测基线 bot 的评估器使用。
pub struct RolloutEvaluator {
    n_rollouts: usize,
    rng: Mutex<StdRng>,
}

impl RolloutEvaluator {
    pub fn new(n_rollouts: usize, seed: u64) -> Self {
        let rng = if seed == 0 {
            StdRng::from_entropy()
        } else {
            StdRng::seed_from_u64(seed)
        };
        Self { n_rollouts: n_rollouts.max(1), rng: Mutex::new(rng) }
    }
}

impl Evaluator for RolloutEvaluator {
    fn evaluate(&self, env: &BackgammonEnv) -> Result<Vec<f64>> {
        let mut rng = self.rng.lock().expect("rollout rng poisoned");
        let mut totals = vec![0.0; 2];
        for _ in 0..self.n_rollouts {
            let mut state = env.clone();
            while !state.is_terminal() {
                let action = if state.is_chance_node() {
                    let outcomes = state.chance_outcomes();
                    let r: f64 = rng.gen_range(0.0..1.0);
                    let mut acc = 0.0;
                    let mut chosen = outcomes[outcomes.len() - 1].0;
                    for (a, p) in &outcomes {
                        acc += p;
                        if r < acc {
                            chosen = *a;
                            break;
                        }
                    }
                    chosen
                } else {
                    let actions = state.legal_actions();
                    actions[rng.gen_range(0..actions.len())]
                };
                state.apply_action(action);
            }
            let returns = state.returns();
            for (t, r) in totals.iter_mut().zip(returns.iter()) {
                *t += r;
            }
        }
        for t in totals.iter_mut() {
            *t /= self.n_rollouts as f64;
        }
        Ok(totals)
    }

    fn prior(&self, env: &BackgammonEnv) -> Vec<(i64, f64)> {
        uniform_prior(env)
    }
}
