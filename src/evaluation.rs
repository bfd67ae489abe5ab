// evaluation.rs - 评测线程
//
// AZ bot 对阵随机走子 MCTS, 对手模拟预算随难度指数放大。
// 各难度各自维护一个滑动窗口的近期平均回报, 进入学习线程的日志记录。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::AlphaZeroConfig;
use crate::game_env::BackgammonGame;
use crate::mcts::{ChildSelectionPolicy, Evaluator, MctsBot, MctsConfig, RolloutEvaluator};
use crate::queue::StopToken;
use crate::self_play::{init_az_bot, play_game};
use crate::training_log::{FileLogger, Logger};

// ==============================================================================
// --- 评测结果登记 ---
// ==============================================================================

struct EvalResultsInner {
    /// 每个难度一个滑动窗口
    results: Vec<VecDeque<f64>>,
    eval_num: usize,
}

/// 多线程共享的评测结果登记表
pub struct EvalResults {
    window: usize,
    inner: Mutex<EvalResultsInner>,
}

impl EvalResults {
    pub fn new(count: usize, evaluation_window: usize) -> Self {
        Self {
            window: evaluation_window.max(1),
            inner: Mutex::new(EvalResultsInner {
                results: (0..count).map(|_| VecDeque::new()).collect(),
                eval_num: 0,
            }),
        }
    }

    /// 每个难度已完成的评测局数
    pub fn eval_count(&self) -> usize {
        let inner = self.inner.lock().expect("eval results poisoned");
        inner.eval_num / inner.results.len().max(1)
    }

    /// 下一局的安排: (难度, AZ 是否执玩家 0)。难度与执子侧轮转。
    pub fn next(&self) -> (usize, bool) {
        let mut inner = self.inner.lock().expect("eval results poisoned");
        let count = inner.results.len().max(1);
        let next = inner.eval_num % (count * 2);
        inner.eval_num += 1;
        (next / 2, next % 2 == 0)
    }

    pub fn add(&self, difficulty: usize, value: f64) {
        let mut inner = self.inner.lock().expect("eval results poisoned");
        let window = self.window;
        let results = &mut inner.results[difficulty];
        results.push_back(value);
        while results.len() > window {
            results.pop_front();
        }
    }

    /// 每个难度的近期平均回报
    pub fn avg_results(&self) -> Vec<f64> {
        let inner = self.inner.lock().expect("eval results poisoned");
        inner
            .results
            .iter()
            .map(|window| {
                if window.is_empty() {
                    0.0
                } else {
                    window.iter().sum::<f64>() / window.len() as f64
                }
            })
            .collect()
    }
}

// ==============================================================================
// --- 评测线程 ---
// ==============================================================================

pub fn run_evaluator(
    game: &BackgammonGame,
    config: &AlphaZeroConfig,
    num: usize,
    results: &EvalResults,
    evaluator: Arc<dyn Evaluator>,
    stop: &StopToken,
) {
    let logger = match FileLogger::new(
        std::path::Path::new(&config.path),
        &format!("evaluator-{}", num),
    ) {
        Ok(l) => Logger::File(l),
        Err(_) => Logger::Noop,
    };
    let mut rng = StdRng::from_entropy();
    let rollout_evaluator: Arc<dyn Evaluator> = Arc::new(RolloutEvaluator::new(1, num as u64 + 1));

    let mut game_num: usize = 0;
    while !stop.stop_requested() {
        game_num += 1;
        let (difficulty, az_first) = results.next();
        let az_player = if az_first { 0 } else { 1 };
        let rollout_simulations =
            (config.max_simulations as f64 * 10f64.powf(difficulty as f64 / 2.0)) as usize;

        let az_bot = init_az_bot(config, evaluator.clone(), true, 0);
        let rollout_bot = MctsBot::new(
            MctsConfig {
                uct_c: config.uct_c,
                min_simulations: 0,
                max_simulations: rollout_simulations,
                max_memory_mb: 1000,
                solve: true,
                seed: (num * 1000 + game_num) as u64,
                child_selection: ChildSelectionPolicy::Uct,
                dirichlet_alpha: 0.0,
                dirichlet_epsilon: 0.0,
            },
            rollout_evaluator.clone(),
        );
        let mut bots = if az_player == 0 {
            [az_bot, rollout_bot]
        } else {
            [rollout_bot, az_bot]
        };

        logger.print(&format!("Running MCTS with {} simulations", rollout_simulations));
        let trajectory = match play_game(
            &logger,
            game_num,
            game,
            &mut bots,
            evaluator.as_ref(),
            &mut rng,
            1.0,
            0,
            game.max_utility() + 1.0,
            false,
        ) {
            Ok(t) => t,
            Err(err) => {
                if !stop.stop_requested() {
                    logger.print(&format!("evaluator failed: {:#}", err));
                    stop.stop();
                }
                break;
            }
        };

        results.add(difficulty, trajectory.returns[az_player]);
        logger.print(&format!(
            "Game {}: AZ: {:5.2}, MCTS: {:5.2}, MCTS-sims: {}, length: {}",
            game_num,
            trajectory.returns[az_player],
            trajectory.returns[1 - az_player],
            rollout_simulations,
            trajectory.states.len()
        ));
    }
    logger.print("Got a quit.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_alternates_difficulty_and_side() {
        let results = EvalResults::new(2, 10);
        assert_eq!(results.next(), (0, true));
        assert_eq!(results.next(), (0, false));
        assert_eq!(results.next(), (1, true));
        assert_eq!(results.next(), (1, false));
        assert_eq!(results.next(), (0, true));
    }

    #[test]
    fn test_window_bounds_results() {
        let results = EvalResults::new(1, 3);
        for i in 0..10 {
            results.add(0, i as f64);
        }
        // 窗口只保留最近 3 局: 7, 8, 9
        assert!((results.avg_results()[0] - 8.0).abs() < 1e-12);
    }

    #[test]
    fn test_eval_count_per_difficulty() {
        let results = EvalResults::new(2, 10);
        for _ in 0..6 {
            results.next();
        }
        assert_eq!(results.eval_count(), 3);
    }

    #[test]
    fn test_empty_window_averages_to_zero() {
        let results = EvalResults::new(3, 5);
        assert_eq!(results.avg_results(), vec![0.0, 0.0, 0.0]);
    }
}
