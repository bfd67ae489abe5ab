// learner.rs - 学习线程
//
// 消费轨迹 -> 计算幸运度修正的 TD(λ) 目标 -> 训练 -> 分发权重。
// 每步落盘回放缓冲与 "最新" 检查点, 并向 learner.jsonl 写一条结构化记录。

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Map, Value};

use crate::config::AlphaZeroConfig;
use crate::device::DeviceManager;
use crate::game_env::{BackgammonGame, Player, PLAYER_CENTRIC_OBS};
use crate::inference::VNetEvaluator;
use crate::evaluation::EvalResults;
use crate::nn_model::{LossInfo, MOST_RECENT_CHECKPOINT_STEP};
use crate::queue::{StopToken, ThreadedQueue};
use crate::replay::{ReplayBuffer, ReplaySample};
use crate::self_play::Trajectory;
use crate::stats::{BasicStats, HistogramNamed, HistogramNumbered};
use crate::training_log::{DataLoggerJsonLines, FileLogger, StartInfo};

/// 价值精度统计把一局分成的阶段数
const STAGE_COUNT: usize = 7;
/// 队列弹出的轮询周期
const POP_TIMEOUT: Duration = Duration::from_millis(250);

fn near(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

// ==============================================================================
// --- TD(λ) 回报 ---
// ==============================================================================

/// 从 state_idx 开始的 λ 折扣回报 (玩家 0 视角), 已做幸运度修正。
///
/// 终局自举 = 玩家 0 回报 - (终局累计幸运度 - 本状态累计幸运度), 截断到 [-1, 1];
/// 后续状态的价值同样减去相对幸运度增量。
/// td_n_steps > 0 时在第 n 步截断: 截断处的尾项不带 (1-λ) 权重。
pub fn td_lambda_returns(
    trajectory: &Trajectory,
    state_idx: usize,
    td_lambda: f64,
    td_n_steps: usize,
) -> f64 {
    let states = &trajectory.states;
    let s_state = &states[state_idx];
    let accum_luck = s_state.accum_luck;

    let outcome = trajectory.returns[0] - (states[states.len() - 1].accum_luck - accum_luck);
    let outcome = outcome.clamp(-1.0, 1.0);

    if td_lambda >= 1.0 || near(td_lambda, 1.0) {
        // λ = 1 退化为终局回报 (或第 n 步的价值)
        if td_n_steps == 0 {
            return outcome;
        }
        let idx = state_idx + td_n_steps;
        if idx >= states.len() {
            return outcome;
        }
        let n_state = &states[idx];
        return n_state.value * n_state.current_player.sign()
            - (n_state.accum_luck - accum_luck);
    }

    let mut retval = s_state.value * s_state.current_player.sign();
    if td_lambda <= 0.0 || near(td_lambda, 0.0) {
        // λ = 0 退化为起始状态自身的价值
        return retval;
    }

    let lambda_inv = 1.0 - td_lambda;
    let mut lambda_pow = td_lambda;
    retval *= lambda_inv;
    for i in (state_idx + 1)..states.len() {
        let i_state = &states[i];
        let value = i_state.value * i_state.current_player.sign()
            - (i_state.accum_luck - accum_luck);
        if td_n_steps > 0 && i == state_idx + td_n_steps {
            retval += lambda_pow * value;
            return retval;
        }
        retval += lambda_inv * lambda_pow * value;
        lambda_pow *= td_lambda;
    }
    retval += lambda_pow * outcome;
    retval
}

// ==============================================================================
// --- 学习循环 ---
// ==============================================================================

#[allow(clippy::too_many_arguments)]
pub fn run_learner(
    game: &BackgammonGame,
    config: &AlphaZeroConfig,
    device_manager: &DeviceManager,
    cpu_device_manager: &DeviceManager,
    eval: &VNetEvaluator,
    actor_eval: Option<&VNetEvaluator>,
    trajectory_queue: &ThreadedQueue<Trajectory>,
    eval_results: &EvalResults,
    stop: &StopToken,
    start_info: StartInfo,
    verbose: bool,
) -> Result<()> {
    let path = Path::new(&config.path);
    let logger = FileLogger::new(path, "learner")?;
    let data_logger = DataLoggerJsonLines::new(path, "learner", start_info.start_elapsed)?;
    let mut rng = StdRng::from_entropy();

    let device_id = 0; // 第一个设备固定为学习设备
    logger.print(&format!(
        "Running the learner on device {}: {:?}",
        device_id,
        device_manager.loan(device_id).device()
    ));

    let buffer_path = path.join("replay_buffer.data");
    let mut replay_buffer: ReplayBuffer<ReplaySample> =
        ReplayBuffer::new(config.replay_buffer_size);
    if start_info.start_step > 1 && buffer_path.exists() {
        replay_buffer = ReplayBuffer::load(&buffer_path)?;
        logger.print(&format!("Loaded replay buffer: {} states", replay_buffer.len()));
    }

    let learn_rate = (config.replay_buffer_size / config.replay_buffer_reuse).max(1);
    let mut total_trajectories = start_info.total_trajectories;

    let mut value_accuracies: Vec<BasicStats> =
        (0..STAGE_COUNT).map(|_| BasicStats::new()).collect();
    let mut value_predictions: Vec<BasicStats> =
        (0..STAGE_COUNT).map(|_| BasicStats::new()).collect();
    let mut game_lengths = BasicStats::new();
    let mut game_lengths_hist = HistogramNumbered::new(game.max_game_length() + 1);
    let mut outcomes = HistogramNamed::new(&["Player1", "Player2", "Draw"]);

    // actor 线程多半已经跑了一阵, 把起点放到过去, 避免首步吞吐量虚高
    let mut last = Instant::now() - Duration::from_secs(60);

    let mut step = start_info.start_step;
    while !stop.stop_requested() && (config.max_steps == 0 || step <= config.max_steps) {
        outcomes.reset();
        game_lengths.reset();
        game_lengths_hist.reset();
        for stats in value_accuracies.iter_mut() {
            stats.reset();
        }
        for stats in value_predictions.iter_mut() {
            stats.reset();
        }

        // 1. 收集轨迹, 直至消费 learn_rate 个决策状态
        let queue_size = trajectory_queue.size();
        let mut num_states: usize = 0;
        let mut num_trajectories: usize = 0;
        while !stop.stop_requested() && num_states < learn_rate {
            let Some(trajectory) = trajectory_queue.pop(POP_TIMEOUT) else {
                continue;
            };
            num_trajectories += 1;
            total_trajectories += 1;
            game_lengths.add(trajectory.states.len() as f64);
            game_lengths_hist.add(trajectory.states.len());

            let p1_outcome = trajectory.returns[0];
            outcomes.add(if p1_outcome > 0.0 {
                0
            } else if p1_outcome < 0.0 {
                1
            } else {
                2
            });

            for i in 0..trajectory.states.len() {
                let state = &trajectory.states[i];
                let mut value =
                    td_lambda_returns(&trajectory, i, config.td_lambda, config.td_n_steps);
                // 行动方中心观测时把目标翻回行动方视角
                if PLAYER_CENTRIC_OBS && state.current_player != Player::X {
                    value = -value;
                }
                replay_buffer.add(ReplaySample {
                    observation: state.observation.clone(),
                    value,
                });
                if verbose && num_trajectories == 1 {
                    let v0 = state.value * state.current_player.sign();
                    logger.print(&format!(
                        "Idx: {}  Player: {}  Value0: {:0.3}  Accum: {:0.3}  TrainTo: {:0.3}",
                        i, state.current_player, v0, state.accum_luck, value
                    ));
                }
                num_states += 1;
            }

            // 按对局进度分阶段统计价值精度
            for stage in 0..STAGE_COUNT {
                let index = (trajectory.states.len() - 1) * stage / (STAGE_COUNT - 1);
                let s = &trajectory.states[index];
                let accurate =
                    (s.value >= 0.0) == (trajectory.returns[s.current_player.idx()] >= 0.0);
                value_accuracies[stage].add(if accurate { 1.0 } else { 0.0 });
                value_predictions[stage].add(s.value.abs());
            }
        }
        let now = Instant::now();
        let seconds = (now - last).as_secs_f64();

        logger.print(&format!("Step: {}", step));
        logger.print(&format!(
            "Collected {:5} states from {:3} games, {:.1} states/s; {:.1} states/(s*actor), game length: {:.1}",
            num_states,
            num_trajectories,
            num_states as f64 / seconds,
            num_states as f64 / (config.actors as f64 * seconds),
            num_states as f64 / num_trajectories.max(1) as f64,
        ));
        logger.print(&format!(
            "Queue size: {}. Buffer size: {}. States seen: {}",
            queue_size,
            replay_buffer.len(),
            replay_buffer.total_added()
        ));

        if stop.stop_requested() {
            break;
        }
        last = now;

        // 2. 回放缓冲落盘 (崩溃恢复无损)
        replay_buffer.save(&buffer_path).context("persist replay buffer")?;

        // 3. 训练
        let mut losses = LossInfo::default();
        {
            device_manager.set_learning(config.explicit_learning);
            let num_batches = replay_buffer.len() / config.train_batch_size;
            for _ in 0..num_batches {
                let batch = replay_buffer.sample(&mut rng, config.train_batch_size);
                let mut learn_model = device_manager.loan(device_id);
                losses += learn_model.learn(&batch)?;
            }
            device_manager.set_learning(false);
        }
        let losses = losses.averaged();

        // 4. 检查点: 每步写 "最新", 周期性写编号检查点, 其余副本重载
        let checkpoint_path = device_manager
            .loan(device_id)
            .save_checkpoint(MOST_RECENT_CHECKPOINT_STEP)?;
        if step % config.checkpoint_freq == 0 {
            device_manager.loan(device_id).save_checkpoint(step)?;
        }
        for i in 0..device_manager.count() {
            if i != device_id {
                device_manager.loan(i).load_checkpoint_path(&checkpoint_path)?;
            }
        }
        for i in 0..cpu_device_manager.count() {
            cpu_device_manager.loan(i).load_checkpoint_path(&checkpoint_path)?;
        }
        logger.print(&format!("Checkpoint saved: {}", checkpoint_path));

        // 5. 结构化记录
        let mut record = Map::new();
        record.insert("step".to_string(), json!(step));
        record.insert("total_states".to_string(), json!(replay_buffer.total_added()));
        record.insert("states_per_s".to_string(), json!(num_states as f64 / seconds));
        record.insert(
            "states_per_s_actor".to_string(),
            json!(num_states as f64 / (config.actors as f64 * seconds)),
        );
        record.insert("total_trajectories".to_string(), json!(total_trajectories));
        record.insert(
            "trajectories_per_s".to_string(),
            json!(num_trajectories as f64 / seconds),
        );
        record.insert("queue_size".to_string(), json!(queue_size));
        record.insert("game_length".to_string(), game_lengths.to_json());
        record.insert("game_length_hist".to_string(), game_lengths_hist.to_json());
        record.insert("outcomes".to_string(), outcomes.to_json());
        record.insert(
            "value_accuracy".to_string(),
            Value::Array(value_accuracies.iter().map(|s| s.to_json()).collect()),
        );
        record.insert(
            "value_prediction".to_string(),
            Value::Array(value_predictions.iter().map(|s| s.to_json()).collect()),
        );
        record.insert(
            "eval".to_string(),
            json!({
                "count": eval_results.eval_count(),
                "results": eval_results.avg_results(),
            }),
        );
        record.insert("batch_size".to_string(), eval.batch_size_stats().to_json());
        record.insert("batch_size_hist".to_string(), eval.batch_size_histogram().to_json());
        record.insert(
            "loss".to_string(),
            json!({
                "value": losses.value,
                "l2reg": losses.l2,
                "sum": losses.total(),
            }),
        );
        eval.reset_batch_size_stats();
        logger.print(&format!(
            "Losses: value: {:.4}, l2: {:.4}, sum: {:.4}",
            losses.value,
            losses.l2,
            losses.total()
        ));

        // 6. 缓存统计与清空 (新权重不被旧命中掩盖)
        let cache_info = eval.cache_info();
        if cache_info.size > 0 {
            logger.print(&format!(
                "Cache size: {}/{}: {:.1}%, hits: {}, misses: {}, hit rate: {:.3}%",
                cache_info.size,
                cache_info.max_size,
                100.0 * cache_info.usage(),
                cache_info.hits,
                cache_info.misses,
                100.0 * cache_info.hit_rate()
            ));
        }
        record.insert(
            "cache".to_string(),
            json!({
                "size": cache_info.size,
                "max_size": cache_info.max_size,
                "usage": cache_info.usage(),
                "requests": cache_info.total(),
                "requests_per_s": cache_info.total() as f64 / seconds,
                "hits": cache_info.hits,
                "misses": cache_info.misses,
                "misses_per_s": cache_info.misses as f64 / seconds,
                "hit_rate": cache_info.hit_rate(),
            }),
        );
        eval.clear_cache();
        if let Some(actor_eval) = actor_eval {
            // actor/evaluator 线程走独立 CPU 推理池时, 它的缓存也要随权重失效
            actor_eval.clear_cache();
        }

        data_logger.write(record)?;
        logger.print("");
        step += 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::self_play::TrajState;

    fn trajectory(values: &[f64], lucks: &[f64], p0_return: f64) -> Trajectory {
        let states = values
            .iter()
            .zip(lucks)
            .map(|(&v, &l)| TrajState {
                observation: Vec::new(),
                current_player: Player::X,
                action: 1,
                value: v,
                accum_luck: l,
            })
            .collect();
        Trajectory { states, returns: vec![p0_return, -p0_return] }
    }

    #[test]
    fn test_lambda_mixture_closed_form() {
        // v = [0.2, 0.4, -0.1], luck = [0, 0.1, 0.1], 回报 +1, λ=0.5, n=0
        let traj = trajectory(&[0.2, 0.4, -0.1], &[0.0, 0.1, 0.1], 1.0);
        let expected = 0.2 * 0.5
            + 0.5 * (0.5 * (0.4 - 0.1) + 0.25 * (-0.1 - 0.1))
            + 0.125 * 0.9;
        let got = td_lambda_returns(&traj, 0, 0.5, 0);
        assert!((got - expected).abs() < 1e-12, "got {} expected {}", got, expected);
    }

    #[test]
    fn test_lambda_one_returns_clipped_outcome() {
        let traj = trajectory(&[0.2, 0.4], &[0.0, -0.5], 1.0);
        // 终局自举 = 1 - (-0.5 - 0) = 1.5 -> 截断到 1
        assert_eq!(td_lambda_returns(&traj, 0, 1.0, 0), 1.0);
    }

    #[test]
    fn test_lambda_one_with_n_steps_bootstraps_nth_state() {
        let traj = trajectory(&[0.2, 0.4, -0.1, 0.3], &[0.0, 0.1, 0.1, 0.2], 1.0);
        // n=2: 回到 idx 2 的价值减幸运度增量
        let got = td_lambda_returns(&traj, 0, 1.0, 2);
        assert!((got - (-0.1 - 0.1)).abs() < 1e-12);
        // n 越界时回退到终局自举
        let got = td_lambda_returns(&traj, 2, 1.0, 5);
        let expected = (1.0f64 - (0.2 - 0.1)).clamp(-1.0, 1.0);
        assert!((got - expected).abs() < 1e-12);
    }

    #[test]
    fn test_lambda_zero_returns_own_value() {
        let traj = trajectory(&[0.2, 0.4, -0.1], &[0.0, 0.1, 0.1], 1.0);
        assert_eq!(td_lambda_returns(&traj, 1, 0.0, 0), 0.4);
    }

    #[test]
    fn test_n_step_tail_has_no_lambda_inv_weight() {
        // n=1 截断: target = v0*(1-λ) + λ*(v1 - ΔL), 不乘 (1-λ)
        let traj = trajectory(&[0.2, 0.4, -0.1], &[0.0, 0.1, 0.1], 1.0);
        let got = td_lambda_returns(&traj, 0, 0.5, 1);
        let expected = 0.2 * 0.5 + 0.5 * (0.4 - 0.1);
        assert!((got - expected).abs() < 1e-12);
    }

    #[test]
    fn test_returns_bounded_after_clipping() {
        // 夸张的幸运度也不会把目标推出 [-1-ε, 1+ε]
        let traj = trajectory(&[0.9, -0.8, 0.7], &[0.0, 3.0, -3.0], 1.0);
        for idx in 0..3 {
            for lambda in [0.0, 0.3, 0.7, 1.0] {
                let v = td_lambda_returns(&traj, idx, lambda, 0);
                assert!(v.is_finite());
                if lambda >= 1.0 {
                    assert!(v.abs() <= 1.0 + 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_opponent_perspective_sign() {
        // O 行动的状态: 其价值进入玩家 0 视角时取反
        let mut traj = trajectory(&[0.6], &[0.0], 1.0);
        traj.states[0].current_player = Player::O;
        assert_eq!(td_lambda_returns(&traj, 0, 0.0, 0), -0.6);
    }
}
