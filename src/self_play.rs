// self_play.rs - 自对弈与轨迹生成
//
// 轨迹只记录决策状态。机会转移不入轨迹, 只把 "幸运度"
// (实际结果价值与期望价值之差, 玩家 0 视角) 累加进后续状态,
// 让学习信号反映决策质量而非骰子运气。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::AlphaZeroConfig;
use crate::game_env::{BackgammonEnv, BackgammonGame, Player};
use crate::mcts::{ChildSelectionPolicy, Evaluator, MctsBot, MctsConfig};
use crate::queue::{StopToken, ThreadedQueue};
use crate::training_log::{FileLogger, Logger};

/// 推入轨迹队列的等待上限, 超时记日志后重试
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);
/// 最多为前多少个 actor 线程打开日志文件
const MAX_ACTOR_LOG_FILES: usize = 20;

// ==============================================================================
// --- 轨迹 ---
// ==============================================================================

/// 一个决策状态的记录
#[derive(Debug, Clone)]
pub struct TrajState {
    pub observation: Vec<f32>,
    pub current_player: Player,
    pub action: i64,
    /// 所选子节点的搜索价值 (行动方视角):
    /// 已解算时取解算结果, 否则取网络自举值
    pub value: f64,
    /// 截至本状态的累计幸运度 (恒为玩家 0 视角)
    pub accum_luck: f64,
}

/// 一局完整自对弈的产物
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    pub states: Vec<TrajState>,
    pub returns: Vec<f64>,
}

// ==============================================================================
// --- 幸运度 ---
// ==============================================================================

/// 机会转移的幸运度: V(实际结果) - sum_i p_i * V(结果 i), V 为玩家 0 视角。
/// 在骰子分布下取期望为零。
pub fn evaluate_luck(
    state: &BackgammonEnv,
    action: i64,
    evaluator: &dyn Evaluator,
) -> Result<f64> {
    ensure!(state.is_chance_node(), "evaluate_luck on non-chance node");
    let mut avg_value = 0.0;
    let mut action_value = 0.0;
    let mut found = false;
    for (outcome, prob) in state.chance_outcomes() {
        let mut next = state.clone();
        next.apply_action(outcome);
        let value = evaluator.evaluate(&next)?[0];
        if outcome == action {
            ensure!(!found, "duplicate chance outcome {}", outcome);
            found = true;
            action_value = value;
        }
        avg_value += prob * value;
    }
    ensure!(found, "chosen outcome {} not in chance distribution", action);
    Ok(action_value - avg_value)
}

/// 按声明的分布采样一个机会结果
pub fn sample_chance_outcome<R: Rng>(outcomes: &[(i64, f64)], rng: &mut R) -> i64 {
    let total: f64 = outcomes.iter().map(|(_, p)| p).sum();
    let mut pick = rng.gen_range(0.0..1.0) * total;
    for (action, prob) in outcomes {
        pick -= prob;
        if pick <= 0.0 {
            return *action;
        }
    }
    outcomes[outcomes.len() - 1].0
}

// ==============================================================================
// --- 对局执行 ---
// ==============================================================================

/// 构建一个自对弈 / 评测用的 AZ bot。
/// 评测模式下关闭根节点噪声。
pub fn init_az_bot(
    config: &AlphaZeroConfig,
    evaluator: Arc<dyn Evaluator>,
    evaluation: bool,
    seed: u64,
) -> MctsBot {
    MctsBot::new(
        MctsConfig {
            uct_c: config.uct_c,
            min_simulations: config.min_simulations,
            max_simulations: config.max_simulations,
            max_memory_mb: 10,
            solve: false,
            seed,
            child_selection: ChildSelectionPolicy::Puct,
            dirichlet_alpha: if evaluation { 0.0 } else { config.policy_alpha },
            dirichlet_epsilon: if evaluation { 0.0 } else { config.policy_epsilon },
        },
        evaluator,
    )
}

/// 跑完一整局, 返回轨迹。
///
/// 机会节点: 按分布采样并累计幸运度。
/// 决策节点: 行动方的 bot 搜索后选子 (前 temperature_drop 步按访问数
/// 的 1/temperature 次幂采样, 之后取访问数最大者)。
/// 当记录价值的绝对值超过 cutoff_value 时提前终止, 以该价值充当回报。
#[allow(clippy::too_many_arguments)]
pub fn play_game(
    logger: &Logger,
    game_num: usize,
    game: &BackgammonGame,
    bots: &mut [MctsBot; 2],
    evaluator: &dyn Evaluator,
    rng: &mut StdRng,
    temperature: f64,
    temperature_drop: usize,
    cutoff_value: f64,
    verbose: bool,
) -> Result<Trajectory> {
    let mut state = game.new_initial_state(rng);
    let mut history: Vec<String> = Vec::new();
    let mut trajectory = Trajectory::default();
    let mut accum_luck = 0.0;

    loop {
        if state.is_chance_node() {
            let outcomes = state.chance_outcomes();
            let action = sample_chance_outcome(&outcomes, rng);
            accum_luck += evaluate_luck(&state, action, evaluator)?;
            state.apply_action(action);
            continue;
        }

        let player = state.acting_player();
        let tree = bots[player.idx()].search(&state)?;
        let chosen = if history.len() >= temperature_drop {
            tree.best_child()
        } else {
            tree.sample_child(temperature, rng)
        };
        let Some(chosen) = chosen else {
            // 决策节点永远有合法动作, 走到这里属于搜索不变量被破坏
            panic!("search returned no children for a decision node");
        };
        let node = tree.node(chosen);
        debug_assert_eq!(node.player, player);

        // 记录所选子节点的价值: 优先解算结果, 否则网络自举值。
        // 不用访问平均值 (被探索项扭曲)。
        let action_value = match node.outcome_for(player) {
            Some(v) => v,
            None => node.eval,
        };
        trajectory.states.push(TrajState {
            observation: state.observation_tensor(player),
            current_player: player,
            action: node.action,
            value: action_value,
            accum_luck,
        });

        let action_str = state.action_to_string(node.action);
        history.push(action_str.clone());
        state.apply_action(node.action);
        if verbose {
            logger.print(&format!(
                "Player: {}, action: {}, value: {:6.3}, accum_luck: {:6.3}",
                player, action_str, action_value, accum_luck
            ));
        }

        if state.is_terminal() {
            trajectory.returns = state.returns();
            break;
        } else if action_value.abs() > cutoff_value {
            let mut returns = vec![0.0; 2];
            returns[player.idx()] = action_value;
            returns[player.opponent().idx()] = -action_value;
            trajectory.returns = returns;
            break;
        }
    }

    logger.print(&format!(
        "Game {}: Returns: {:?}; Actions: {}",
        game_num,
        trajectory.returns,
        history.join(" ")
    ));
    Ok(trajectory)
}

// ==============================================================================
// --- Actor 线程 ---
// ==============================================================================

/// 自对弈工作线程主循环: 两个共享推理服务的 AZ bot 轮流执子,
/// 每局以 cutoff_probability 抽一次提前终止阈值, 产出推入轨迹队列。
pub fn run_actor(
    game: &BackgammonGame,
    config: &AlphaZeroConfig,
    num: usize,
    trajectory_queue: &ThreadedQueue<Trajectory>,
    evaluator: Arc<dyn Evaluator>,
    stop: &StopToken,
) {
    let logger = if num < MAX_ACTOR_LOG_FILES {
        match FileLogger::new(std::path::Path::new(&config.path), &format!("actor-{}", num)) {
            Ok(l) => Logger::File(l),
            Err(_) => Logger::Noop,
        }
    } else {
        Logger::Noop
    };

    let mut rng = StdRng::from_entropy();
    let mut bots = [
        init_az_bot(config, evaluator.clone(), false, 0),
        init_az_bot(config, evaluator.clone(), false, 0),
    ];

    let mut game_num: usize = 0;
    while !stop.stop_requested() {
        game_num += 1;
        let cutoff = if rng.gen_range(0.0..1.0f64) < config.cutoff_probability {
            config.cutoff_value
        } else {
            game.max_utility() + 1.0
        };

        let trajectory = match play_game(
            &logger,
            game_num,
            game,
            &mut bots,
            evaluator.as_ref(),
            &mut rng,
            config.temperature,
            config.temperature_drop,
            cutoff,
            true,
        ) {
            Ok(t) => t,
            Err(err) => {
                if !stop.stop_requested() {
                    logger.print(&format!("actor failed: {:#}", err));
                    stop.stop();
                }
                break;
            }
        };

        let mut pending = trajectory;
        loop {
            match trajectory_queue.push(pending, PUSH_TIMEOUT) {
                Ok(()) => break,
                Err(returned) => {
                    logger.print("Failed to push a trajectory after 10 seconds.");
                    if stop.stop_requested() {
                        break;
                    }
                    pending = returned;
                }
            }
        }
    }
    logger.print("Got a quit.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game_env::{Mover, ScoringType};
    use crate::mcts::uniform_prior;

    /// 以骰子内容区分局面的桩评估器
    struct DiceSensitiveEvaluator;

    impl Evaluator for DiceSensitiveEvaluator {
        fn evaluate(&self, env: &BackgammonEnv) -> Result<Vec<f64>> {
            // 只有 {1,2} 这对骰子得 1, 其余得 0
            let v = if env.dice_rolled() && env.dice(0) == 1 && env.dice(1) == 2 {
                1.0
            } else {
                0.0
            };
            Ok(vec![v, -v])
        }

        fn prior(&self, env: &BackgammonEnv) -> Vec<(i64, f64)> {
            uniform_prior(env)
        }
    }

    struct ConstantEvaluator(f64);

    impl Evaluator for ConstantEvaluator {
        fn evaluate(&self, _env: &BackgammonEnv) -> Result<Vec<f64>> {
            Ok(vec![self.0, -self.0])
        }

        fn prior(&self, env: &BackgammonEnv) -> Vec<(i64, f64)> {
            uniform_prior(env)
        }
    }

    fn chance_state() -> BackgammonEnv {
        let game = BackgammonGame::new("backgammon", ScoringType::WinLoss, false).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let mut env = game.new_initial_state(&mut rng);
        // 开局掷骰 -> X 行动 -> 走子耗尽 -> EndTurn -> O 选择 Roll -> 机会节点
        env.apply_action(1);
        while !env.is_chance_node() {
            let actions = env.legal_actions();
            env.apply_action(actions[0]);
        }
        env
    }

    #[test]
    fn test_luck_of_known_outcome() {
        let env = chance_state();
        assert_eq!(env.current_player(), Mover::Chance);
        // 结果 1 是 {1,2}: V=1, 期望 = 1/18 -> 幸运度 = 17/18
        let luck = evaluate_luck(&env, 1, &DiceSensitiveEvaluator).unwrap();
        assert!((luck - 17.0 / 18.0).abs() < 1e-9);
        // 其它结果: V=0 -> 幸运度 = -1/18
        let luck = evaluate_luck(&env, 5, &DiceSensitiveEvaluator).unwrap();
        assert!((luck + 1.0 / 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_luck_expectation_is_zero() {
        let env = chance_state();
        let outcomes = env.chance_outcomes();
        let mut expectation = 0.0;
        for (action, prob) in &outcomes {
            expectation += prob * evaluate_luck(&env, *action, &DiceSensitiveEvaluator).unwrap();
        }
        assert!(expectation.abs() < 1e-9);
    }

    #[test]
    fn test_luck_is_zero_under_constant_values() {
        let env = chance_state();
        for (action, _) in env.chance_outcomes() {
            let luck = evaluate_luck(&env, action, &ConstantEvaluator(0.37)).unwrap();
            assert!(luck.abs() < 1e-9);
        }
    }

    #[test]
    fn test_sample_chance_outcome_respects_distribution() {
        let outcomes = vec![(1i64, 0.0), (2i64, 1.0)];
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..20 {
            assert_eq!(sample_chance_outcome(&outcomes, &mut rng), 2);
        }
    }

    #[test]
    fn test_play_game_records_only_decisions() {
        let game = BackgammonGame::new("backgammon", ScoringType::WinLoss, false).unwrap();
        let config = AlphaZeroConfig {
            max_simulations: 8,
            temperature_drop: 0,
            ..Default::default()
        };
        let evaluator: Arc<dyn Evaluator> = Arc::new(ConstantEvaluator(0.5));
        let mut bots = [
            init_az_bot(&config, evaluator.clone(), true, 1),
            init_az_bot(&config, evaluator.clone(), true, 2),
        ];
        let mut rng = StdRng::seed_from_u64(9);
        // cutoff 阈值 0.4 < 记录值 0.5, 第一次决策后即截断
        let trajectory = play_game(
            &Logger::Noop,
            1,
            &game,
            &mut bots,
            evaluator.as_ref(),
            &mut rng,
            1.0,
            0,
            0.4,
            false,
        )
        .unwrap();

        assert!(!trajectory.states.is_empty());
        assert_eq!(trajectory.returns.len(), 2);
        assert!((trajectory.returns[0] + trajectory.returns[1]).abs() < 1e-12);
        // 每条记录都是决策 (动作合法且有行动方)
        for s in &trajectory.states {
            assert!(s.action > 0);
        }
    }
}
