// src/mcts/search.rs
// PUCT / UCT 搜索主循环
//
// 与常规 AlphaZero 搜索的差异集中在机会节点:
// 机会节点的子项按转移概率采样而非置信上界选择,
// 回传沿掷骰方视角原样传递。不要修改这两处的处理方式。

use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Dirichlet, Distribution};
use slab::Slab;

use crate::game_env::BackgammonEnv;

use super::config::{ChildSelectionPolicy, MctsConfig};
use super::evaluator::Evaluator;
use super::node::{SearchNode, SearchTree};

/// MCTS 搜索器
///
/// 每次 `search` 调用都会构建一棵新树并返回, 由调用方读取根节点
/// 子项做动作选择。评估器通过 Arc 共享, 允许多个 bot 共用同一个
/// 批量推理服务。
pub struct MctsBot {
    config: MctsConfig,
    evaluator: Arc<dyn Evaluator>,
    rng: StdRng,
    max_nodes: usize,
}

impl MctsBot {
    pub fn new(config: MctsConfig, evaluator: Arc<dyn Evaluator>) -> Self {
        let rng = if config.seed == 0 {
            StdRng::from_entropy()
        } else {
            StdRng::seed_from_u64(config.seed)
        };
        // 内存预算折算为节点数上限
        let node_size = std::mem::size_of::<SearchNode>().max(1);
        let max_nodes = (config.max_memory_mb.max(1) * (1 << 20)) / node_size;
        Self { config, evaluator, rng, max_nodes }
    }

    pub fn config(&self) -> &MctsConfig {
        &self.config
    }

    /// 从给定决策状态出发执行一次完整搜索
    pub fn search(&mut self, env: &BackgammonEnv) -> Result<SearchTree> {
        let mut arena: Slab<SearchNode> = Slab::with_capacity(256);
        let root_player = env.acting_player();
        let root = arena.insert(SearchNode::new(0, root_player, 1.0));
        let max_utility = env.max_utility();

        for sim in 0..self.config.max_simulations.max(1) {
            if sim >= self.config.min_simulations {
                if !arena[root].outcome.is_empty() {
                    break;
                }
                if arena.len() >= self.max_nodes {
                    break;
                }
            }

            let mut state = env.clone();
            let path = self.apply_tree_policy(&mut arena, root, &mut state);
            let leaf = *path.last().expect("visit path is never empty");

            let (returns, terminal) = if state.is_terminal() {
                (state.returns(), true)
            } else {
                (self.evaluator.evaluate(&state)?, false)
            };

            {
                let node = &mut arena[leaf];
                if node.explore_count == 0 {
                    node.eval = returns[node.player.idx()];
                }
            }

            for &idx in path.iter().rev() {
                let node = &mut arena[idx];
                node.total_reward += returns[node.player.idx()];
                node.explore_count += 1;
            }

            if terminal && self.config.solve {
                arena[leaf].outcome = returns;
                for &idx in path.iter().rev().skip(1) {
                    if !Self::try_resolve(&mut arena, idx, max_utility) {
                        break;
                    }
                }
            }
        }

        Ok(SearchTree { arena, root })
    }

    /// 自根向下选择直至叶节点, 途中扩展未展开的节点。
    /// 返回访问路径 (含根), state 被推进到叶节点对应局面。
    fn apply_tree_policy(
        &mut self,
        arena: &mut Slab<SearchNode>,
        root: usize,
        state: &mut BackgammonEnv,
    ) -> Vec<usize> {
        let mut path = vec![root];
        let mut current = root;

        loop {
            if state.is_terminal() {
                return path;
            }

            if arena[current].children.is_empty() {
                self.expand(arena, current, current == root, state);
                return path;
            }

            let next = if arena[current].is_chance {
                self.sample_chance_child(arena, current)
            } else {
                self.select_child(arena, current)
            };
            state.apply_action(arena[next].action);
            path.push(next);
            current = next;
        }
    }

    fn expand(
        &mut self,
        arena: &mut Slab<SearchNode>,
        idx: usize,
        is_root: bool,
        state: &BackgammonEnv,
    ) {
        if state.is_chance_node() {
            // 结果边: 先验即转移概率, 玩家继承掷骰方
            let inherited = arena[idx].player;
            let outcomes = state.chance_outcomes();
            let mut children = Vec::with_capacity(outcomes.len());
            for (action, prob) in outcomes {
                children.push(arena.insert(SearchNode::new(action, inherited, prob)));
            }
            let node = &mut arena[idx];
            node.is_chance = true;
            node.children = children;
            return;
        }

        let player = state.acting_player();
        let mut prior = self.evaluator.prior(state);
        // 打乱同先验动作的遍历次序, 避免选择偏向编号小的动作
        prior.shuffle(&mut self.rng);

        if is_root
            && self.config.dirichlet_alpha > 0.0
            && self.config.dirichlet_epsilon > 0.0
            && prior.len() >= 2
        {
            let dist = Dirichlet::new_with_size(self.config.dirichlet_alpha, prior.len())
                .expect("Dirichlet parameters are valid by construction");
            let noise = dist.sample(&mut self.rng);
            let eps = self.config.dirichlet_epsilon;
            for ((_, p), n) in prior.iter_mut().zip(noise.iter()) {
                *p = (1.0 - eps) * *p + eps * n;
            }
        }

        let mut children = Vec::with_capacity(prior.len());
        for (action, p) in prior {
            children.push(arena.insert(SearchNode::new(action, player, p)));
        }
        arena[idx].children = children;
    }

    /// 决策节点: 置信上界最大化
    fn select_child(&mut self, arena: &Slab<SearchNode>, idx: usize) -> usize {
        let node = &arena[idx];
        let parent_n = node.explore_count.max(1) as f64;
        let uct_c = self.config.uct_c;

        let mut best = node.children[0];
        let mut best_score = f64::NEG_INFINITY;
        for &c in &node.children {
            let child = &arena[c];
            let n = child.explore_count as f64;
            // 已解算子节点按其解算价值参与比较
            let q = match child.outcome_for(child.player) {
                Some(v) => v,
                None => child.q_value(),
            };
            let score = match self.config.child_selection {
                ChildSelectionPolicy::Uct => {
                    if child.explore_count == 0 {
                        f64::INFINITY
                    } else {
                        q + uct_c * (parent_n.ln() / n).sqrt()
                    }
                }
                ChildSelectionPolicy::Puct => {
                    q + uct_c * child.prior * parent_n.sqrt() / (1.0 + n)
                }
            };
            if score > best_score {
                best_score = score;
                best = c;
            }
        }
        best
    }

    /// 机会节点: 按转移概率采样, 不使用置信上界
    fn sample_chance_child(&mut self, arena: &Slab<SearchNode>, idx: usize) -> usize {
        let node = &arena[idx];
        let total: f64 = node.children.iter().map(|&c| arena[c].prior).sum();
        let mut pick = self.rng.gen_range(0.0..1.0) * total;
        for &c in &node.children {
            pick -= arena[c].prior;
            if pick <= 0.0 {
                return c;
            }
        }
        *node.children.last().expect("chance node has outcomes")
    }

    /// Solver 回传: 决策节点取行动方最优 (出现必胜子项或全部解算时收束);
    /// 机会节点仅在所有结果解算且结局一致时收束。
    fn try_resolve(arena: &mut Slab<SearchNode>, idx: usize, max_utility: f64) -> bool {
        if !arena[idx].outcome.is_empty() {
            return true;
        }
        let children = arena[idx].children.clone();
        if children.is_empty() {
            return false;
        }

        if arena[idx].is_chance {
            let first = arena[children[0]].outcome.clone();
            if first.is_empty() {
                return false;
            }
            for &c in &children[1..] {
                if arena[c].outcome != first {
                    return false;
                }
            }
            arena[idx].outcome = first;
            return true;
        }

        let mover = arena[children[0]].player;
        let mut best: Option<Vec<f64>> = None;
        let mut all_solved = true;
        for &c in &children {
            match arena[c].outcome_for(mover) {
                None => all_solved = false,
                Some(v) => {
                    let better = match &best {
                        None => true,
                        Some(b) => v > b[mover.idx()],
                    };
                    if better {
                        best = Some(arena[c].outcome.clone());
                    }
                }
            }
        }
        if let Some(b) = best {
            if all_solved || b[mover.idx()] >= max_utility {
                arena[idx].outcome = b;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game_env::{BackgammonGame, Player, ScoringType, NUM_POINTS, NUM_PLAYERS};
    use crate::mcts::evaluator::uniform_prior;
    use std::sync::Mutex;

    /// 返回固定值的桩评估器
    struct FixedEvaluator {
        value: f64,
        calls: Mutex<usize>,
    }

    impl Evaluator for FixedEvaluator {
        fn evaluate(&self, _env: &BackgammonEnv) -> Result<Vec<f64>> {
            *self.calls.lock().unwrap() += 1;
            Ok(vec![self.value, -self.value])
        }

        fn prior(&self, env: &BackgammonEnv) -> Vec<(i64, f64)> {
            uniform_prior(env)
        }
    }

    fn near_terminal_env() -> BackgammonEnv {
        let game = BackgammonGame::new("backgammon", ScoringType::WinLoss, false).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let mut env = game.new_initial_state(&mut rng);
        // X 剩最后一子, 6 点直接出局
        let mut board = [[0; NUM_POINTS]; NUM_PLAYERS];
        board[0][18] = 1;
        board[1][5] = 15;
        env.set_state(Player::X, vec![6, 5], [0, 0], [14, 0], board);
        env
    }

    #[test]
    fn test_search_visits_root_children() {
        let env = near_terminal_env();
        let evaluator = Arc::new(FixedEvaluator { value: 0.3, calls: Mutex::new(0) });
        let mut bot = MctsBot::new(
            MctsConfig { max_simulations: 50, seed: 5, ..Default::default() },
            evaluator,
        );
        let tree = bot.search(&env).unwrap();
        let root = tree.root_node();
        assert!(!root.children.is_empty());
        assert!(root.explore_count > 0);
        let best = tree.best_child().unwrap();
        assert_eq!(tree.node(best).player, Player::X);
    }

    #[test]
    fn test_solver_resolves_immediate_win() {
        let env = near_terminal_env();
        let evaluator = Arc::new(FixedEvaluator { value: 0.0, calls: Mutex::new(0) });
        let mut bot = MctsBot::new(
            MctsConfig {
                max_simulations: 200,
                solve: true,
                seed: 9,
                child_selection: ChildSelectionPolicy::Uct,
                ..Default::default()
            },
            evaluator,
        );
        let tree = bot.search(&env).unwrap();
        let best = tree.best_child().unwrap();
        // 6/Off 直接取胜, solver 应标记必胜
        let node = tree.node(best);
        assert_eq!(node.outcome_for(Player::X), Some(1.0));
    }

    #[test]
    fn test_recorded_value_prefers_outcome_over_eval() {
        let env = near_terminal_env();
        let evaluator = Arc::new(FixedEvaluator { value: 0.123, calls: Mutex::new(0) });
        let mut bot = MctsBot::new(
            MctsConfig { max_simulations: 100, solve: true, seed: 2, ..Default::default() },
            evaluator,
        );
        let tree = bot.search(&env).unwrap();
        let best = tree.best_child().unwrap();
        let node = tree.node(best);
        let value = match node.outcome_for(node.player) {
            Some(v) => v,
            None => node.eval,
        };
        assert_eq!(value, 1.0);
    }

    #[test]
    fn test_memory_budget_bounds_tree() {
        let env = near_terminal_env();
        let evaluator = Arc::new(FixedEvaluator { value: 0.0, calls: Mutex::new(0) });
        let mut bot = MctsBot::new(
            MctsConfig { max_simulations: 10_000, max_memory_mb: 1, seed: 3, ..Default::default() },
            evaluator,
        );
        let tree = bot.search(&env).unwrap();
        let node_size = std::mem::size_of::<SearchNode>();
        assert!(tree.arena.len() * node_size <= 2 * (1 << 20));
    }
}
