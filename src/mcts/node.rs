// src/mcts/node.rs
// 搜索树节点与内存池

use rand::Rng;
use slab::Slab;

use crate::game_env::Player;

/// MCTS 树节点 (Slab 版本)
///
/// 节点由父节点指向的动作边标识, 通过 usize 索引引用子节点,
/// 以减少堆碎片化并改善缓存局部性。整棵树由 SearchTree 持有,
/// 随 Slab 一起整体释放。
#[derive(Debug, Clone)]
pub struct SearchNode {
    /// 从父节点到达本节点的动作
    pub action: i64,
    /// 执行该动作的玩家。机会节点的结果边继承掷骰方,
    /// 使价值回传不发生视角翻转。
    pub player: Player,
    /// 先验概率 (决策边来自评估器, 机会边等于转移概率)
    pub prior: f64,
    /// 访问次数 (N)
    pub explore_count: u32,
    /// 价值总和 (W), 以 player 视角累计
    pub total_reward: f64,
    /// 网络自举价值, 以 player 视角记录; 在节点第一次被评估时填充
    pub eval: f64,
    /// 已解算的终局价值向量 (每个玩家一项), 空表示未解算
    pub outcome: Vec<f64>,
    /// 该节点对应状态是否为机会节点 (在扩展时填充)
    pub is_chance: bool,
    /// 子节点在 Slab 中的索引
    pub children: Vec<usize>,
}

impl SearchNode {
    pub fn new(action: i64, player: Player, prior: f64) -> Self {
        Self {
            action,
            player,
            prior,
            explore_count: 0,
            total_reward: 0.0,
            eval: 0.0,
            outcome: Vec::new(),
            is_chance: false,
            children: Vec::new(),
        }
    }

    /// 平均动作价值 Q = W / N
    pub fn q_value(&self) -> f64 {
        if self.explore_count == 0 {
            0.0
        } else {
            self.total_reward / self.explore_count as f64
        }
    }

    /// 已解算节点从 player 视角的价值
    pub fn outcome_for(&self, player: Player) -> Option<f64> {
        if self.outcome.is_empty() {
            None
        } else {
            Some(self.outcome[player.idx()])
        }
    }
}

/// 一次搜索产出的完整树
pub struct SearchTree {
    pub arena: Slab<SearchNode>,
    pub root: usize,
}

impl SearchTree {
    pub fn node(&self, idx: usize) -> &SearchNode {
        &self.arena[idx]
    }

    pub fn root_node(&self) -> &SearchNode {
        &self.arena[self.root]
    }

    /// 最终决策: 先比已解算价值, 再比访问次数, 最后比累计价值
    pub fn best_child(&self) -> Option<usize> {
        let root = self.root_node();
        root.children
            .iter()
            .copied()
            .max_by(|&a, &b| {
                let na = &self.arena[a];
                let nb = &self.arena[b];
                let oa = na.outcome_for(na.player).unwrap_or(0.0);
                let ob = nb.outcome_for(nb.player).unwrap_or(0.0);
                oa.partial_cmp(&ob)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(na.explore_count.cmp(&nb.explore_count))
                    .then(
                        na.total_reward
                            .partial_cmp(&nb.total_reward)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
            })
    }

    /// 按访问次数的 1/temperature 次幂采样根节点子项。
    /// temperature 非正时退化为 best_child。
    pub fn sample_child<R: Rng>(&self, temperature: f64, rng: &mut R) -> Option<usize> {
        if temperature <= 0.0 {
            return self.best_child();
        }
        let root = self.root_node();
        let weights: Vec<f64> = root
            .children
            .iter()
            .map(|&c| (self.arena[c].explore_count as f64).powf(1.0 / temperature))
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            // 无访问信息时退化为均匀采样
            if root.children.is_empty() {
                return None;
            }
            return Some(root.children[rng.gen_range(0..root.children.len())]);
        }
        let mut pick = rng.gen_range(0.0..1.0) * total;
        for (i, w) in weights.iter().enumerate() {
            pick -= w;
            if pick <= 0.0 {
                return Some(root.children[i]);
            }
        }
        root.children.last().copied()
    }
}
