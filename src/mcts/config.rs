// src/mcts/config.rs
// 搜索配置

/// 子节点选择策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSelectionPolicy {
    /// UCT: Q + c * sqrt(ln(N) / n)
    Uct,
    /// PUCT: Q + c * P * sqrt(N) / (1 + n)
    Puct,
}

/// MCTS 搜索超参数
#[derive(Debug, Clone)]
pub struct MctsConfig {
    /// 探索常数 c
    pub uct_c: f64,
    /// 模拟次数下限 (预算耗尽判断只在下限之后生效)
    pub min_simulations: usize,
    /// 模拟次数上限
    pub max_simulations: usize,
    /// 搜索树内存预算 (MB), 超出后提前收束
    pub max_memory_mb: usize,
    /// 是否启用 MCTS-Solver 终局回传
    pub solve: bool,
    /// 随机种子 (0 表示按时间熵播种)
    pub seed: u64,
    pub child_selection: ChildSelectionPolicy,
    /// 根节点 Dirichlet 噪声参数 (alpha <= 0 时关闭)
    pub dirichlet_alpha: f64,
    /// 根节点先验与噪声的混合权重
    pub dirichlet_epsilon: f64,
}

impl Default for MctsConfig {
    fn default() -> Self {
        Self {
            uct_c: 2.0,
            min_simulations: 0,
            max_simulations: 300,
            max_memory_mb: 10,
            solve: false,
            seed: 0,
            child_selection: ChildSelectionPolicy::Puct,
            dirichlet_alpha: 0.0,
            dirichlet_epsilon: 0.0,
        }
    }
}
