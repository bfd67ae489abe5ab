//! # Backgammon AlphaZero - 价值网络自对弈训练器
//!
//! 面向含机会节点的双人零和顺序博弈的 AlphaZero 式训练管线,
//! 以西洋双陆棋为对象: 并发的自对弈 actor、评测线程与学习线程
//! 围绕一个带批量推理与 LRU 缓存的共享价值网络协同工作,
//! 训练目标为幸运度修正后的 TD(λ) 回报。
//!
//! ## 模块
//! - `game_env`: 规则引擎 (状态、合法走子、机会分布、观测编码)
//! - `mcts`: PUCT/UCT 搜索, 机会节点处理与终局解算
//! - `nn_model` / `device`: 价值网络与多设备副本池
//! - `inference` / `cache`: 批量推理服务与观测缓存
//! - `self_play` / `evaluation` / `learner`: 三类工作线程
//! - `supervisor`: 装配、断点续训与关停

pub mod game_env;
pub mod mcts;

pub mod cache;
pub mod config;
pub mod device;
pub mod evaluation;
pub mod inference;
pub mod learner;
pub mod nn_model;
pub mod queue;
pub mod replay;
pub mod self_play;
pub mod stats;
pub mod supervisor;
pub mod training_log;

// 重新导出核心类型, 方便外部使用
pub use config::AlphaZeroConfig;
pub use game_env::{BackgammonEnv, BackgammonGame, Player};
pub use queue::StopToken;
pub use self_play::{Trajectory, TrajState};
