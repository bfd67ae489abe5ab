// ==============================================================================
// --- 模块声明 ---
// ==============================================================================

pub mod constants;
pub mod types;
pub mod board;
pub mod rules;
pub mod actions;
pub mod features;

// ==============================================================================
// --- 公共 API 重导出 ---
// ==============================================================================

// 从 constants.rs 导出所有常量
pub use constants::*;

// 从 types.rs 导出所有数据类型
pub use types::{CheckerMove, LegalLevel, Mover, Player, ScoringType};

// 从 board.rs 导出对局参数与环境结构体
pub use board::{BackgammonEnv, BackgammonGame};
