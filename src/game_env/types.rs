use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

// ==============================================================================
// --- 基础数据结构 ---
// ==============================================================================

/// 对弈双方。X (红方, 玩家 0) 沿 0->23 方向前进, O (白方, 玩家 1) 沿 23->0 方向前进。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Player {
    X = 0,
    O = 1,
}

impl Player {
    pub fn opponent(&self) -> Self {
        match self {
            Player::X => Player::O,
            Player::O => Player::X,
        }
    }

    pub fn idx(&self) -> usize {
        *self as usize
    }

    /// 玩家 0 视角的符号因子: X 为 +1, O 为 -1
    pub fn sign(&self) -> f64 {
        match self {
            Player::X => 1.0,
            Player::O => -1.0,
        }
    }
}

impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Player::X => write!(f, "X"),
            Player::O => write!(f, "O"),
        }
    }
}

/// 当前持子方: 普通玩家、机会节点 (掷骰) 或终局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mover {
    Player(Player),
    Chance,
    Terminal,
}

impl fmt::Display for Mover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mover::Player(p) => write!(f, "{}", p),
            Mover::Chance => write!(f, "*"),
            Mover::Terminal => write!(f, "T"),
        }
    }
}

/// 单个棋子移动。Pass 编码为 (pos, num, hit) = (-1, -1, false)。
///
/// 字段顺序即排序键 (pos 优先于 num), 与集合去重保持一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CheckerMove {
    /// 0-23 为棋盘点位, 另可为 BAR_POS
    pub pos: i32,
    /// 骰子点数 1-6
    pub num: i32,
    /// 是否击中对方单子 (仅在合法性搜索中被正确填充)
    pub hit: bool,
}

impl CheckerMove {
    pub fn new(pos: i32, num: i32, hit: bool) -> Self {
        Self { pos, num, hit }
    }
}

/// 一个回合内必须用掉的骰子数上限。
///
/// 规则: 若两颗骰子都能走则必须都走 (对子则四步全走); 只能走一颗时必须走那一颗;
/// 两颗各自可走但无法兼得时, 必须走点数大的那颗。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegalLevel {
    NoDice,
    LowDie,
    HighDie,
    TwoDice,
    ThreeDice,
    FourDice,
}

/// 计分规则: 是否对 gammon / backgammon 给予加倍计分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoringType {
    /// 仅按胜负记 1 分
    WinLoss,
    /// gammon 记 2 分
    EnableGammons,
    /// gammon 记 2 分, backgammon 记 3 分
    FullScoring,
}

impl ScoringType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "winloss_scoring" => Ok(ScoringType::WinLoss),
            "enable_gammons" => Ok(ScoringType::EnableGammons),
            "full_scoring" => Ok(ScoringType::FullScoring),
            _ => bail!("Unrecognized scoring_type: {}", s),
        }
    }
}
