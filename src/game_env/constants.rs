// ==============================================================================
// --- 常量定义 ---
// ==============================================================================

/// 玩家数 (双人零和)
pub const NUM_PLAYERS: usize = 2;
/// 棋盘点位数 (24)
pub const NUM_POINTS: usize = 24;
/// 骰子面数
pub const NUM_DICE_FACES: usize = 6;
/// 常规掷骰的非有序骰子对数量 (15 种非对子 + 6 种对子)
pub const NUM_CHANCE_OUTCOMES: usize = 21;
/// 开局掷骰结果数: 双方各 15 种非对子组合, 同时决定先手
pub const NUM_FIRST_ROLL_OUTCOMES: usize = 30;

/// 标准规则下每方棋子数
pub const NUM_CHECKERS_PER_PLAYER: i32 = 15;
/// Hyper 变体下每方棋子数
pub const NUM_CHECKERS_HYPER: i32 = 3;

/// Bar (中栏) 的位置哨兵值
pub const BAR_POS: i32 = 100;
/// 出局 (Score/Off) 的位置哨兵值
pub const SCORE_POS: i32 = 101;
/// Pass 哨兵值
pub const PASS_POS: i32 = -1;

/// 单个棋子移动在动作编码里 Bar 对应的位置数字
pub const ENCODED_BAR_MOVE: i64 = 24;

/// 一个回合内最多可走的单子步数 (对子时为 4)
pub const NUM_MOVES_PER_CHECKER_SEQUENCE: usize = 4;

/// 单子动作数: (点位 + Bar) * 6 种骰子点数
pub const NUM_SINGLE_CHECKER_ACTIONS: i64 = ((NUM_POINTS + 1) * NUM_DICE_FACES) as i64;

const fn ipow(base: i64, exp: u32) -> i64 {
    if exp == 0 { 1 } else { base * ipow(base, exp - 1) }
}

/// 走子序列编码为 base-(S+1) 的 N 位数, S = 单子动作数
pub const NUM_CHECKER_ACTIONS: i64 = ipow(
    NUM_SINGLE_CHECKER_ACTIONS + 1,
    NUM_MOVES_PER_CHECKER_SEQUENCE as u32,
);

// --- 哨兵动作 (编码在走子动作之后) ---
pub const END_TURN_ACTION: i64 = NUM_CHECKER_ACTIONS + 1;
pub const ROLL_ACTION: i64 = NUM_CHECKER_ACTIONS + 2;
pub const DOUBLE_ACTION: i64 = NUM_CHECKER_ACTIONS + 3;
pub const TAKE_ACTION: i64 = NUM_CHECKER_ACTIONS + 4;
pub const DROP_ACTION: i64 = NUM_CHECKER_ACTIONS + 5;
pub const NUM_DISTINCT_ACTIONS: i64 = NUM_CHECKER_ACTIONS + 5;

/// MLP 观测向量总宽度:
/// 每方 {Bar 的 one-hot+溢出 (7), 24 个点位各 one-hot+溢出 (7), 出局 one-hot (16)} = 191,
/// 加 2 个行动方标志, 6x5 的剩余骰子 one-hot, 以及 6 个比赛/倍率常量槽位
pub const STATE_ENCODING_SIZE: usize = 420;

/// ResNet 观测视图的平面数与平面宽度
pub const RESNET_PLANES: usize = 16;
pub const RESNET_PLANE_WIDTH: usize = NUM_POINTS + 2;

/// 编译期开关: 观测与动作编码是否以行动方为中心 (棋盘翻转到统一朝向)
pub const PLAYER_CENTRIC_OBS: bool = true;
/// 编译期开关: 使用 16 平面的 ResNet 观测视图 (否则使用 MLP 展平编码)
pub const USE_RESNET_OBS: bool = false;

/// 人为设定的对局长度上限, 保证对局有限 (用于直方图尺寸等)
pub const MAX_GAME_LENGTH: usize = 1000;

/// 21 种非有序骰子对的点数, 前 15 项为非对子, 后 6 项为对子。
/// 常规掷骰动作 a (1..=21) 对应 CHANCE_OUTCOME_VALUES[a-1]。
pub const CHANCE_OUTCOME_VALUES: [[i32; 2]; NUM_CHANCE_OUTCOMES] = [
    [1, 2], [1, 3], [1, 4], [1, 5], [1, 6], [2, 3], [2, 4],
    [2, 5], [2, 6], [3, 4], [3, 5], [3, 6], [4, 5], [4, 6],
    [5, 6], [1, 1], [2, 2], [3, 3], [4, 4], [5, 5], [6, 6],
];

// 人类可读字符串里 Bar / Off 的显示编号
pub const BAR_POS_HUMAN_READABLE: i32 = 25;
pub const OFF_POS_HUMAN_READABLE: i32 = -2;
