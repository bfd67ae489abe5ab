// board.rs - 西洋双陆棋环境主体
//
// 状态表示与动作执行。走子合法性与序列生成见 rules.rs,
// 动作编码/解码见 actions.rs, 观测编码见 features.rs。

use anyhow::{bail, Result};
use rand::Rng;

use super::constants::*;
use super::types::*;

// ==============================================================================
// --- 对局参数 (BackgammonGame) ---
// ==============================================================================

/// 对局级参数: 变体与计分规则。
/// 环境实例由 `new_initial_state` 创建。
#[derive(Debug, Clone)]
pub struct BackgammonGame {
    pub scoring_type: ScoringType,
    pub hyper: bool,
    /// 以小概率生成退化开局 (单堆 / 全部在 Bar), 用于输入覆盖条件化, 默认关闭
    pub randomized_openings: bool,
}

impl BackgammonGame {
    pub fn new(name: &str, scoring_type: ScoringType, randomized_openings: bool) -> Result<Self> {
        let hyper = match name {
            "backgammon" => false,
            "hyper_backgammon" => true,
            _ => bail!("Unknown game: {} (expected backgammon or hyper_backgammon)", name),
        };
        Ok(Self { scoring_type, hyper, randomized_openings })
    }

    pub fn new_initial_state<R: Rng>(&self, rng: &mut R) -> BackgammonEnv {
        BackgammonEnv::new(self, rng)
    }

    pub fn checkers_per_player(&self) -> i32 {
        if self.hyper { NUM_CHECKERS_HYPER } else { NUM_CHECKERS_PER_PLAYER }
    }

    /// 最大收益幅度, 由计分规则决定 (Hyper 变体固定 1)
    pub fn max_utility(&self) -> f64 {
        if self.hyper {
            return 1.0;
        }
        match self.scoring_type {
            ScoringType::WinLoss => 1.0,
            ScoringType::EnableGammons => 2.0,
            ScoringType::FullScoring => 3.0,
        }
    }

    /// 观测张量形状 [C, H, W]
    pub fn observation_shape(&self) -> [i64; 3] {
        if USE_RESNET_OBS {
            [RESNET_PLANES as i64, 1, RESNET_PLANE_WIDTH as i64]
        } else {
            [1, 1, STATE_ENCODING_SIZE as i64]
        }
    }

    pub fn max_game_length(&self) -> usize {
        MAX_GAME_LENGTH
    }
}

// ==============================================================================
// --- 环境结构体 (BackgammonEnv) ---
// ==============================================================================

/// 完整对局状态。
///
/// 回合结构: 行动方显式选择 Roll -> 机会节点掷骰 -> 原行动方走子 -> EndTurn。
/// 掷骰后行动权保留在选择 Roll 的玩家手中。
#[derive(Debug, Clone)]
pub struct BackgammonEnv {
    scoring_type: ScoringType,
    hyper: bool,
    checkers_per_player: i32,

    pub(super) cur_player: Mover,
    pub(super) prev_player: Mover,
    /// -1 表示尚未进行决定先手的开局掷骰
    pub(super) turns: i32,
    /// 已掷出的两颗骰子 (空表示待掷)
    pub(super) dice: Vec<i32>,
    /// 本回合每种点数还需走的次数, 已按照 LegalLevel 调整
    pub(super) remaining_dice: [i32; NUM_DICE_FACES],
    pub(super) bar: [i32; NUM_PLAYERS],
    pub(super) scores: [i32; NUM_PLAYERS],
    pub(super) board: [[i32; NUM_POINTS]; NUM_PLAYERS],
}

impl BackgammonEnv {
    fn new<R: Rng>(game: &BackgammonGame, rng: &mut R) -> Self {
        let mut env = Self {
            scoring_type: game.scoring_type,
            hyper: game.hyper,
            checkers_per_player: game.checkers_per_player(),
            cur_player: Mover::Chance,
            prev_player: Mover::Chance,
            turns: -1,
            dice: Vec::new(),
            remaining_dice: [0; NUM_DICE_FACES],
            bar: [0; NUM_PLAYERS],
            scores: [0; NUM_PLAYERS],
            board: [[0; NUM_POINTS]; NUM_PLAYERS],
        };
        env.setup_initial_board(game.randomized_openings, rng);
        env
    }

    fn setup_initial_board<R: Rng>(&mut self, randomized: bool, rng: &mut R) {
        let x = Player::X.idx();
        let o = Player::O.idx();
        if self.hyper {
            // 每方三子, 放在距离终点最远的三个点位
            self.board[x][0] = 1;
            self.board[x][1] = 1;
            self.board[x][2] = 1;
            self.board[o][23] = 1;
            self.board[o][22] = 1;
            self.board[o][21] = 1;
            return;
        }

        if randomized {
            // 输入条件化: 以小概率生成极端布局, 保证编码的溢出槽位被训练到
            let idx = (500.0 * rng.gen_range(0.0..1.0f64)) as usize;
            if idx < 24 {
                self.board[x][idx] = NUM_CHECKERS_PER_PLAYER;
                self.board[o][23 - idx] = NUM_CHECKERS_PER_PLAYER;
                return;
            } else if idx < 25 {
                self.bar[x] = NUM_CHECKERS_PER_PLAYER;
                self.bar[o] = NUM_CHECKERS_PER_PLAYER;
                return;
            }
        }

        // 标准开局
        self.board[x][0] = 2;
        self.board[x][11] = 5;
        self.board[x][16] = 3;
        self.board[x][18] = 5;
        self.board[o][23] = 2;
        self.board[o][12] = 5;
        self.board[o][7] = 3;
        self.board[o][5] = 5;
    }

    // --- 基本访问 ---

    pub fn current_player(&self) -> Mover {
        if self.is_terminal() { Mover::Terminal } else { self.cur_player }
    }

    /// 持子方 (不含终局折叠)。在机会节点调用属于调用方错误。
    pub fn acting_player(&self) -> Player {
        match self.cur_player {
            Mover::Player(p) => p,
            other => panic!("acting_player() on non-decision node: {}", other),
        }
    }

    /// 观测视角玩家: 决策节点为行动方, 机会节点为刚选择掷骰的一方
    pub fn perspective_player(&self) -> Player {
        match self.cur_player {
            Mover::Player(p) => p,
            _ => match self.prev_player {
                Mover::Player(p) => p,
                _ => Player::X,
            },
        }
    }

    pub fn is_chance_node(&self) -> bool {
        !self.is_terminal() && self.cur_player == Mover::Chance
    }

    pub fn is_terminal(&self) -> bool {
        self.scores[0] == self.checkers_per_player || self.scores[1] == self.checkers_per_player
    }

    pub fn turns(&self) -> i32 {
        self.turns
    }

    pub fn dice(&self, i: usize) -> i32 {
        self.dice[i]
    }

    pub fn dice_rolled(&self) -> bool {
        !self.dice.is_empty()
    }

    pub fn remaining_dice(&self, face: usize) -> i32 {
        self.remaining_dice[face]
    }

    pub fn bar(&self, player: Player) -> i32 {
        self.bar[player.idx()]
    }

    pub fn score(&self, player: Player) -> i32 {
        self.scores[player.idx()]
    }

    pub fn checkers_per_player(&self) -> i32 {
        self.checkers_per_player
    }

    pub fn max_utility(&self) -> f64 {
        if self.hyper {
            return 1.0;
        }
        match self.scoring_type {
            ScoringType::WinLoss => 1.0,
            ScoringType::EnableGammons => 2.0,
            ScoringType::FullScoring => 3.0,
        }
    }

    /// 指定玩家在某位置的棋子数, 位置可为 BAR_POS
    pub fn board(&self, player: Player, pos: i32) -> i32 {
        if pos == BAR_POS {
            self.bar[player.idx()]
        } else {
            debug_assert!((0..NUM_POINTS as i32).contains(&pos));
            self.board[player.idx()][pos as usize]
        }
    }

    /// 棋子守恒检查: 棋盘 + Bar + 出局应等于每方棋子总数
    pub fn count_total_checkers(&self, player: Player) -> i32 {
        let p = player.idx();
        self.board[p].iter().sum::<i32>() + self.bar[p] + self.scores[p]
    }

    // --- 机会节点 ---

    /// 当前机会节点的 (动作, 概率) 列表。
    /// 开局掷骰使用 30 种等概率结果 (前半 X 先手, 后半 O 先手, 无对子)。
    pub fn chance_outcomes(&self) -> Vec<(i64, f64)> {
        debug_assert!(self.is_chance_node());
        if self.turns == -1 {
            (1..=NUM_FIRST_ROLL_OUTCOMES as i64)
                .map(|a| (a, 1.0 / NUM_FIRST_ROLL_OUTCOMES as f64))
                .collect()
        } else {
            (1..=NUM_CHANCE_OUTCOMES as i64)
                .map(|a| {
                    let p = if a <= 15 { 1.0 / 18.0 } else { 1.0 / 36.0 };
                    (a, p)
                })
                .collect()
        }
    }

    fn roll_dice(&mut self, outcome: i64) {
        let values = CHANCE_OUTCOME_VALUES[(outcome - 1) as usize];
        self.dice.push(values[0]);
        self.dice.push(values[1]);
        self.init_remaining_dice();
    }

    // --- 动作执行 ---

    pub fn apply_action(&mut self, action: i64) {
        debug_assert!(action > 0 && action <= NUM_DISTINCT_ACTIONS || self.is_chance_node());
        if self.is_chance_node() {
            debug_assert!(self.dice.is_empty());
            let mut outcome = action;
            if self.turns == -1 {
                // 开局掷骰同时决定先手
                if outcome <= 15 {
                    self.cur_player = Mover::Player(Player::X);
                    self.prev_player = Mover::Player(Player::X);
                } else {
                    self.cur_player = Mover::Player(Player::O);
                    self.prev_player = Mover::Player(Player::O);
                    outcome -= 15;
                }
                self.roll_dice(outcome);
                self.turns = 0;
            } else {
                // 选择掷骰的玩家保持行动权
                self.cur_player = self.prev_player;
                self.roll_dice(outcome);
            }
            return;
        }

        if self.dice.is_empty() {
            // 行动方刚刚选择掷骰
            debug_assert_eq!(action, ROLL_ACTION);
            self.prev_player = self.cur_player;
            self.cur_player = Mover::Chance;
            return;
        }

        if action == END_TURN_ACTION {
            self.turns += 1;
            let p = self.acting_player();
            self.cur_player = Mover::Player(p.opponent());
            self.dice.clear();
            return;
        }

        let moves = self.action_to_checker_moves(action);
        for m in &moves {
            self.apply_checker_move(m);
        }
        self.prev_player = self.cur_player;
    }

    /// 终局收益 (每个玩家一项)。非终局返回全零。
    pub fn returns(&self) -> Vec<f64> {
        let (winner, loser) = if self.scores[0] == self.checkers_per_player {
            (Player::X, Player::O)
        } else if self.scores[1] == self.checkers_per_player {
            (Player::O, Player::X)
        } else {
            return vec![0.0; NUM_PLAYERS];
        };

        let util_mag = match self.scoring_type {
            ScoringType::WinLoss => 1,
            ScoringType::EnableGammons => {
                if self.is_gammoned(loser) { 2 } else { 1 }
            }
            ScoringType::FullScoring => {
                if self.is_backgammoned(loser) {
                    3
                } else if self.is_gammoned(loser) {
                    2
                } else {
                    1
                }
            }
        };

        let mut returns = vec![0.0; NUM_PLAYERS];
        returns[winner.idx()] = util_mag as f64;
        returns[loser.idx()] = -(util_mag as f64);
        returns
    }

    fn is_gammoned(&self, player: Player) -> bool {
        if self.hyper {
            // Hyper 变体在未实现倍率立方时不计 gammon
            return false;
        }
        self.scores[player.idx()] == 0
    }

    fn is_backgammoned(&self, player: Player) -> bool {
        if self.hyper {
            return false;
        }
        if self.scores[player.idx()] > 0 {
            return false;
        }
        if self.bar[player.idx()] > 0 {
            return true;
        }
        // 败方仍有棋子停留在起始区 (对方的本垒区)
        let (scan_start, scan_end) = if player == Player::X { (0, 5) } else { (18, 23) };
        (scan_start..=scan_end).any(|i| self.board[player.idx()][i] > 0)
    }

    // --- 调试 / 测试辅助 ---

    /// 直接设置局面。不维护历史信息, 仅用于测试与局面分析。
    pub fn set_state(
        &mut self,
        cur_player: Player,
        dice: Vec<i32>,
        bar: [i32; NUM_PLAYERS],
        scores: [i32; NUM_PLAYERS],
        board: [[i32; NUM_POINTS]; NUM_PLAYERS],
    ) {
        self.cur_player = Mover::Player(cur_player);
        self.prev_player = Mover::Player(cur_player.opponent());
        self.turns = self.turns.max(0);
        self.dice = dice;
        self.bar = bar;
        self.scores = scores;
        self.board = board;
        if !self.dice.is_empty() {
            self.init_remaining_dice();
        }
        debug_assert_eq!(self.count_total_checkers(Player::X), self.checkers_per_player);
        debug_assert_eq!(self.count_total_checkers(Player::O), self.checkers_per_player);
    }

    /// 26 字符局面签名: 24 个点位 + 双方 Bar。用于走子序列去重。
    pub fn position_id(&self) -> String {
        let mut id = String::with_capacity(NUM_POINTS + 2);
        for i in 0..NUM_POINTS {
            let c = if self.board[0][i] > 0 {
                (b'A' + self.board[0][i] as u8 - 1) as char
            } else if self.board[1][i] > 0 {
                (b'a' + self.board[1][i] as u8 - 1) as char
            } else {
                '-'
            };
            id.push(c);
        }
        id.push((b'A' + self.bar[0] as u8) as char);
        id.push((b'a' + self.bar[1] as u8) as char);
        id
    }

    /// 简易棋盘渲染, 用于日志与人工检查
    pub fn board_string(&self) -> String {
        let mut s = String::new();
        s.push_str("  24 23 22 21 20 19 | 18 17 16 15 14 13\n");
        for half in 0..2 {
            s.push(' ');
            for j in 0..12 {
                let pt = if half == 0 { 23 - j } else { j };
                let (n_x, n_o) = (self.board[0][pt], self.board[1][pt]);
                if n_x > 0 {
                    s.push_str(&format!("{:>2}X", n_x));
                } else if n_o > 0 {
                    s.push_str(&format!("{:>2}O", n_o));
                } else {
                    s.push_str("  .");
                }
                if pt == 18 || pt == 5 {
                    s.push_str(" |");
                }
            }
            s.push('\n');
            if half == 0 {
                s.push_str(&format!(
                    " Bar X:{} O:{}  Off X:{} O:{}\n",
                    self.bar[0], self.bar[1], self.scores[0], self.scores[1]
                ));
            }
        }
        s.push_str("   1  2  3  4  5  6 |  7  8  9 10 11 12\n");
        let mut dice_str = String::new();
        for face in 0..NUM_DICE_FACES {
            for _ in 0..self.remaining_dice[face] {
                dice_str.push_str(&format!(" {}", face + 1));
            }
        }
        s.push_str(&format!(
            " Turn: {}  Dice:{}\n PositionID: {}\n",
            self.current_player(),
            dice_str,
            self.position_id()
        ));
        s
    }
}
