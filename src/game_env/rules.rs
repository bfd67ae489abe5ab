// rules.rs - 走子合法性与序列生成
//
// 核心规则: 一个回合必须用掉尽可能多的骰子 (对子为四步);
// 只能用一颗时必须用那一颗; 两颗各自可用但不能兼得时必须用大的。
// DetermineLegalLevel 通过有界 DFS 计算可用骰子数上限,
// InitRemainingDice 再把该上限翻译成每种点数的剩余次数。

use std::collections::{BTreeMap, BTreeSet};

use super::constants::*;
use super::types::*;
use super::board::BackgammonEnv;

/// 一条走子序列与其到达的局面 (用于逐层扩展与按局面签名去重)
#[derive(Clone)]
struct CheckerMoveSequence {
    moves: Vec<CheckerMove>,
    state: BackgammonEnv,
}

impl BackgammonEnv {
    // --- 位置计算 ---

    pub(super) fn position_from_bar(&self, player: Player, spaces: i32) -> i32 {
        match player {
            Player::X => -1 + spaces,
            Player::O => NUM_POINTS as i32 - spaces,
        }
    }

    /// 从 pos 走 spaces 步后的位置; 越过边界返回 SCORE_POS
    pub(super) fn position_from(&self, player: Player, pos: i32, spaces: i32) -> i32 {
        if pos == BAR_POS {
            return self.position_from_bar(player, spaces);
        }
        match player {
            Player::X => {
                let new_pos = pos + spaces;
                if new_pos > 23 { SCORE_POS } else { new_pos }
            }
            Player::O => {
                let new_pos = pos - spaces;
                if new_pos < 0 { SCORE_POS } else { new_pos }
            }
        }
    }

    /// 位置加法, 不做边界折叠 (结果可能 <0 或 >23)
    pub fn get_to_pos(&self, player: Player, from_pos: i32, pips: i32) -> i32 {
        match player {
            Player::X => (if from_pos == BAR_POS { -1 } else { from_pos }) + pips,
            Player::O => (if from_pos == BAR_POS { NUM_POINTS as i32 } else { from_pos }) - pips,
        }
    }

    pub fn is_off(&self, player: Player, pos: i32) -> bool {
        match player {
            Player::X => pos > 23,
            Player::O => pos < 0,
        }
    }

    fn num_opp_checkers(&self, player: Player, pos: i32) -> i32 {
        self.board[player.opponent().idx()][pos as usize]
    }

    /// 从某位置按某点数行走是否构成击打
    pub fn is_hit(&self, player: Player, from_pos: i32, num: i32) -> bool {
        if from_pos == PASS_POS {
            return false;
        }
        let to = self.position_from(player, from_pos, num);
        to != SCORE_POS && self.board(player.opponent(), to) == 1
    }

    pub(super) fn all_in_home(&self, player: Player) -> bool {
        if self.bar[player.idx()] > 0 {
            return false;
        }
        // 本垒区之外扫描: X 查 0-17, O 查 6-23
        let (scan_start, scan_end) = if player == Player::X { (0, 17) } else { (6, 23) };
        !(scan_start..=scan_end).any(|i| self.board[player.idx()][i] > 0)
    }

    /// 本垒区内距离终点最远的棋子位置, 没有则返回 -1
    pub(super) fn furthest_checker_in_home(&self, player: Player) -> i32 {
        match player {
            Player::X => {
                for i in 18..24 {
                    if self.board[player.idx()][i] > 0 {
                        return i as i32;
                    }
                }
            }
            Player::O => {
                for i in (0..6).rev() {
                    if self.board[player.idx()][i] > 0 {
                        return i as i32;
                    }
                }
            }
        }
        -1
    }

    // --- 单子走法执行 / 回退 ---

    /// 执行一步单子移动并返回是否击打。Pass 不做任何事。
    pub(super) fn apply_checker_move(&mut self, m: &CheckerMove) -> bool {
        if m.pos < 0 {
            return false;
        }
        let player = self.acting_player();
        let p = player.idx();

        let next_pos;
        if m.pos == BAR_POS {
            self.bar[p] -= 1;
            next_pos = self.position_from_bar(player, m.num);
        } else {
            self.board[p][m.pos as usize] -= 1;
            next_pos = self.position_from(player, m.pos, m.num);
        }

        self.remaining_dice[(m.num - 1) as usize] -= 1;

        if next_pos == SCORE_POS {
            self.scores[p] += 1;
        } else {
            self.board[p][next_pos as usize] += 1;
        }

        // hit 标记只在合法性搜索中可靠, 这里再做一次实际检查
        let opp = player.opponent().idx();
        let hit = m.hit
            || (next_pos != SCORE_POS && self.board[opp][next_pos as usize] == 1);
        if hit {
            self.board[opp][next_pos as usize] -= 1;
            self.bar[opp] += 1;
        }
        hit
    }

    /// 回退一步单子移动。m.hit 必须与执行时一致, 否则无法正确还原。
    pub(super) fn undo_checker_move(&mut self, m: &CheckerMove) {
        if m.pos < 0 {
            return;
        }
        let player = self.acting_player();
        let p = player.idx();
        let opp = player.opponent().idx();

        let next_pos = if m.pos == BAR_POS {
            self.position_from_bar(player, m.num)
        } else {
            self.position_from(player, m.pos, m.num)
        };

        if m.hit {
            self.bar[opp] -= 1;
            self.board[opp][next_pos as usize] += 1;
        }

        if next_pos == SCORE_POS {
            self.scores[p] -= 1;
        } else {
            self.board[p][next_pos as usize] -= 1;
        }
        self.remaining_dice[(m.num - 1) as usize] += 1;

        if m.pos == BAR_POS {
            self.bar[p] += 1;
        } else {
            self.board[p][m.pos as usize] += 1;
        }
    }

    // --- 单骰子走法枚举 ---

    /// 某一颗骰子的所有单子走法。first_only 时找到一个即返回 (用于可行性探测)。
    pub(super) fn single_checker_moves(&self, die: i32, first_only: bool) -> BTreeSet<CheckerMove> {
        let player = self.acting_player();
        let p = player.idx();
        let mut moves = BTreeSet::new();

        if self.bar[p] > 0 {
            // Bar 上有子时必须先进子
            let pos = self.position_from_bar(player, die);
            if self.num_opp_checkers(player, pos) <= 1 {
                let hit = self.num_opp_checkers(player, pos) == 1;
                moves.insert(CheckerMove::new(BAR_POS, die, hit));
            }
            return moves;
        }

        let all_in_home = self.all_in_home(player);
        for i in 0..NUM_POINTS as i32 {
            if self.board[p][i as usize] == 0 {
                continue;
            }
            let pos = self.position_from(player, i, die);
            if pos == SCORE_POS && all_in_home {
                // 出局: 点数恰好匹配, 或该子已是本垒区内最远
                let exact = (player == Player::X && i + die == 24)
                    || (player == Player::O && i - die == -1);
                if exact || i == self.furthest_checker_in_home(player) {
                    moves.insert(CheckerMove::new(i, die, false));
                    if first_only {
                        return moves;
                    }
                }
            } else if pos != SCORE_POS && self.num_opp_checkers(player, pos) <= 1 {
                let hit = self.num_opp_checkers(player, pos) == 1;
                moves.insert(CheckerMove::new(i, die, hit));
                if first_only {
                    return moves;
                }
            }
        }
        moves
    }

    /// 当前回合真正合法的单子走法。
    ///
    /// remaining_dice 已按 LegalLevel 构造, 因此通常直接枚举即可;
    /// 唯一的例外是两颗不同骰子都尚未使用时, 需要验证走完当前骰子后
    /// 另一颗仍然可走 (否则会违反"两颗都要走"的义务)。
    pub(super) fn legal_single_checker_moves(&self) -> BTreeSet<CheckerMove> {
        let needs_verification = self.dice[0] != self.dice[1]
            && self.remaining_dice[(self.dice[0] - 1) as usize] > 0
            && self.remaining_dice[(self.dice[1] - 1) as usize] > 0;

        if !needs_verification {
            for i in 0..self.dice.len() {
                let die = self.dice[i];
                if self.remaining_dice[(die - 1) as usize] > 0 {
                    return self.single_checker_moves(die, false);
                }
            }
            return BTreeSet::new();
        }

        let mut moves = BTreeSet::new();
        let mut scratch = self.clone();
        for i in 0..self.dice.len() {
            let die = self.dice[i];
            if self.remaining_dice[(die - 1) as usize] == 0 {
                continue;
            }
            let other_die = if die == self.dice[0] { self.dice[1] } else { self.dice[0] };
            for m in self.single_checker_moves(die, false) {
                scratch.apply_checker_move(&m);
                if !scratch.single_checker_moves(other_die, true).is_empty() {
                    moves.insert(m);
                }
                scratch.undo_checker_move(&m);
            }
        }
        moves
    }

    /// 逐层扩展所有合法走子序列, 按到达局面签名去重
    fn legal_checker_move_sequences(&self) -> Vec<Vec<CheckerMove>> {
        let mut seqs: BTreeMap<String, CheckerMoveSequence> = BTreeMap::new();
        for m in self.legal_single_checker_moves() {
            let mut state = self.clone();
            state.apply_checker_move(&m);
            seqs.entry(state.position_id()).or_insert(CheckerMoveSequence {
                moves: vec![m],
                state,
            });
        }
        if seqs.is_empty() {
            return Vec::new();
        }
        for _ in 1..NUM_MOVES_PER_CHECKER_SEQUENCE {
            let mut new_seqs: BTreeMap<String, CheckerMoveSequence> = BTreeMap::new();
            for seq in seqs.values() {
                for m in seq.state.legal_single_checker_moves() {
                    let mut state = seq.state.clone();
                    state.apply_checker_move(&m);
                    let mut moves = seq.moves.clone();
                    moves.push(m);
                    new_seqs
                        .entry(state.position_id())
                        .or_insert(CheckerMoveSequence { moves, state });
                }
            }
            if new_seqs.is_empty() {
                break;
            }
            seqs = new_seqs;
        }
        seqs.into_values().map(|s| s.moves).collect()
    }

    // --- LegalLevel ---

    /// 本回合必须使用的骰子数级别。只应在已掷骰时调用。
    pub fn determine_legal_level(&self) -> LegalLevel {
        assert!(!self.dice.is_empty(), "determine_legal_level called with empty dice");
        let hi_die = self.dice[0].max(self.dice[1]);
        let lo_die = self.dice[0].min(self.dice[1]);
        let mut scratch = self.clone();

        let mut num_dice_used;
        let mut hi_die_used = false;
        if hi_die == lo_die {
            num_dice_used =
                Self::num_max_playable_dice(&mut scratch, &[hi_die, hi_die, hi_die, hi_die]);
            hi_die_used = true;
        } else {
            // 骰子从尾部弹出, 先试大骰子
            num_dice_used = Self::num_max_playable_dice(&mut scratch, &[lo_die, hi_die]);
            if num_dice_used > 0 {
                hi_die_used = true;
            }
            if num_dice_used < 2 {
                num_dice_used =
                    num_dice_used.max(Self::num_max_playable_dice(&mut scratch, &[hi_die, lo_die]));
            }
        }

        match num_dice_used {
            1 => {
                if hi_die_used { LegalLevel::HighDie } else { LegalLevel::LowDie }
            }
            2 => LegalLevel::TwoDice,
            3 => LegalLevel::ThreeDice,
            4 => LegalLevel::FourDice,
            _ => LegalLevel::NoDice,
        }
    }

    /// DFS: 以 dice_to_play 的顺序 (从尾部取) 最多能走掉几颗骰子。
    /// 一旦发现剩余骰子可以全部走完就提前返回。
    fn num_max_playable_dice(state: &mut BackgammonEnv, dice_to_play: &[i32]) -> i32 {
        let Some((&die, rest)) = dice_to_play.split_last() else {
            return 0;
        };
        let moves = state.single_checker_moves(die, false);
        let mut child_max = -1;
        for m in moves {
            state.apply_checker_move(&m);
            let child_val = Self::num_max_playable_dice(state, rest);
            state.undo_checker_move(&m);
            if child_val == rest.len() as i32 {
                return 1 + child_val;
            }
            child_max = child_max.max(child_val);
        }
        1 + child_max
    }

    /// 掷骰后根据 LegalLevel 初始化每种点数的剩余使用次数
    pub(super) fn init_remaining_dice(&mut self) {
        if self.dice.is_empty() {
            return;
        }
        let hi_die = self.dice[0].max(self.dice[1]);
        let lo_die = self.dice[0].min(self.dice[1]);
        self.remaining_dice = [0; NUM_DICE_FACES];
        match self.determine_legal_level() {
            LegalLevel::LowDie => {
                self.remaining_dice[(lo_die - 1) as usize] += 1;
            }
            LegalLevel::HighDie => {
                self.remaining_dice[(hi_die - 1) as usize] += 1;
            }
            LegalLevel::TwoDice => {
                self.remaining_dice[(lo_die - 1) as usize] += 1;
                self.remaining_dice[(hi_die - 1) as usize] += 1;
            }
            LegalLevel::ThreeDice => {
                self.remaining_dice[(hi_die - 1) as usize] = 3;
            }
            LegalLevel::FourDice => {
                self.remaining_dice[(hi_die - 1) as usize] = 4;
            }
            LegalLevel::NoDice => {}
        }
    }

    // --- 合法动作 ---

    pub fn legal_actions(&self) -> Vec<i64> {
        if self.is_terminal() {
            return Vec::new();
        }
        if self.is_chance_node() {
            return self.chance_outcomes().into_iter().map(|(a, _)| a).collect();
        }
        if self.dice.is_empty() {
            return vec![ROLL_ACTION];
        }

        debug_assert_eq!(self.count_total_checkers(Player::X), self.checkers_per_player());
        debug_assert_eq!(self.count_total_checkers(Player::O), self.checkers_per_player());

        let seqs = self.legal_checker_move_sequences();
        if seqs.is_empty() {
            return vec![END_TURN_ACTION];
        }
        let mut actions: Vec<i64> = seqs
            .iter()
            .map(|moves| self.checker_moves_to_action(moves))
            .filter(|&a| a > 0)
            .collect();
        actions.sort_unstable();
        actions.dedup();
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game_env::BackgammonGame;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn standard_game() -> BackgammonGame {
        BackgammonGame::new("backgammon", ScoringType::WinLoss, false).unwrap()
    }

    fn standard_board() -> [[i32; NUM_POINTS]; NUM_PLAYERS] {
        let mut board = [[0; NUM_POINTS]; NUM_PLAYERS];
        board[0][0] = 2;
        board[0][11] = 5;
        board[0][16] = 3;
        board[0][18] = 5;
        board[1][23] = 2;
        board[1][12] = 5;
        board[1][7] = 3;
        board[1][5] = 5;
        board
    }

    #[test]
    fn test_initial_roll_3_1_uses_both_dice() {
        let game = standard_game();
        let mut rng = StdRng::seed_from_u64(7);
        let mut env = game.new_initial_state(&mut rng);
        env.set_state(Player::X, vec![3, 1], [0, 0], [0, 0], standard_board());

        assert_eq!(env.determine_legal_level(), LegalLevel::TwoDice);

        let actions = env.legal_actions();
        assert!(!actions.is_empty());
        for action in actions {
            let moves = env.action_to_checker_moves(action);
            assert_eq!(moves.len(), 2);
            let mut nums: Vec<i32> = moves.iter().map(|m| m.num).collect();
            nums.sort_unstable();
            assert_eq!(nums, vec![1, 3]);
        }
    }

    #[test]
    fn test_high_die_only_when_low_die_blocked() {
        let game = standard_game();
        let mut rng = StdRng::seed_from_u64(7);
        let mut env = game.new_initial_state(&mut rng);

        // X 只有一个在场棋子 (0 号点), 其余已出局; O 封锁 2 号与 8 号点。
        // 骰子 {6,2}: 2 不可走, 6 可走一步, 之后 2 仍被封 -> 只能用大骰子。
        let mut board = [[0; NUM_POINTS]; NUM_PLAYERS];
        board[0][0] = 1;
        board[1][2] = 2;
        board[1][8] = 2;
        board[1][23] = 11;
        env.set_state(Player::X, vec![6, 2], [0, 0], [14, 0], board);

        assert_eq!(env.determine_legal_level(), LegalLevel::HighDie);
        let actions = env.legal_actions();
        assert!(!actions.is_empty());
        for action in actions {
            let moves = env.action_to_checker_moves(action);
            assert_eq!(moves.len(), 1);
            assert_eq!(moves[0].num, 6);
        }
    }

    #[test]
    fn test_doubles_allow_four_moves() {
        let game = standard_game();
        let mut rng = StdRng::seed_from_u64(7);
        let mut env = game.new_initial_state(&mut rng);
        env.set_state(Player::X, vec![2, 2], [0, 0], [0, 0], standard_board());

        assert_eq!(env.determine_legal_level(), LegalLevel::FourDice);
        for action in env.legal_actions() {
            let moves = env.action_to_checker_moves(action);
            assert_eq!(moves.len(), 4);
            assert!(moves.iter().all(|m| m.num == 2));
        }
    }

    #[test]
    fn test_bar_entry_is_forced() {
        let game = standard_game();
        let mut rng = StdRng::seed_from_u64(7);
        let mut env = game.new_initial_state(&mut rng);
        let mut board = standard_board();
        board[0][0] = 1; // 一个子挪到 Bar 上
        env.set_state(Player::X, vec![3, 1], [1, 0], [0, 0], board);

        for action in env.legal_actions() {
            let moves = env.action_to_checker_moves(action);
            assert_eq!(moves[0].pos, BAR_POS);
        }
    }

    #[test]
    fn test_bear_off_requires_all_in_home() {
        let game = standard_game();
        let mut rng = StdRng::seed_from_u64(7);
        let mut env = game.new_initial_state(&mut rng);

        // X 全部在本垒区, 6 点精确出局
        let mut board = [[0; NUM_POINTS]; NUM_PLAYERS];
        board[0][18] = 5;
        board[0][20] = 5;
        board[0][22] = 5;
        board[1][5] = 15;
        env.set_state(Player::X, vec![6, 5], [0, 0], [0, 0], board);

        let mut saw_bear_off = false;
        for action in env.legal_actions() {
            for m in env.action_to_checker_moves(action) {
                if env.position_from(Player::X, m.pos, m.num) == SCORE_POS {
                    saw_bear_off = true;
                }
            }
        }
        assert!(saw_bear_off);
    }

    #[test]
    fn test_checker_conservation_over_random_playout() {
        let game = standard_game();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..5 {
            let mut env = game.new_initial_state(&mut rng);
            let mut steps = 0;
            while !env.is_terminal() && steps < 2000 {
                let action = if env.is_chance_node() {
                    let outcomes = env.chance_outcomes();
                    let r: f64 = rng.gen_range(0.0..1.0);
                    let mut acc = 0.0;
                    let mut chosen = outcomes[0].0;
                    for (a, p) in &outcomes {
                        acc += p;
                        if r < acc {
                            chosen = *a;
                            break;
                        }
                    }
                    chosen
                } else {
                    let actions = env.legal_actions();
                    actions[rng.gen_range(0..actions.len())]
                };
                env.apply_action(action);
                assert_eq!(env.count_total_checkers(Player::X), NUM_CHECKERS_PER_PLAYER);
                assert_eq!(env.count_total_checkers(Player::O), NUM_CHECKERS_PER_PLAYER);
                steps += 1;
            }
        }
    }

    #[test]
    fn test_no_moves_yields_end_turn() {
        let game = standard_game();
        let mut rng = StdRng::seed_from_u64(7);
        let mut env = game.new_initial_state(&mut rng);

        // X 被完全封死: 仅剩 Bar 上一子, O 占住所有入点
        let mut board = [[0; NUM_POINTS]; NUM_PLAYERS];
        for i in 0..6 {
            board[1][i] = 2;
        }
        board[1][23] = 3;
        board[0][18] = 14;
        env.set_state(Player::X, vec![6, 2], [1, 0], [0, 0], board);

        assert_eq!(env.determine_legal_level(), LegalLevel::NoDice);
        assert_eq!(env.legal_actions(), vec![END_TURN_ACTION]);
    }

    #[test]
    fn test_terminal_returns_winloss() {
        let game = standard_game();
        let mut rng = StdRng::seed_from_u64(7);
        let mut env = game.new_initial_state(&mut rng);
        let mut board = [[0; NUM_POINTS]; NUM_PLAYERS];
        board[1][5] = 10;
        env.set_state(Player::O, vec![6, 5], [0, 0], [15, 5], board);

        assert!(env.is_terminal());
        assert_eq!(env.returns(), vec![1.0, -1.0]);
    }
}
