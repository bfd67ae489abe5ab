// actions.rs - 动作编码与解码
//
// 走子序列编码为 base-(S+1) 的多位数 (S = 单子动作数 150)。
// 行动方中心模式下, O 方的点位编码会被镜像 (p -> 23-p),
// 使得网络看到的动作空间与观测朝向一致。

use super::constants::*;
use super::types::*;
use super::board::BackgammonEnv;

fn position_to_string_human_readable(pos: i32) -> String {
    if pos == BAR_POS_HUMAN_READABLE {
        "Bar".to_string()
    } else if pos == OFF_POS_HUMAN_READABLE {
        "Off".to_string()
    } else {
        pos.to_string()
    }
}

impl BackgammonEnv {
    /// 单子移动 -> 动作数字 (1..=150)
    pub fn single_checker_move_to_action(&self, m: &CheckerMove) -> i64 {
        debug_assert!(m.pos >= 0, "pass move cannot be encoded");
        debug_assert!((1..=NUM_DICE_FACES as i32).contains(&m.num));

        let pos: i64 = if m.pos == BAR_POS {
            ENCODED_BAR_MOVE
        } else if PLAYER_CENTRIC_OBS && self.acting_player() != Player::X {
            (23 - m.pos) as i64
        } else {
            m.pos as i64
        };
        let action = pos * NUM_DICE_FACES as i64 + m.num as i64;
        debug_assert!(action > 0 && action <= NUM_SINGLE_CHECKER_ACTIONS);
        action
    }

    /// 走子序列 -> 动作编码
    pub fn checker_moves_to_action(&self, moves: &[CheckerMove]) -> i64 {
        let mut action = 0i64;
        for m in moves {
            action = action * (NUM_SINGLE_CHECKER_ACTIONS + 1)
                + self.single_checker_move_to_action(m);
        }
        action
    }

    /// 动作数字 (1..=150) -> 单子移动 (hit 信息不在编码中, 置 false)
    pub fn action_to_single_checker_move(&self, action: i64) -> CheckerMove {
        debug_assert!(action > 0 && action <= NUM_SINGLE_CHECKER_ACTIONS);
        let action = action - 1;
        let mut pos = (action / NUM_DICE_FACES as i64) as i32;
        if pos as i64 == ENCODED_BAR_MOVE {
            pos = BAR_POS;
        } else if PLAYER_CENTRIC_OBS && self.acting_player() != Player::X {
            pos = 23 - pos;
        }
        let num = (action % NUM_DICE_FACES as i64) as i32 + 1;
        CheckerMove::new(pos, num, false)
    }

    /// 动作编码 -> 走子序列
    pub fn action_to_checker_moves(&self, action: i64) -> Vec<CheckerMove> {
        debug_assert!(action > 0 && action <= NUM_CHECKER_ACTIONS);
        let mut action = action;
        let mut moves = Vec::new();
        while action > 0 {
            let digit = action % (NUM_SINGLE_CHECKER_ACTIONS + 1);
            moves.insert(0, self.action_to_single_checker_move(digit));
            action /= NUM_SINGLE_CHECKER_ACTIONS + 1;
        }
        debug_assert!(moves.len() <= NUM_MOVES_PER_CHECKER_SEQUENCE);
        moves
    }

    /// 为显示补全击打信息并计算落点显示编号。
    /// start 为显示坐标 (Bar=25, 沿行进方向递减), 返回落点显示坐标。
    fn augment_checker_move(&self, m: &mut CheckerMove, player: Player, start: i32) -> i32 {
        let mut end = m.num;
        if end != PASS_POS {
            end = start - m.num;
            if end <= 0 {
                end = OFF_POS_HUMAN_READABLE;
            } else {
                let opp_pos = if player == Player::O { end - 1 } else { NUM_POINTS as i32 - end };
                if self.board(player.opponent(), opp_pos) == 1 {
                    m.hit = true;
                }
            }
        }
        end
    }

    /// 动作的人类可读表示 (机会结果 / 哨兵动作 / 走子序列)
    pub fn action_to_string(&self, action: i64) -> String {
        if self.is_chance_node() {
            let (outcome, starter) = if self.turns() >= 0 {
                (action, None)
            } else if action > 15 {
                (action - 15, Some("O starts"))
            } else {
                (action, Some("X starts"))
            };
            let values = CHANCE_OUTCOME_VALUES[(outcome - 1) as usize];
            return match starter {
                None => format!("chance outcome {} (roll: {}{})", action, values[1], values[0]),
                Some(s) => format!(
                    "chance outcome {} {}, (roll: {}{})",
                    outcome, s, values[1], values[0]
                ),
            };
        }

        if action > NUM_CHECKER_ACTIONS {
            return match action {
                END_TURN_ACTION => "EndTurn".to_string(),
                ROLL_ACTION => "Roll".to_string(),
                DOUBLE_ACTION => "Double".to_string(),
                TAKE_ACTION => "Take".to_string(),
                DROP_ACTION => "Drop".to_string(),
                _ => panic!("Unexpected action in action_to_string(): {}", action),
            };
        }

        // 标准记谱: 逐步显示 start/end, 击打加 '*', 出局显示 Off
        let player = self.acting_player();
        let mut scratch = self.clone();
        let mut moves_str = String::new();
        for mut m in self.action_to_checker_moves(action) {
            let move_start = if player == Player::O {
                if m.pos == BAR_POS { BAR_POS_HUMAN_READABLE } else { m.pos + 1 }
            } else if m.pos == BAR_POS {
                BAR_POS_HUMAN_READABLE
            } else {
                NUM_POINTS as i32 - m.pos
            };
            let move_end = scratch.augment_checker_move(&mut m, player, move_start);
            scratch.apply_checker_move(&m);
            moves_str.push_str(&format!(
                " {}/{}{}",
                position_to_string_human_readable(move_start),
                position_to_string_human_readable(move_end),
                if m.hit { "*" } else { "" }
            ));
        }
        format!("{} -{}", action, moves_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game_env::BackgammonGame;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn state_with_dice(player: Player, dice: Vec<i32>) -> BackgammonEnv {
        let game = BackgammonGame::new("backgammon", ScoringType::WinLoss, false).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let mut env = game.new_initial_state(&mut rng);
        let mut board = [[0; NUM_POINTS]; NUM_PLAYERS];
        board[0][0] = 2;
        board[0][11] = 5;
        board[0][16] = 3;
        board[0][18] = 5;
        board[1][23] = 2;
        board[1][12] = 5;
        board[1][7] = 3;
        board[1][5] = 5;
        env.set_state(player, dice, [0, 0], [0, 0], board);
        env
    }

    #[test]
    fn test_single_move_round_trip() {
        let env = state_with_dice(Player::X, vec![3, 1]);
        for pos in [0, 5, 11, BAR_POS] {
            for num in 1..=6 {
                let m = CheckerMove::new(pos, num, false);
                let action = env.single_checker_move_to_action(&m);
                let back = env.action_to_single_checker_move(action);
                assert_eq!((back.pos, back.num), (m.pos, m.num));
            }
        }
    }

    #[test]
    fn test_sequence_round_trip_for_all_legal_actions() {
        for player in [Player::X, Player::O] {
            for dice in [vec![3, 1], vec![6, 6], vec![5, 2]] {
                let env = state_with_dice(player, dice);
                for action in env.legal_actions() {
                    if action > NUM_CHECKER_ACTIONS {
                        continue;
                    }
                    let moves = env.action_to_checker_moves(action);
                    let reencoded = env.checker_moves_to_action(&moves);
                    assert_eq!(reencoded, action);
                }
            }
        }
    }

    #[test]
    fn test_player_centric_mirroring() {
        // 同一物理走法, O 方编码应与 X 方镜像
        let env_x = state_with_dice(Player::X, vec![3, 1]);
        let env_o = state_with_dice(Player::O, vec![3, 1]);
        let m_x = CheckerMove::new(0, 3, false);
        let m_o = CheckerMove::new(23, 3, false);
        if PLAYER_CENTRIC_OBS {
            assert_eq!(
                env_x.single_checker_move_to_action(&m_x),
                env_o.single_checker_move_to_action(&m_o)
            );
        }
    }

    #[test]
    fn test_sentinel_action_names() {
        let env = state_with_dice(Player::X, vec![3, 1]);
        assert_eq!(env.action_to_string(END_TURN_ACTION), "EndTurn");
        assert_eq!(env.action_to_string(ROLL_ACTION), "Roll");
    }

    #[test]
    fn test_checker_action_string_shows_start_and_end() {
        let env = state_with_dice(Player::X, vec![3, 1]);
        let actions = env.legal_actions();
        let s = env.action_to_string(actions[0]);
        assert!(s.contains('/'));
    }
}
