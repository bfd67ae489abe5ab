// features.rs - 观测编码 (Neural Network Input)
//
// MLP 编码沿用 Tesauro 式 one-hot + 溢出表示;
// 行动方中心模式下棋盘翻转, "我方" 区块总在前面。

use super::constants::*;
use super::types::*;
use super::board::BackgammonEnv;

fn onehot(out: &mut Vec<f32>, size: i32, val: i32) {
    for i in 0..=size {
        out.push(if i == val { 1.0 } else { 0.0 });
    }
}

fn onehot_plus_overage(out: &mut Vec<f32>, size: i32, maxval: i32, val: i32) {
    for i in 0..=size {
        out.push(if i == val { 1.0 } else { 0.0 });
    }
    out.push(if val <= size {
        0.0
    } else {
        1.0 + (val - size) as f32 / (maxval - size) as f32
    });
}

impl BackgammonEnv {
    /// 指定视角玩家的观测向量
    pub fn observation_tensor(&self, player: Player) -> Vec<f32> {
        if USE_RESNET_OBS {
            self.resnet_observation(player)
        } else {
            self.mlp_observation(player)
        }
    }

    pub fn observation_size(&self) -> usize {
        if USE_RESNET_OBS {
            RESNET_PLANES * RESNET_PLANE_WIDTH
        } else {
            STATE_ENCODING_SIZE
        }
    }

    fn mlp_observation(&self, player: Player) -> Vec<f32> {
        let mut out = Vec::with_capacity(STATE_ENCODING_SIZE);

        if PLAYER_CENTRIC_OBS {
            let invert = player != Player::X;
            for plyr in 0..NUM_PLAYERS {
                // 翻转时: 区块 0 为视角玩家 (坐标镜像), 区块 1 为对手
                let src = if invert { 1 - plyr } else { plyr };
                onehot_plus_overage(&mut out, 5, 15, self.bar[src]);
                for i in 0..NUM_POINTS {
                    let pt = if invert { NUM_POINTS - 1 - i } else { i };
                    onehot_plus_overage(&mut out, 5, 15, self.board[src][pt]);
                }
                onehot(&mut out, 15, self.scores[src]);
            }
            // 行动方标志恒为 "轮到我"
            out.push(1.0);
            out.push(0.0);
        } else {
            for plyr in 0..NUM_PLAYERS {
                onehot_plus_overage(&mut out, 5, 15, self.bar[plyr]);
                for pt in 0..NUM_POINTS {
                    onehot_plus_overage(&mut out, 5, 15, self.board[plyr][pt]);
                }
                onehot(&mut out, 15, self.scores[plyr]);
            }
            out.push(if self.cur_player == Mover::Player(Player::X) { 1.0 } else { 0.0 });
            out.push(if self.cur_player == Mover::Player(Player::O) { 1.0 } else { 0.0 });
        }

        // 每种点数剩余使用次数 (0..=4 的 one-hot)
        for face in 0..NUM_DICE_FACES {
            let val = if self.dice_rolled() { self.remaining_dice[face] } else { 0 };
            onehot(&mut out, 4, val);
        }

        // 比赛 / 倍率立方槽位 (本实现固定为单局: away=1, crawford=0, cube=1)
        out.push(1.0);
        out.push(1.0);
        out.push(0.0);
        out.push(1.0);
        out.push(if self.dice_rolled() { 1.0 } else { 0.0 });
        out.push(0.0);

        debug_assert_eq!(out.len(), STATE_ENCODING_SIZE);
        out
    }

    fn resnet_observation(&self, player: Player) -> Vec<f32> {
        let w = RESNET_PLANE_WIDTH;
        let mut out = Vec::with_capacity(RESNET_PLANES * w);
        let (me, opp, invert) = if PLAYER_CENTRIC_OBS {
            (player.idx(), player.opponent().idx(), player != Player::X)
        } else {
            (0, 1, false)
        };

        // 平面 1: 我方棋子 Bar -> 棋盘 -> 出局 (归一化到 /15)
        out.push(self.bar[me] as f32 / 15.0);
        for i in 0..NUM_POINTS {
            let pt = if invert { NUM_POINTS - 1 - i } else { i };
            out.push(self.board[me][pt] as f32 / 15.0);
        }
        out.push(self.scores[me] as f32 / 15.0);

        // 平面 2: 对方棋子 出局 -> 棋盘 -> Bar
        out.push(self.scores[opp] as f32 / 15.0);
        for i in 0..NUM_POINTS {
            let pt = if invert { NUM_POINTS - 1 - i } else { i };
            out.push(self.board[opp][pt] as f32 / 15.0);
        }
        out.push(self.bar[opp] as f32 / 15.0);

        // 平面 3/4: 行动方标志
        let (x_to_act, o_to_act) = if PLAYER_CENTRIC_OBS {
            (1.0, 0.0)
        } else {
            (
                if self.cur_player == Mover::Player(Player::X) { 1.0 } else { 0.0 },
                if self.cur_player == Mover::Player(Player::O) { 1.0 } else { 0.0 },
            )
        };
        out.extend(std::iter::repeat(x_to_act).take(w));
        out.extend(std::iter::repeat(o_to_act).take(w));

        // 平面 5-10: 每种点数的剩余使用次数
        for face in 0..NUM_DICE_FACES {
            let val = if self.dice_rolled() { self.remaining_dice[face] as f32 } else { 0.0 };
            out.extend(std::iter::repeat(val).take(w));
        }

        // 平面 11-16: away / crawford / cube / 已掷骰 / cube 被提出
        out.extend(std::iter::repeat(1.0).take(w));
        out.extend(std::iter::repeat(1.0).take(w));
        out.extend(std::iter::repeat(0.0).take(w));
        out.extend(std::iter::repeat(1.0).take(w));
        let rolled = if self.dice_rolled() { 1.0 } else { 0.0 };
        out.extend(std::iter::repeat(rolled).take(w));
        out.extend(std::iter::repeat(0.0).take(w));

        debug_assert_eq!(out.len(), RESNET_PLANES * w);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game_env::BackgammonGame;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_observation_width() {
        let game = BackgammonGame::new("backgammon", ScoringType::WinLoss, false).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut env = game.new_initial_state(&mut rng);
        // 推进到第一个决策节点
        env.apply_action(1);
        let obs = env.observation_tensor(env.acting_player());
        assert_eq!(obs.len(), env.observation_size());
        if !USE_RESNET_OBS {
            assert_eq!(obs.len(), STATE_ENCODING_SIZE);
        }
    }

    #[test]
    fn test_player_centric_symmetry() {
        if !PLAYER_CENTRIC_OBS || USE_RESNET_OBS {
            return;
        }
        // 镜像局面下, 双方各自视角的观测应一致
        let game = BackgammonGame::new("backgammon", ScoringType::WinLoss, false).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut env_x = game.new_initial_state(&mut rng);
        let mut env_o = game.new_initial_state(&mut rng);

        let mut board = [[0; NUM_POINTS]; NUM_PLAYERS];
        board[0][0] = 2;
        board[0][11] = 5;
        board[0][16] = 3;
        board[0][18] = 5;
        board[1][23] = 2;
        board[1][12] = 5;
        board[1][7] = 3;
        board[1][5] = 5;
        env_x.set_state(Player::X, vec![3, 1], [0, 0], [0, 0], board);
        env_o.set_state(Player::O, vec![3, 1], [0, 0], [0, 0], board);

        assert_eq!(
            env_x.observation_tensor(Player::X),
            env_o.observation_tensor(Player::O)
        );
    }

    #[test]
    fn test_dice_encoded_in_observation() {
        let game = BackgammonGame::new("backgammon", ScoringType::WinLoss, false).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut env = game.new_initial_state(&mut rng);
        let mut board = [[0; NUM_POINTS]; NUM_PLAYERS];
        board[0][0] = 15;
        board[1][23] = 15;
        env.set_state(Player::X, vec![3, 1], [0, 0], [0, 0], board);
        let with_dice = env.observation_tensor(Player::X);
        env.set_state(Player::X, vec![6, 5], [0, 0], [0, 0], board);
        let other_dice = env.observation_tensor(Player::X);
        assert_ne!(with_dice, other_dice);
    }
}
