// config.rs - 训练运行配置
//
// 所有键持久化到实验目录下的 config.json (pretty 格式)。
// 致命的配置错误在任何线程启动之前报告。

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::game_env::ScoringType;
use crate::nn_model::parse_device;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlphaZeroConfig {
    /// 游戏名: "backgammon" 或 "hyper_backgammon"
    pub game: String,
    /// 计分规则: winloss_scoring / enable_gammons / full_scoring
    pub scoring_type: String,
    /// 小概率生成退化开局 (输入条件化实验), 默认关闭
    pub randomized_openings: bool,
    /// 实验目录 (检查点与日志)
    pub path: String,

    pub nn_model: String,
    pub nn_width: i64,
    pub nn_depth: i64,
    pub learning_rate: f64,
    pub weight_decay: f64,

    /// 逗号分隔的设备列表, 第一个为学习设备
    pub devices: String,
    /// 学习期间是否把学习设备从推理池中摘除 (需要至少两个设备)
    pub explicit_learning: bool,

    pub actors: usize,
    pub evaluators: usize,

    pub uct_c: f64,
    pub min_simulations: usize,
    pub max_simulations: usize,
    pub policy_alpha: f64,
    pub policy_epsilon: f64,
    pub temperature: f64,
    pub temperature_drop: usize,
    pub cutoff_value: f64,
    pub cutoff_probability: f64,

    pub replay_buffer_size: usize,
    pub replay_buffer_reuse: usize,
    pub train_batch_size: usize,

    pub inference_batch_size: usize,
    pub inference_threads: usize,
    pub inference_cache: usize,

    pub td_lambda: f64,
    /// n 步截断 (0 表示不截断)
    pub td_n_steps: usize,

    pub checkpoint_freq: i64,
    pub eval_levels: usize,
    pub evaluation_window: usize,
    /// 0 表示不限步数
    pub max_steps: i64,
}

impl Default for AlphaZeroConfig {
    fn default() -> Self {
        Self {
            game: "backgammon".to_string(),
            scoring_type: "winloss_scoring".to_string(),
            randomized_openings: false,
            path: String::new(),
            nn_model: "mlp".to_string(),
            nn_width: 128,
            nn_depth: 4,
            learning_rate: 1e-4,
            weight_decay: 1e-4,
            devices: "cpu".to_string(),
            explicit_learning: false,
            actors: 4,
            evaluators: 1,
            uct_c: 2.0,
            min_simulations: 0,
            max_simulations: 300,
            policy_alpha: 1.0,
            policy_epsilon: 0.25,
            temperature: 1.0,
            temperature_drop: 10,
            cutoff_value: 0.95,
            cutoff_probability: 0.8,
            replay_buffer_size: 1 << 16,
            replay_buffer_reuse: 3,
            train_batch_size: 1 << 10,
            inference_batch_size: 1,
            inference_threads: 1,
            inference_cache: 1 << 18,
            td_lambda: 0.9,
            td_n_steps: 10,
            checkpoint_freq: 100,
            eval_levels: 7,
            evaluation_window: 100,
            max_steps: 0,
        }
    }
}

impl AlphaZeroConfig {
    pub fn device_list(&self) -> Result<Vec<tch::Device>> {
        self.devices
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(parse_device)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.path.is_empty(), "path must be specified");
        if self.game != "backgammon" && self.game != "hyper_backgammon" {
            bail!("Unknown game: {}", self.game);
        }
        ScoringType::parse(&self.scoring_type)?;
        if self.nn_model != "resnet" && self.nn_model != "mlp" {
            bail!("Unknown nn_model: {}", self.nn_model);
        }
        ensure!(self.nn_width > 0 && self.nn_depth > 0, "nn_width/nn_depth must be positive");
        ensure!(self.actors > 0, "at least one actor is required");
        ensure!(self.max_simulations > 0, "max_simulations must be positive");
        ensure!(
            self.min_simulations <= self.max_simulations,
            "min_simulations must not exceed max_simulations"
        );
        ensure!(self.replay_buffer_reuse > 0, "replay_buffer_reuse must be positive");
        ensure!(
            self.replay_buffer_size >= self.train_batch_size,
            "replay_buffer_size must hold at least one training batch"
        );
        ensure!(
            (0.0..=1.0).contains(&self.cutoff_probability),
            "cutoff_probability must lie in [0, 1]"
        );
        if self.temperature_drop > 0 {
            ensure!(
                self.temperature > 0.0,
                "temperature must be positive when temperature_drop is set"
            );
        }
        ensure!(self.checkpoint_freq > 0, "checkpoint_freq must be positive");
        ensure!(self.eval_levels > 0, "eval_levels must be positive");
        ensure!(self.evaluation_window > 0, "evaluation_window must be positive");

        let devices = self.device_list()?;
        ensure!(!devices.is_empty(), "no devices specified");
        if self.explicit_learning {
            ensure!(
                devices.len() >= 2,
                "explicit_learning can only be used with multiple devices"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AlphaZeroConfig {
        AlphaZeroConfig { path: "/tmp/az".to_string(), ..Default::default() }
    }

    #[test]
    fn test_default_config_validates() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_unknown_game_rejected() {
        let config = AlphaZeroConfig { game: "chess".to_string(), ..valid_config() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_learning_needs_two_devices() {
        let config = AlphaZeroConfig { explicit_learning: true, ..valid_config() };
        assert!(config.validate().is_err());

        let config = AlphaZeroConfig {
            explicit_learning: true,
            devices: "cuda:0,cpu".to_string(),
            ..valid_config()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_round_trip() {
        let config = valid_config();
        let text = serde_json::to_string_pretty(&config).unwrap();
        let back: AlphaZeroConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.replay_buffer_size, config.replay_buffer_size);
        assert_eq!(back.game, config.game);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let back: AlphaZeroConfig =
            serde_json::from_str("{\"path\":\"/tmp/x\",\"actors\":2}").unwrap();
        assert_eq!(back.actors, 2);
        assert_eq!(back.nn_model, "mlp");
    }
}
