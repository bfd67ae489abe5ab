// nn_model.rs - 价值网络模块
//
// 价值回归模型, 两种结构由配置选择:
// - resnet: 输入卷积块 + 残差塔 + 1x1 卷积价值头
// - mlp:    LeakyReLU 全连接塔 + 价值头
// 网络只输出一个 tanh 标量, 表示观测持有方视角的局面价值。
// 模型结构参数以空白分隔标量形式持久化 (vpnet.pb), 供跨进程重建。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use tch::nn::OptimizerConfig;
use tch::{nn, Device, Kind, Tensor};

use crate::replay::ReplaySample;

/// "最新" 检查点的步号哨兵
pub const MOST_RECENT_CHECKPOINT_STEP: i64 = -1;

// ==============================================================================
// --- 模型配置 (ModelConfig) ---
// ==============================================================================

/// 网络结构描述, 持久化为空白分隔的标量序列:
/// `channels height width depth width lr wd model_name`
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub observation_shape: [i64; 3],
    pub nn_depth: i64,
    pub nn_width: i64,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub nn_model: String,
}

impl ModelConfig {
    pub fn flat_input_size(&self) -> i64 {
        self.observation_shape.iter().filter(|&&d| d > 0).product()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = format!(
            "{} {} {} {} {} {} {} {}",
            self.observation_shape[0],
            self.observation_shape[1],
            self.observation_shape[2],
            self.nn_depth,
            self.nn_width,
            self.learning_rate,
            self.weight_decay,
            self.nn_model,
        );
        std::fs::write(path, text).with_context(|| format!("write model config {:?}", path))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read model config {:?}", path))?;
        let fields: Vec<&str> = text.split_whitespace().collect();
        ensure!(fields.len() == 8, "model config has {} fields, expected 8", fields.len());
        let int = |i: usize| -> Result<i64> {
            fields[i].parse::<i64>().with_context(|| format!("model config field {}", i))
        };
        let float = |i: usize| -> Result<f64> {
            fields[i].parse::<f64>().with_context(|| format!("model config field {}", i))
        };
        Ok(Self {
            observation_shape: [int(0)?, int(1)?, int(2)?],
            nn_depth: int(3)?,
            nn_width: int(4)?,
            learning_rate: float(5)?,
            weight_decay: float(6)?,
            nn_model: fields[7].to_string(),
        })
    }
}

// ==============================================================================
// --- 网络结构 ---
// ==============================================================================

// 与 TF 对齐的 BatchNorm 参数 (torch momentum = 1 - TF momentum)
fn batch_norm_config() -> nn::BatchNormConfig {
    nn::BatchNormConfig { eps: 1e-3, momentum: 1e-2, ..Default::default() }
}

struct ResInputBlock {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
    channels: i64,
    height: i64,
    width: i64,
}

impl ResInputBlock {
    fn new(vs: &nn::Path, channels: i64, height: i64, width: i64, filters: i64) -> Self {
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        Self {
            conv: nn::conv2d(vs / "input_conv", channels, filters, 3, conv_cfg),
            bn: nn::batch_norm2d(vs / "input_batch_norm", filters, batch_norm_config()),
            channels,
            height,
            width,
        }
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.view([-1, self.channels, self.height, self.width])
            .apply(&self.conv)
            .apply_t(&self.bn, train)
            .relu()
    }
}

// 标准残差块: Conv -> BN -> ReLU -> Conv -> BN -> (+Input) -> ReLU
struct ResTorsoBlock {
    conv1: nn::Conv2D,
    bn1: nn::BatchNorm,
    conv2: nn::Conv2D,
    bn2: nn::BatchNorm,
}

impl ResTorsoBlock {
    fn new(vs: &nn::Path, filters: i64) -> Self {
        let conv_cfg = nn::ConvConfig { padding: 1, ..Default::default() };
        Self {
            conv1: nn::conv2d(vs / "conv_1", filters, filters, 3, conv_cfg),
            bn1: nn::batch_norm2d(vs / "batch_norm_1", filters, batch_norm_config()),
            conv2: nn::conv2d(vs / "conv_2", filters, filters, 3, conv_cfg),
            bn2: nn::batch_norm2d(vs / "batch_norm_2", filters, batch_norm_config()),
        }
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let out = xs
            .apply(&self.conv1)
            .apply_t(&self.bn1, train)
            .relu()
            .apply(&self.conv2)
            .apply_t(&self.bn2, train);
        (out + xs).relu()
    }
}

// 价值头: 1x1 Conv -> BN -> ReLU -> Linear -> ReLU -> Linear -> tanh
struct ResOutputBlock {
    conv: nn::Conv2D,
    bn: nn::BatchNorm,
    linear1: nn::Linear,
    linear2: nn::Linear,
    flat_size: i64,
}

impl ResOutputBlock {
    fn new(vs: &nn::Path, filters: i64, height: i64, width: i64, nn_width: i64) -> Self {
        let conv_cfg = nn::ConvConfig { padding: 0, ..Default::default() };
        let flat_size = height * width;
        Self {
            conv: nn::conv2d(vs / "value_conv", filters, 1, 1, conv_cfg),
            bn: nn::batch_norm2d(vs / "value_batch_norm", 1, batch_norm_config()),
            linear1: nn::linear(vs / "value_linear_1", flat_size, nn_width, Default::default()),
            linear2: nn::linear(vs / "value_linear_2", nn_width, 1, Default::default()),
            flat_size,
        }
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply(&self.conv)
            .apply_t(&self.bn, train)
            .relu()
            .view([-1, self.flat_size])
            .apply(&self.linear1)
            .relu()
            .apply(&self.linear2)
            .tanh()
    }
}

enum NetLayers {
    ResNet {
        input: ResInputBlock,
        torso: Vec<ResTorsoBlock>,
        output: ResOutputBlock,
    },
    Mlp {
        torso: Vec<nn::Linear>,
        value1: nn::Linear,
        value2: nn::Linear,
    },
}

impl NetLayers {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        match self {
            NetLayers::ResNet { input, torso, output } => {
                let mut x = input.forward_t(xs, train);
                for block in torso {
                    x = block.forward_t(&x, train);
                }
                output.forward_t(&x, train)
            }
            NetLayers::Mlp { torso, value1, value2 } => {
                let mut x = xs.shallow_clone();
                for layer in torso {
                    x = x.apply(layer).leaky_relu();
                }
                x.apply(value1).leaky_relu().apply(value2).tanh()
            }
        }
    }
}

// ==============================================================================
// --- 损失信息 ---
// ==============================================================================

/// 单次训练步的损失分量
#[derive(Debug, Clone, Copy, Default)]
pub struct LossInfo {
    pub value: f64,
    pub l2: f64,
    batches: u64,
}

impl LossInfo {
    pub fn new(value: f64, l2: f64) -> Self {
        Self { value, l2, batches: 1 }
    }

    pub fn total(&self) -> f64 {
        self.value + self.l2
    }

    /// 按累计批次数取平均
    pub fn averaged(&self) -> LossInfo {
        let n = self.batches.max(1) as f64;
        LossInfo { value: self.value / n, l2: self.l2 / n, batches: 1 }
    }
}

impl std::ops::AddAssign for LossInfo {
    fn add_assign(&mut self, rhs: Self) {
        self.value += rhs.value;
        self.l2 += rhs.l2;
        self.batches += rhs.batches;
    }
}

// ==============================================================================
// --- 模型 (VNetModel) ---
// ==============================================================================

/// 价值网络实例: VarStore 持有权重, 与优化器绑定在同一设备上。
/// 权重一致性依靠学习线程写出 "最新" 检查点、其余副本重新加载来维持。
pub struct VNetModel {
    device: Device,
    dir: PathBuf,
    config: ModelConfig,
    vs: nn::VarStore,
    net: NetLayers,
    optimizer: nn::Optimizer,
    flat_input_size: i64,
}

impl VNetModel {
    /// 从实验目录下的模型配置文件构建一个副本
    pub fn new(dir: &Path, graph_def: &str, device: Device) -> Result<Self> {
        let config = ModelConfig::load(&dir.join(graph_def))?;
        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let [c, h, w] = config.observation_shape;
        let net = match config.nn_model.as_str() {
            "resnet" => {
                let input = ResInputBlock::new(&root, c, h, w, config.nn_width);
                let torso = (0..config.nn_depth)
                    .map(|i| ResTorsoBlock::new(&(&root / format!("res_{}", i)), config.nn_width))
                    .collect();
                let output = ResOutputBlock::new(&root, config.nn_width, h, w, config.nn_width);
                NetLayers::ResNet { input, torso, output }
            }
            "mlp" => {
                let input_size = config.flat_input_size();
                let torso = (0..config.nn_depth)
                    .map(|i| {
                        let in_dim = if i == 0 { input_size } else { config.nn_width };
                        nn::linear(
                            &root / format!("torso_{}", i),
                            in_dim,
                            config.nn_width,
                            Default::default(),
                        )
                    })
                    .collect();
                let value1 = nn::linear(
                    &root / "value_linear_1",
                    config.nn_width,
                    config.nn_width,
                    Default::default(),
                );
                let value2 =
                    nn::linear(&root / "value_linear_2", config.nn_width, 1, Default::default());
                NetLayers::Mlp { torso, value1, value2 }
            }
            other => bail!("Unknown nn_model: {}", other),
        };

        let optimizer = nn::Adam::default()
            .build(&vs, config.learning_rate)
            .context("build Adam optimizer")?;
        let flat_input_size = config.flat_input_size();

        Ok(Self { device, dir: dir.to_path_buf(), config, vs, net, optimizer, flat_input_size })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    // --- 推理 ---

    /// 批量前向推理, 返回每个观测的标量价值 (观测持有方视角)
    pub fn inference(&self, observations: &[&[f32]]) -> Result<Vec<f64>> {
        let n = observations.len();
        let flat = self.flat_input_size as usize;
        let mut data = Vec::with_capacity(n * flat);
        for obs in observations {
            ensure!(obs.len() == flat, "observation size {} != {}", obs.len(), flat);
            data.extend_from_slice(obs);
        }

        let values = tch::no_grad(|| {
            let input = Tensor::from_slice(&data)
                .view([n as i64, self.flat_input_size])
                .to(self.device);
            self.net.forward_t(&input, false).to(Device::Cpu)
        });

        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push(values.double_value(&[i as i64, 0]));
        }
        Ok(out)
    }

    // --- 训练 ---

    /// 一个小批量的训练步。
    /// 损失 = MSE(价值, 目标) + weight_decay * 0.5 * sum(w^2),
    /// 正则项只统计权重 (跳过 bias 与 BatchNorm 的滑动统计量)。
    pub fn learn(&mut self, batch: &[ReplaySample]) -> Result<LossInfo> {
        ensure!(!batch.is_empty(), "empty training batch");
        let n = batch.len();
        let flat = self.flat_input_size as usize;

        let mut input_buf = Vec::with_capacity(n * flat);
        let mut target_buf = Vec::with_capacity(n);
        for sample in batch {
            ensure!(
                sample.observation.len() == flat,
                "observation size {} != {}",
                sample.observation.len(),
                flat
            );
            input_buf.extend_from_slice(&sample.observation);
            target_buf.push(sample.value as f32);
        }

        let inputs = Tensor::from_slice(&input_buf)
            .view([n as i64, self.flat_input_size])
            .to(self.device);
        let targets = Tensor::from_slice(&target_buf).view([n as i64, 1]).to(self.device);

        let predictions = self.net.forward_t(&inputs, true);
        let value_loss = predictions.mse_loss(&targets, tch::Reduction::Mean);

        let mut l2_sum = Tensor::from(0.0f32).to(self.device);
        for (name, tensor) in self.vs.variables() {
            if name.contains("bias") || name.contains("running") {
                continue;
            }
            l2_sum = l2_sum + tensor.square().sum(Kind::Float);
        }
        let l2_loss = l2_sum * (self.config.weight_decay * 0.5);

        let total_loss = &value_loss + &l2_loss;
        let value_loss_val = value_loss.double_value(&[]);
        let l2_loss_val = l2_loss.double_value(&[]);
        self.optimizer.backward_step(&total_loss);

        Ok(LossInfo::new(value_loss_val, l2_loss_val))
    }

    // --- 检查点 ---

    /// 保存检查点并返回其路径前缀 (不含扩展名)。步号 -1 表示 "最新"。
    pub fn save_checkpoint(&self, step: i64) -> Result<String> {
        let stem = self.dir.join(format!("checkpoint-{}", step));
        let stem = stem.to_string_lossy().to_string();
        self.vs
            .save(format!("{}.pt", stem))
            .with_context(|| format!("save checkpoint {}", stem))?;
        Ok(stem)
    }

    pub fn load_checkpoint(&mut self, step: i64) -> Result<()> {
        let stem = self.dir.join(format!("checkpoint-{}", step));
        self.load_checkpoint_path(&stem.to_string_lossy())
    }

    pub fn load_checkpoint_path(&mut self, stem: &str) -> Result<()> {
        self.vs
            .load(format!("{}.pt", stem))
            .with_context(|| format!("load checkpoint {}", stem))
    }

    /// 打印权重名称与形状, 调试用
    pub fn print(&self) {
        let vars: BTreeMap<String, Tensor> = self.vs.variables().into_iter().collect();
        eprintln!("Model parameters:");
        for (name, tensor) in vars {
            eprintln!("  {}: {:?}", name, tensor.size());
        }
    }
}

// ==============================================================================
// --- 设备工具 ---
// ==============================================================================

/// 解析 "cpu" / "cuda:0" / "/gpu:1" 形式的设备描述
pub fn parse_device(s: &str) -> Result<Device> {
    let s = s.trim().trim_start_matches('/').to_ascii_lowercase();
    if s == "cpu" || s.starts_with("cpu:") {
        return Ok(Device::Cpu);
    }
    for prefix in ["cuda", "gpu"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            let idx = rest.trim_start_matches(':');
            let idx = if idx.is_empty() { 0 } else { idx.parse::<usize>().context("device index")? };
            return Ok(Device::Cuda(idx));
        }
    }
    bail!("Unknown device: {}", s)
}

/// 进程级后端设置, 由监督器在构建任何模型之前调用一次。
/// 纯 CPU 运行时限制为单线程, 小批量下明显快于自动多线程。
pub fn configure_backend(devices: &[Device]) {
    if devices.iter().all(|d| matches!(d, Device::Cpu)) {
        tch::set_num_threads(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_mlp_config() -> ModelConfig {
        ModelConfig {
            observation_shape: [1, 1, 8],
            nn_depth: 2,
            nn_width: 16,
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            nn_model: "mlp".to_string(),
        }
    }

    #[test]
    fn test_model_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpnet.pb");
        let config = tiny_mlp_config();
        config.save(&path).unwrap();
        let loaded = ModelConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_unknown_model_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_mlp_config();
        config.nn_model = "transformer".to_string();
        config.save(&dir.path().join("vpnet.pb")).unwrap();
        assert!(VNetModel::new(dir.path(), "vpnet.pb", Device::Cpu).is_err());
    }

    #[test]
    fn test_inference_outputs_bounded_values() {
        let dir = tempfile::tempdir().unwrap();
        tiny_mlp_config().save(&dir.path().join("vpnet.pb")).unwrap();
        let model = VNetModel::new(dir.path(), "vpnet.pb", Device::Cpu).unwrap();
        let obs = vec![0.5f32; 8];
        let values = model.inference(&[&obs, &obs]).unwrap();
        assert_eq!(values.len(), 2);
        for v in values {
            assert!(v.abs() <= 1.0 + 1e-6);
        }
    }

    #[test]
    fn test_learn_returns_finite_losses() {
        let dir = tempfile::tempdir().unwrap();
        tiny_mlp_config().save(&dir.path().join("vpnet.pb")).unwrap();
        let mut model = VNetModel::new(dir.path(), "vpnet.pb", Device::Cpu).unwrap();
        let batch: Vec<ReplaySample> = (0..4)
            .map(|i| ReplaySample { observation: vec![i as f32 / 4.0; 8], value: 0.25 })
            .collect();
        let losses = model.learn(&batch).unwrap();
        assert!(losses.value.is_finite());
        assert!(losses.l2 >= 0.0);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        tiny_mlp_config().save(&dir.path().join("vpnet.pb")).unwrap();
        let model = VNetModel::new(dir.path(), "vpnet.pb", Device::Cpu).unwrap();
        let obs = vec![0.25f32; 8];
        let before = model.inference(&[&obs]).unwrap();
        let stem = model.save_checkpoint(MOST_RECENT_CHECKPOINT_STEP).unwrap();

        let mut other = VNetModel::new(dir.path(), "vpnet.pb", Device::Cpu).unwrap();
        other.load_checkpoint_path(&stem).unwrap();
        let after = other.inference(&[&obs]).unwrap();
        assert!((before[0] - after[0]).abs() < 1e-9);
    }
}
