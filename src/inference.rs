// inference.rs - 批量推理服务模块
//
// 为并发的搜索线程提供带缓存的价值评估:
// 调用方把请求放入共享队列后挂起, 推理线程凑批执行一次前向,
// 再经各请求自带的响应通道唤醒调用方。
// 凑批等待有上限, 低吞吐阶段不会卡住请求。

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::Hasher;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::cache::{CacheInfo, LruCache};
use crate::device::DeviceManager;
use crate::game_env::{BackgammonEnv, NUM_PLAYERS, PLAYER_CENTRIC_OBS};
use crate::mcts::{uniform_prior, Evaluator};
use crate::queue::StopToken;
use crate::stats::{BasicStats, HistogramNumbered};

/// 批次未满时等待后续请求的时间上限
const MAX_BATCH_WAIT: Duration = Duration::from_millis(10);
/// 空闲轮询周期 (同时也是停止令牌的响应粒度)
const IDLE_POLL: Duration = Duration::from_millis(50);

/// 推理请求: 观测 + 一次性响应通道
struct Request {
    observation: Vec<f32>,
    response: mpsc::Sender<Result<f64>>,
}

struct Shared {
    device_manager: Arc<DeviceManager>,
    batch_size: usize,
    queue: Mutex<VecDeque<Request>>,
    queue_cv: Condvar,
    /// 分片 LRU; 为空表示缓存关闭
    cache: Vec<Mutex<LruCache>>,
    batch_stats: Mutex<BasicStats>,
    batch_hist: Mutex<HistogramNumbered>,
    stop: StopToken,
}

/// 价值网络评估服务
///
/// 实现 mcts::Evaluator, 可被任意多个 actor / evaluator 线程共享。
/// 推理线程通过 `start_runners` 启动, 关停时清空未决请求并以错误唤醒调用方。
pub struct VNetEvaluator {
    shared: Arc<Shared>,
    runners: Mutex<Vec<JoinHandle<()>>>,
}

impl VNetEvaluator {
    pub fn new(
        device_manager: Arc<DeviceManager>,
        batch_size: usize,
        cache_size: usize,
        cache_shards: usize,
        stop: StopToken,
    ) -> Self {
        let cache = if cache_size == 0 {
            Vec::new()
        } else {
            let shards = cache_shards.max(1);
            (0..shards)
                .map(|_| Mutex::new(LruCache::new((cache_size / shards).max(1))))
                .collect()
        };
        let shared = Arc::new(Shared {
            device_manager,
            batch_size: batch_size.max(1),
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            cache,
            batch_stats: Mutex::new(BasicStats::new()),
            batch_hist: Mutex::new(HistogramNumbered::new(batch_size.max(1) + 1)),
            stop,
        });
        Self { shared, runners: Mutex::new(Vec::new()) }
    }

    pub fn start_runners(&self, threads: usize) {
        let mut runners = self.runners.lock().expect("runner list poisoned");
        for i in 0..threads.max(1) {
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("inference-{}", i))
                .spawn(move || runner_loop(shared))
                .expect("spawn inference thread");
            runners.push(handle);
        }
    }

    /// 等待所有推理线程退出 (停止令牌必须已触发)
    pub fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut runners = self.runners.lock().expect("runner list poisoned");
            runners.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    // --- 统计 ---

    pub fn cache_info(&self) -> CacheInfo {
        let mut info = CacheInfo::default();
        for shard in &self.shared.cache {
            info.merge(&shard.lock().expect("cache shard poisoned").info());
        }
        info
    }

    pub fn clear_cache(&self) {
        for shard in &self.shared.cache {
            shard.lock().expect("cache shard poisoned").clear();
        }
    }

    pub fn batch_size_stats(&self) -> BasicStats {
        self.shared.batch_stats.lock().expect("batch stats poisoned").clone()
    }

    pub fn batch_size_histogram(&self) -> HistogramNumbered {
        self.shared.batch_hist.lock().expect("batch hist poisoned").clone()
    }

    pub fn reset_batch_size_stats(&self) {
        self.shared.batch_stats.lock().expect("batch stats poisoned").reset();
        self.shared.batch_hist.lock().expect("batch hist poisoned").reset();
    }

    // --- 请求路径 ---

    fn observation_key(observation: &[f32]) -> u64 {
        let mut hasher = DefaultHasher::new();
        for &v in observation {
            hasher.write_u32(v.to_bits());
        }
        hasher.finish()
    }

    fn cache_shard(&self, key: u64) -> Option<&Mutex<LruCache>> {
        if self.shared.cache.is_empty() {
            None
        } else {
            Some(&self.shared.cache[(key % self.shared.cache.len() as u64) as usize])
        }
    }

    /// 单个观测的标量价值 (缓存短路, 否则入队并阻塞等待批量结果)
    fn evaluate_observation(&self, observation: Vec<f32>) -> Result<f64> {
        let key = Self::observation_key(&observation);
        if let Some(shard) = self.cache_shard(key) {
            if let Some(value) = shard.lock().expect("cache shard poisoned").get(key) {
                return Ok(value);
            }
        }
        if self.shared.stop.stop_requested() {
            return Err(anyhow!("inference service stopped"));
        }

        let (tx, rx) = mpsc::channel();
        {
            let mut queue = self.shared.queue.lock().expect("inference queue poisoned");
            queue.push_back(Request { observation, response: tx });
            self.shared.queue_cv.notify_one();
        }
        // 等待批量结果, 同时保持对停止令牌的响应
        let value = loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(result) => break result?,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if self.shared.stop.stop_requested() {
                        return Err(anyhow!("inference service stopped"));
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("inference service terminated"));
                }
            }
        };

        if let Some(shard) = self.cache_shard(key) {
            shard.lock().expect("cache shard poisoned").insert(key, value);
        }
        Ok(value)
    }
}

impl Evaluator for VNetEvaluator {
    fn evaluate(&self, env: &BackgammonEnv) -> Result<Vec<f64>> {
        let perspective = env.perspective_player();
        let observation = env.observation_tensor(perspective);
        let value = self.evaluate_observation(observation)?;

        let mut out = vec![0.0; NUM_PLAYERS];
        if PLAYER_CENTRIC_OBS {
            out[perspective.idx()] = value;
            out[perspective.opponent().idx()] = -value;
        } else {
            out[0] = value;
            out[1] = -value;
        }
        Ok(out)
    }

    fn prior(&self, env: &BackgammonEnv) -> Vec<(i64, f64)> {
        uniform_prior(env)
    }
}

// ==============================================================================
// --- 推理线程主循环 ---
// ==============================================================================

fn runner_loop(shared: Arc<Shared>) {
    loop {
        let batch = match collect_batch(&shared) {
            Some(batch) => batch,
            None => {
                drain_pending(&shared);
                return;
            }
        };

        let observations: Vec<&[f32]> =
            batch.iter().map(|r| r.observation.as_slice()).collect();
        let result = {
            let loan = shared.device_manager.loan_inference();
            loan.inference(&observations)
        };

        match result {
            Ok(values) => {
                for (request, value) in batch.iter().zip(values) {
                    let _ = request.response.send(Ok(value));
                }
            }
            Err(err) => {
                // 模型失败是资源级错误: 通知所有调用方并触发全局停止
                for request in &batch {
                    let _ = request.response.send(Err(anyhow!("inference failed: {:#}", err)));
                }
                shared.stop.stop();
            }
        }

        shared
            .batch_stats
            .lock()
            .expect("batch stats poisoned")
            .add(batch.len() as f64);
        shared
            .batch_hist
            .lock()
            .expect("batch hist poisoned")
            .add(batch.len());
    }
}

/// 取一批请求; 停止且队列为空时返回 None
fn collect_batch(shared: &Shared) -> Option<Vec<Request>> {
    let mut batch = Vec::new();
    let mut queue = shared.queue.lock().expect("inference queue poisoned");

    // 等待第一个请求
    loop {
        if let Some(request) = queue.pop_front() {
            batch.push(request);
            break;
        }
        if shared.stop.stop_requested() {
            return None;
        }
        let (guard, _) = shared
            .queue_cv
            .wait_timeout(queue, IDLE_POLL)
            .expect("inference queue poisoned");
        queue = guard;
    }

    // 在限定时间内凑满批次
    let deadline = Instant::now() + MAX_BATCH_WAIT;
    while batch.len() < shared.batch_size {
        if let Some(request) = queue.pop_front() {
            batch.push(request);
            continue;
        }
        let now = Instant::now();
        if now >= deadline || shared.stop.stop_requested() {
            break;
        }
        let (guard, _) = shared
            .queue_cv
            .wait_timeout(queue, deadline - now)
            .expect("inference queue poisoned");
        queue = guard;
    }
    Some(batch)
}

/// 关停路径: 未决请求全部以错误唤醒
fn drain_pending(shared: &Shared) {
    let mut queue = shared.queue.lock().expect("inference queue poisoned");
    while let Some(request) = queue.pop_front() {
        let _ = request.response.send(Err(anyhow!("inference service stopped")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn_model::{ModelConfig, VNetModel};
    use tch::Device;

    fn evaluator_with_mlp(batch_size: usize, cache_size: usize) -> (VNetEvaluator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        ModelConfig {
            observation_shape: [1, 1, crate::game_env::STATE_ENCODING_SIZE as i64],
            nn_depth: 1,
            nn_width: 8,
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            nn_model: "mlp".to_string(),
        }
        .save(&dir.path().join("vpnet.pb"))
        .unwrap();
        let mut dm = DeviceManager::new();
        dm.add_device(VNetModel::new(dir.path(), "vpnet.pb", Device::Cpu).unwrap());
        let eval =
            VNetEvaluator::new(Arc::new(dm), batch_size, cache_size, 1, StopToken::new());
        (eval, dir)
    }

    #[test]
    fn test_ten_clients_three_batches() {
        let (eval, _dir) = evaluator_with_mlp(4, 0);
        let eval = Arc::new(eval);

        // 先让 10 个互异请求全部入队, 再启动单个推理线程:
        // 预期恰好 ceil(10/4) = 3 次前向
        let mut clients = Vec::new();
        for i in 0..10 {
            let eval2 = eval.clone();
            clients.push(std::thread::spawn(move || {
                let mut obs = vec![0.0f32; crate::game_env::STATE_ENCODING_SIZE];
                obs[i] = 1.0;
                eval2.evaluate_observation(obs).unwrap()
            }));
        }
        while eval.shared.queue.lock().unwrap().len() < 10 {
            std::thread::sleep(Duration::from_millis(5));
        }
        eval.start_runners(1);
        for client in clients {
            let v = client.join().unwrap();
            assert!(v.abs() <= 1.0 + 1e-6);
        }

        let stats = eval.batch_size_stats();
        assert_eq!(stats.num(), 3);
        eval.shared.stop.stop();
        eval.shutdown();
    }

    #[test]
    fn test_cache_returns_identical_values() {
        let (eval, _dir) = evaluator_with_mlp(2, 64);
        eval.start_runners(1);

        let obs = vec![0.5f32; crate::game_env::STATE_ENCODING_SIZE];
        let v1 = eval.evaluate_observation(obs.clone()).unwrap();
        let v2 = eval.evaluate_observation(obs).unwrap();
        assert_eq!(v1, v2);

        let info = eval.cache_info();
        assert_eq!(info.hits, 1);
        assert_eq!(info.misses, 1);
        eval.shared.stop.stop();
        eval.shutdown();
    }

    #[test]
    fn test_stop_errors_pending_requests() {
        let (eval, _dir) = evaluator_with_mlp(4, 0);
        let eval = Arc::new(eval);
        eval.shared.stop.stop();
        eval.start_runners(1);

        let eval2 = eval.clone();
        let client = std::thread::spawn(move || {
            let obs = vec![0.0f32; crate::game_env::STATE_ENCODING_SIZE];
            eval2.evaluate_observation(obs)
        });
        let result = client.join().unwrap();
        assert!(result.is_err());
        eval.shutdown();
    }

    #[test]
    fn test_clear_cache_forces_reevaluation() {
        let (eval, _dir) = evaluator_with_mlp(2, 64);
        eval.start_runners(1);

        let obs = vec![0.25f32; crate::game_env::STATE_ENCODING_SIZE];
        eval.evaluate_observation(obs.clone()).unwrap();
        eval.clear_cache();
        eval.evaluate_observation(obs).unwrap();
        let info = eval.cache_info();
        assert_eq!(info.hits, 0);
        eval.shared.stop.stop();
        eval.shutdown();
    }
}
