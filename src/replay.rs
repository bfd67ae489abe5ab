// replay.rs - 回放缓冲区
//
// 定容环形缓冲, 均匀有放回采样。学习线程每步落盘一次,
// 崩溃恢复时无损重建。

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// 一条训练样本: 观测与标量价值目标 (经 TD(λ) 与幸运度修正)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySample {
    pub observation: Vec<f32>,
    pub value: f64,
}

/// 可序列化的环形缓冲区
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayBuffer<T> {
    capacity: usize,
    total_added: u64,
    next: usize,
    data: Vec<T>,
}

impl<T: Clone + Serialize + DeserializeOwned> ReplayBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            total_added: 0,
            next: 0,
            data: Vec::new(),
        }
    }

    pub fn add(&mut self, item: T) {
        if self.data.len() < self.capacity {
            self.data.push(item);
        } else {
            self.data[self.next] = item;
        }
        self.next = (self.next + 1) % self.capacity;
        self.total_added += 1;
    }

    /// 均匀有放回采样 n 条
    pub fn sample<R: Rng>(&self, rng: &mut R, n: usize) -> Vec<T> {
        debug_assert!(!self.data.is_empty());
        (0..n)
            .map(|_| self.data[rng.gen_range(0..self.data.len())].clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_added(&self) -> u64 {
        self.total_added
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("create {:?}", path))?;
        bincode::serialize_into(BufWriter::new(file), self)
            .with_context(|| format!("serialize replay buffer to {:?}", path))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {:?}", path))?;
        bincode::deserialize_from(BufReader::new(file))
            .with_context(|| format!("deserialize replay buffer from {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_size_and_total_added() {
        let mut buffer: ReplayBuffer<i32> = ReplayBuffer::new(4);
        for i in 0..10 {
            buffer.add(i);
        }
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.total_added(), 10);
    }

    #[test]
    fn test_ring_keeps_latest_items() {
        let mut buffer: ReplayBuffer<i32> = ReplayBuffer::new(3);
        for i in 0..7 {
            buffer.add(i);
        }
        let mut data = buffer.data.clone();
        data.sort_unstable();
        assert_eq!(data, vec![4, 5, 6]);
    }

    #[test]
    fn test_sample_with_replacement() {
        let mut buffer: ReplayBuffer<i32> = ReplayBuffer::new(4);
        buffer.add(42);
        let mut rng = StdRng::seed_from_u64(0);
        let samples = buffer.sample(&mut rng, 8);
        assert_eq!(samples.len(), 8);
        assert!(samples.iter().all(|&x| x == 42));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay_buffer.data");
        let mut buffer: ReplayBuffer<ReplaySample> = ReplayBuffer::new(8);
        for i in 0..12 {
            buffer.add(ReplaySample {
                observation: vec![i as f32, i as f32 * 0.5],
                value: i as f64 / 12.0,
            });
        }
        buffer.save(&path).unwrap();
        let loaded: ReplayBuffer<ReplaySample> = ReplayBuffer::load(&path).unwrap();
        assert_eq!(loaded, buffer);
    }
}
