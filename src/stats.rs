// stats.rs - 滚动统计与直方图
//
// 学习线程每步重置一次, 聚合结果进入结构化日志。

use serde_json::{json, Value};

/// 最小/最大/均值/标准差的流式统计
#[derive(Debug, Clone, Default)]
pub struct BasicStats {
    num: u64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
}

impl BasicStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        if self.num == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.num += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn num(&self) -> u64 {
        self.num
    }

    pub fn avg(&self) -> f64 {
        if self.num == 0 {
            0.0
        } else {
            self.sum / self.num as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        if self.num == 0 {
            return 0.0;
        }
        let avg = self.avg();
        (self.sum_sq / self.num as f64 - avg * avg).max(0.0).sqrt()
    }

    pub fn min(&self) -> f64 {
        if self.num == 0 { 0.0 } else { self.min }
    }

    pub fn max(&self) -> f64 {
        if self.num == 0 { 0.0 } else { self.max }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "num": self.num,
            "avg": self.avg(),
            "std_dev": self.std_dev(),
            "min": self.min(),
            "max": self.max(),
        })
    }
}

/// 按整数桶计数的直方图 (越界并入端点桶)
#[derive(Debug, Clone)]
pub struct HistogramNumbered {
    counts: Vec<u64>,
}

impl HistogramNumbered {
    pub fn new(num_buckets: usize) -> Self {
        Self { counts: vec![0; num_buckets.max(1)] }
    }

    pub fn add(&mut self, value: usize) {
        let idx = value.min(self.counts.len() - 1);
        self.counts[idx] += 1;
    }

    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
    }

    pub fn to_json(&self) -> Value {
        json!(self.counts)
    }
}

/// 命名桶直方图 (胜负分布等)
#[derive(Debug, Clone)]
pub struct HistogramNamed {
    names: Vec<String>,
    counts: Vec<u64>,
}

impl HistogramNamed {
    pub fn new(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|s| s.to_string()).collect(),
            counts: vec![0; names.len()],
        }
    }

    pub fn add(&mut self, idx: usize) {
        self.counts[idx] += 1;
    }

    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
    }

    pub fn to_json(&self) -> Value {
        json!({
            "names": self.names,
            "counts": self.counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_stats_moments() {
        let mut stats = BasicStats::new();
        for v in [1.0, 2.0, 3.0, 4.0] {
            stats.add(v);
        }
        assert_eq!(stats.num(), 4);
        assert!((stats.avg() - 2.5).abs() < 1e-12);
        assert!((stats.min() - 1.0).abs() < 1e-12);
        assert!((stats.max() - 4.0).abs() < 1e-12);
        assert!((stats.std_dev() - (1.25f64).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_basic_stats_empty() {
        let stats = BasicStats::new();
        assert_eq!(stats.avg(), 0.0);
        assert_eq!(stats.std_dev(), 0.0);
    }

    #[test]
    fn test_histogram_clamps_overflow() {
        let mut hist = HistogramNumbered::new(3);
        hist.add(0);
        hist.add(2);
        hist.add(99);
        assert_eq!(hist.to_json(), serde_json::json!([1, 0, 2]));
    }

    #[test]
    fn test_named_histogram() {
        let mut hist = HistogramNamed::new(&["Player1", "Player2", "Draw"]);
        hist.add(0);
        hist.add(0);
        hist.add(2);
        let json = hist.to_json();
        assert_eq!(json["counts"], serde_json::json!([2, 0, 1]));
    }
}
