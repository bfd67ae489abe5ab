// queue.rs - 停止令牌与有界轨迹队列
//
// 所有线程循环的头部轮询同一个 StopToken。
// ThreadedQueue 是生产者/消费者之间唯一的数据通道:
// 推入带超时阻塞, 关停时 block_new_values + clear 解除所有等待。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// 协作式停止令牌 (可克隆, 所有持有者共享同一状态)
#[derive(Clone, Default)]
pub struct StopToken {
    inner: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.inner.load(Ordering::Acquire)
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    block_new: bool,
}

/// 有界阻塞队列
pub struct ThreadedQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> ThreadedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState { items: VecDeque::new(), block_new: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// 推入一项, 最多等待 timeout。失败时把元素原样还给调用方,
    /// 以便记录日志后重试。
    pub fn push(&self, item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("queue mutex poisoned");
        while state.items.len() >= self.capacity && !state.block_new {
            let now = Instant::now();
            if now >= deadline {
                return Err(item);
            }
            let (guard, _) = self
                .not_full
                .wait_timeout(state, deadline - now)
                .expect("queue mutex poisoned");
            state = guard;
        }
        if state.block_new {
            return Err(item);
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// 弹出一项, 最多等待 timeout
    pub fn pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("queue mutex poisoned");
        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .not_empty
                .wait_timeout(state, deadline - now)
                .expect("queue mutex poisoned");
            state = guard;
        }
    }

    pub fn size(&self) -> usize {
        self.state.lock().expect("queue mutex poisoned").items.len()
    }

    /// 拒绝后续推入并唤醒所有等待的生产者 (关停路径)
    pub fn block_new_values(&self) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.block_new = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().expect("queue mutex poisoned");
        state.items.clear();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_push_pop_fifo() {
        let q = ThreadedQueue::new(4);
        q.push(1, Duration::from_millis(10)).unwrap();
        q.push(2, Duration::from_millis(10)).unwrap();
        assert_eq!(q.pop(Duration::from_millis(10)), Some(1));
        assert_eq!(q.pop(Duration::from_millis(10)), Some(2));
        assert_eq!(q.pop(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_push_times_out_when_full() {
        let q = ThreadedQueue::new(1);
        q.push(1, Duration::from_millis(10)).unwrap();
        assert_eq!(q.push(2, Duration::from_millis(50)), Err(2));
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn test_block_new_values_unblocks_producer() {
        let q = Arc::new(ThreadedQueue::new(1));
        q.push(1, Duration::from_millis(10)).unwrap();

        let q2 = q.clone();
        let producer = thread::spawn(move || q2.push(2, Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(50));
        q.block_new_values();
        assert_eq!(producer.join().unwrap(), Err(2));
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let q = Arc::new(ThreadedQueue::new(4));
        let q2 = q.clone();
        let consumer = thread::spawn(move || q2.pop(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(50));
        q.push(7, Duration::from_millis(10)).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(7));
    }

    #[test]
    fn test_clear_empties_queue() {
        let q = ThreadedQueue::new(4);
        q.push(1, Duration::from_millis(10)).unwrap();
        q.push(2, Duration::from_millis(10)).unwrap();
        q.clear();
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn test_stop_token_is_shared() {
        let stop = StopToken::new();
        let clone = stop.clone();
        assert!(!clone.stop_requested());
        stop.stop();
        assert!(clone.stop_requested());
    }
}
