// device.rs - 模型副本池
//
// 每个计算设备持有一个模型副本。学习线程独占第一个设备的变更权,
// explicit_learning 打开时该设备在训练期间不再出借给推理。

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::nn_model::VNetModel;

pub struct DeviceManager {
    devices: Vec<Mutex<VNetModel>>,
    learning: AtomicBool,
    next: AtomicUsize,
}

/// 设备借据: 持有期间独占该副本
pub struct DeviceLoan<'a> {
    pub device_id: usize,
    guard: MutexGuard<'a, VNetModel>,
}

impl Deref for DeviceLoan<'_> {
    type Target = VNetModel;

    fn deref(&self) -> &VNetModel {
        &self.guard
    }
}

impl DerefMut for DeviceLoan<'_> {
    fn deref_mut(&mut self) -> &mut VNetModel {
        &mut self.guard
    }
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            learning: AtomicBool::new(false),
            next: AtomicUsize::new(0),
        }
    }

    pub fn add_device(&mut self, model: VNetModel) {
        self.devices.push(Mutex::new(model));
    }

    pub fn count(&self) -> usize {
        self.devices.len()
    }

    /// 标记第一个设备正在学习 (推理出借将绕开它)
    pub fn set_learning(&self, on: bool) {
        self.learning.store(on, Ordering::Release);
    }

    /// 借出指定设备 (阻塞直至可用)
    pub fn loan(&self, device_id: usize) -> DeviceLoan<'_> {
        DeviceLoan {
            device_id,
            guard: self.devices[device_id].lock().expect("device mutex poisoned"),
        }
    }

    /// 为推理借出一个设备: 轮转分配, 学习期间跳过学习设备
    pub fn loan_inference(&self) -> DeviceLoan<'_> {
        let n = self.devices.len();
        let skip_first = self.learning.load(Ordering::Acquire) && n > 1;
        let (base, len) = if skip_first { (1, n - 1) } else { (0, n) };
        let id = base + self.next.fetch_add(1, Ordering::Relaxed) % len;
        self.loan(id)
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}
