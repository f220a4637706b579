//! # 进行中请求登记表
//!
//! 同一个 key 同时只允许一个“所有者”真正执行任务，其余调用方作为“等待者”挂在同一结果上。
//! 所有者完成后把结果（成功或失败）一次性广播给全部等待者；
//! 所有者中途被丢弃（例如请求被取消）时登记自动撤销，等待者收到 `None` 后重新竞争所有权。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::ImageError;

type Slot<T> = Option<Result<T, ImageError>>;

struct Entry<T> {
    id: u64,
    receiver: watch::Receiver<Slot<T>>,
}

struct Shared<T> {
    next_id: AtomicU64,
    entries: Mutex<HashMap<String, Entry<T>>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<T>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn remove_if_owned(&self, key: &str, id: u64) {
        let mut entries = self.lock();
        if entries.get(key).is_some_and(|entry| entry.id == id) {
            entries.remove(key);
        }
    }
}

pub struct InFlightRegistry<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Default for InFlightRegistry<T> {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl<T> InFlightRegistry<T> {
    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> std::fmt::Debug for InFlightRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightRegistry").field("len", &self.len()).finish()
    }
}

pub enum Flight<T> {
    Owner(FlightOwner<T>),
    Waiter(FlightWaiter<T>),
}

impl<T: Clone> InFlightRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记 key：没有进行中的任务时成为所有者，否则成为等待者。
    pub fn join(&self, key: &str) -> Flight<T> {
        let mut entries = self.shared.lock();
        if let Some(entry) = entries.get(key) {
            return Flight::Waiter(FlightWaiter {
                receiver: entry.receiver.clone(),
            });
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        entries.insert(key.to_string(), Entry { id, receiver });
        Flight::Owner(FlightOwner {
            shared: Arc::clone(&self.shared),
            key: key.to_string(),
            id,
            sender: Some(sender),
        })
    }
}

/// 任务所有者。`finish` 广播结果；直接丢弃则撤销登记。
pub struct FlightOwner<T> {
    shared: Arc<Shared<T>>,
    key: String,
    id: u64,
    sender: Option<watch::Sender<Slot<T>>>,
}

impl<T> FlightOwner<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn finish(mut self, result: Result<T, ImageError>) {
        if let Some(sender) = self.sender.take() {
            sender.send_replace(Some(result));
        }
        self.shared.remove_if_owned(&self.key, self.id);
    }
}

impl<T> Drop for FlightOwner<T> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            log::debug!("🔁 进行中的任务被放弃 - key={}", self.key);
            self.shared.remove_if_owned(&self.key, self.id);
        }
    }
}

pub struct FlightWaiter<T> {
    receiver: watch::Receiver<Slot<T>>,
}

impl<T: Clone> FlightWaiter<T> {
    /// 等待所有者的结果；所有者未完成就被丢弃时返回 `None`。
    pub async fn wait(mut self) -> Option<Result<T, ImageError>> {
        loop {
            let current = self.receiver.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
            if self.receiver.changed().await.is_err() {
                return self.receiver.borrow().clone();
            }
        }
    }
}
