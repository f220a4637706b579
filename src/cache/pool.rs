//! # 像素缓冲复用池
//!
//! 释放后的 RGBA 缓冲回到这里，解码阶段优先从池中取用，减少大块内存反复分配。
//! 池本身按字节预算限界，超出预算时丢弃最早回收的缓冲。

use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug)]
pub struct BitmapPool {
    max_bytes: u64,
    inner: Mutex<PoolInner>,
}

#[derive(Debug, Default)]
struct PoolInner {
    buffers: VecDeque<Vec<u8>>,
    bytes: u64,
}

impl BitmapPool {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// 取一块长度恰为 `len`、内容清零的缓冲。
    pub fn take(&self, len: usize) -> Vec<u8> {
        let reused = {
            let mut inner = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let best = inner
                .buffers
                .iter()
                .enumerate()
                .filter(|(_, buf)| buf.capacity() >= len)
                .min_by_key(|(_, buf)| buf.capacity())
                .map(|(idx, _)| idx);

            best.and_then(|idx| inner.buffers.remove(idx)).inspect(|buf| {
                inner.bytes = inner.bytes.saturating_sub(buf.capacity() as u64);
            })
        };

        match reused {
            Some(mut buf) => {
                buf.clear();
                buf.resize(len, 0);
                buf
            }
            None => vec![0; len],
        }
    }

    /// 归还缓冲。超过预算的单块缓冲直接丢弃。
    pub fn recycle(&self, buf: Vec<u8>) {
        let cost = buf.capacity() as u64;
        if cost == 0 || cost > self.max_bytes {
            return;
        }

        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while inner.bytes + cost > self.max_bytes {
            match inner.buffers.pop_front() {
                Some(old) => inner.bytes = inner.bytes.saturating_sub(old.capacity() as u64),
                None => break,
            }
        }
        inner.bytes += cost;
        inner.buffers.push_back(buf);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.buffers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> u64 {
        self.inner.lock().map(|inner| inner.bytes).unwrap_or(0)
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}
