//! 通道缓冲与准入策略
//!
//! 每种记录类型一个有界无锁队列，一个生产者、一个消费者（调度器）。
//! 队列满时由准入策略决定丢弃哪一条，生产者线程最多等待一个有界时间。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Error, Result};
use crate::record::{Record, RecordType, Sample};

/// 前若干次重试只让出 CPU，之后短睡眠
const BLOCK_SPIN_ROUNDS: u32 = 16;
const BLOCK_SLEEP: Duration = Duration::from_micros(50);

/// 缓冲区满时的准入策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// 拒绝新记录，保留缓冲区内容
    DropNewest,
    /// 淘汰最旧的记录以接纳新记录
    DropOldest,
    /// 最多等待 timeout_ms，超时后拒绝新记录
    BlockWithTimeout { timeout_ms: u64 },
}

impl AdmissionPolicy {
    /// 各类型的默认策略
    ///
    /// 图像帧大而低频，保留已缓冲的帧；控制/状态/IMU 小而高频，保留最新样本。
    pub fn default_for(record_type: RecordType) -> Self {
        match record_type {
            RecordType::StereoFrame => AdmissionPolicy::DropNewest,
            RecordType::DriveCtrl | RecordType::DriveState | RecordType::Imu => {
                AdmissionPolicy::DropOldest
            }
            RecordType::DriveStatus => AdmissionPolicy::BlockWithTimeout { timeout_ms: 5 },
        }
    }
}

/// push 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// 新记录已接纳，同时淘汰了一条最旧的记录
    AcceptedEvictedOldest,
    DroppedNewest,
    /// 阻塞等待超时后被拒绝
    DroppedTimeout,
}

impl Admission {
    pub fn is_accepted(self) -> bool {
        matches!(self, Admission::Accepted | Admission::AcceptedEvictedOldest)
    }
}

/// 通道计数器
#[derive(Debug, Default)]
pub struct ChannelCounters {
    accepted: AtomicU64,
    dropped_oldest: AtomicU64,
    dropped_newest: AtomicU64,
    timeout_drops: AtomicU64,
    popped: AtomicU64,
}

/// 通道状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    pub record_type: RecordType,
    pub policy: AdmissionPolicy,
    pub capacity: usize,
    pub len: usize,
    pub accepted: u64,
    pub dropped_oldest: u64,
    pub dropped_newest: u64,
    pub timeout_drops: u64,
    pub popped: u64,
}

impl ChannelSnapshot {
    pub fn total_drops(&self) -> u64 {
        self.dropped_oldest + self.dropped_newest + self.timeout_drops
    }

    pub fn drops(&self) -> DropCounts {
        DropCounts {
            dropped_oldest: self.dropped_oldest,
            dropped_newest: self.dropped_newest,
            timeout_drops: self.timeout_drops,
        }
    }
}

/// 单一类型的丢弃计数，随段尾落盘
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    pub dropped_oldest: u64,
    pub dropped_newest: u64,
    pub timeout_drops: u64,
}

impl DropCounts {
    pub fn total(&self) -> u64 {
        self.dropped_oldest + self.dropped_newest + self.timeout_drops
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }

    /// 相对 base 的增量
    pub fn since(&self, base: &DropCounts) -> DropCounts {
        DropCounts {
            dropped_oldest: self.dropped_oldest.saturating_sub(base.dropped_oldest),
            dropped_newest: self.dropped_newest.saturating_sub(base.dropped_newest),
            timeout_drops: self.timeout_drops.saturating_sub(base.timeout_drops),
        }
    }

    pub fn add(&mut self, other: &DropCounts) {
        self.dropped_oldest += other.dropped_oldest;
        self.dropped_newest += other.dropped_newest;
        self.timeout_drops += other.timeout_drops;
    }
}

/// 单一记录类型的有界缓冲
#[derive(Debug)]
pub struct ChannelBuffer {
    record_type: RecordType,
    policy: AdmissionPolicy,
    queue: ArrayQueue<Record>,
    counters: ChannelCounters,
}

impl ChannelBuffer {
    pub fn new(record_type: RecordType, capacity: usize, policy: AdmissionPolicy) -> Self {
        Self {
            record_type,
            policy,
            queue: ArrayQueue::new(capacity.max(1)),
            counters: ChannelCounters::default(),
        }
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// 写入一条记录，满时按准入策略处理
    pub fn push(&self, record: Record) -> Admission {
        debug_assert_eq!(record.record_type(), self.record_type);
        match self.queue.push(record) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                Admission::Accepted
            }
            Err(record) => self.admit_when_full(record),
        }
    }

    fn admit_when_full(&self, record: Record) -> Admission {
        match self.policy {
            AdmissionPolicy::DropNewest => {
                self.counters.dropped_newest.fetch_add(1, Ordering::Relaxed);
                trace!("{}: buffer full, dropped newest", self.record_type);
                Admission::DroppedNewest
            }
            AdmissionPolicy::DropOldest => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                // 消费者可能恰好腾出了空位，此时没有淘汰
                match self.queue.force_push(record) {
                    Some(_evicted) => {
                        self.counters.dropped_oldest.fetch_add(1, Ordering::Relaxed);
                        trace!("{}: buffer full, evicted oldest", self.record_type);
                        Admission::AcceptedEvictedOldest
                    }
                    None => Admission::Accepted,
                }
            }
            AdmissionPolicy::BlockWithTimeout { timeout_ms } => {
                self.push_blocking(record, Duration::from_millis(timeout_ms))
            }
        }
    }

    fn push_blocking(&self, mut record: Record, timeout: Duration) -> Admission {
        let deadline = Instant::now() + timeout;
        let mut rounds = 0u32;
        loop {
            let now = Instant::now();
            if now >= deadline {
                self.counters.timeout_drops.fetch_add(1, Ordering::Relaxed);
                trace!(
                    "{}: buffer still full after {:?}, dropped",
                    self.record_type,
                    timeout
                );
                return Admission::DroppedTimeout;
            }
            if rounds < BLOCK_SPIN_ROUNDS {
                thread::yield_now();
            } else {
                thread::sleep(BLOCK_SLEEP.min(deadline - now));
            }
            rounds += 1;

            match self.queue.push(record) {
                Ok(()) => {
                    self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                    return Admission::Accepted;
                }
                Err(back) => record = back,
            }
        }
    }

    /// 取出最旧的一条记录，空时返回 None
    pub fn pop(&self) -> Option<Record> {
        let record = self.queue.pop();
        if record.is_some() {
            self.counters.popped.fetch_add(1, Ordering::Relaxed);
        }
        record
    }

    /// 自创建以来的累计丢弃数
    pub fn drops(&self) -> DropCounts {
        DropCounts {
            dropped_oldest: self.counters.dropped_oldest.load(Ordering::Relaxed),
            dropped_newest: self.counters.dropped_newest.load(Ordering::Relaxed),
            timeout_drops: self.counters.timeout_drops.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            record_type: self.record_type,
            policy: self.policy,
            capacity: self.capacity(),
            len: self.len(),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            dropped_oldest: self.counters.dropped_oldest.load(Ordering::Relaxed),
            dropped_newest: self.counters.dropped_newest.load(Ordering::Relaxed),
            timeout_drops: self.counters.timeout_drops.load(Ordering::Relaxed),
            popped: self.counters.popped.load(Ordering::Relaxed),
        }
    }
}

/// 生产者句柄
///
/// 不可克隆，每个通道只会发出一个，保证单生产者。
#[derive(Debug)]
pub struct Producer {
    channel: Arc<ChannelBuffer>,
}

impl Producer {
    pub(crate) fn new(channel: Arc<ChannelBuffer>) -> Self {
        Self { channel }
    }

    pub fn record_type(&self) -> RecordType {
        self.channel.record_type()
    }

    /// 提交紧凑布局的负载
    ///
    /// 只有负载长度或时间戳非法时返回错误；缓冲区满不是错误，由返回的
    /// [`Admission`] 表示。
    pub fn submit(&self, payload: Vec<u8>, timestamp: f64) -> Result<Admission> {
        let record = Record::new(self.channel.record_type(), payload, timestamp)?;
        Ok(self.channel.push(record))
    }

    pub fn submit_record(&self, record: Record) -> Result<Admission> {
        if record.record_type() != self.channel.record_type() {
            return Err(Error::WrongChannel {
                expected: self.channel.record_type(),
                got: record.record_type(),
            });
        }
        Ok(self.channel.push(record))
    }

    pub fn submit_sample<S: Sample>(&self, sample: &S) -> Result<Admission> {
        self.submit_record(sample.to_record()?)
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        self.channel.snapshot()
    }
}
