//! 守护进程配置
//!
//! JSON 文件，所有字段都有默认值，可只写需要覆盖的部分：
//!
//! ```json
//! {
//!   "dir": "/data/botlog",
//!   "channels": { "imu": { "capacity": 4096, "policy": { "kind": "drop_oldest" } } },
//!   "rotation": { "max_bytes": 268435456 }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::AdmissionPolicy;
use crate::error::{Error, Result};
use crate::record::RecordType;
use crate::retry::RetryPolicy;

/// 单个通道的缓冲配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub capacity: usize,
    pub policy: AdmissionPolicy,
}

impl ChannelConfig {
    pub fn default_for(record_type: RecordType) -> Self {
        Self {
            capacity: record_type.default_capacity(),
            policy: AdmissionPolicy::default_for(record_type),
        }
    }
}

/// 段轮转阈值，任一达到即轮转
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub max_bytes: u64,
    pub max_age_ms: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1 << 30,
            max_age_ms: 300_000,
        }
    }
}

impl RotationConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

/// 刷盘节奏：每 N 条或每 T 毫秒，先到为准
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    pub every_records: u64,
    pub interval_ms: u64,
    /// 单次 flush 超过该耗时记一次超时
    pub budget_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            every_records: 64,
            interval_ms: 100,
            budget_ms: 50,
        }
    }
}

impl FlushConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoRetryConfig {
    pub attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for IoRetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 500,
        }
    }
}

impl IoRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.attempts, Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
    }
}

/// 守护进程配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// 日志目录
    pub dir: PathBuf,
    /// 未列出的类型使用默认配置
    pub channels: BTreeMap<RecordType, ChannelConfig>,
    /// 时间戳相同时的写入顺序，排在前面的先写
    pub priority: Vec<RecordType>,
    pub rotation: RotationConfig,
    pub flush: FlushConfig,
    pub io_retry: IoRetryConfig,
    pub shutdown_timeout_ms: u64,
    /// 所有通道为空时调度器的休眠间隔
    pub poll_interval_us: u64,
}

/// 默认优先级：控制 > 状态 > 电池 > 图像 > IMU
pub const DEFAULT_PRIORITY: [RecordType; RecordType::COUNT] = [
    RecordType::DriveCtrl,
    RecordType::DriveState,
    RecordType::DriveStatus,
    RecordType::StereoFrame,
    RecordType::Imu,
];

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./botlog"),
            channels: RecordType::ALL
                .iter()
                .map(|&rt| (rt, ChannelConfig::default_for(rt)))
                .collect(),
            priority: DEFAULT_PRIORITY.to_vec(),
            rotation: RotationConfig::default(),
            flush: FlushConfig::default(),
            io_retry: IoRetryConfig::default(),
            shutdown_timeout_ms: 5_000,
            poll_interval_us: 500,
        }
    }
}

impl DaemonConfig {
    /// 使用指定目录的默认配置
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// 从 JSON 文件加载并校验
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn channel(&self, record_type: RecordType) -> ChannelConfig {
        self.channels
            .get(&record_type)
            .copied()
            .unwrap_or_else(|| ChannelConfig::default_for(record_type))
    }

    /// 类型在优先级表中的排名，越小越先写
    pub fn priority_rank(&self, record_type: RecordType) -> usize {
        self.priority
            .iter()
            .position(|&rt| rt == record_type)
            .unwrap_or(RecordType::COUNT)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn validate(&self) -> Result<()> {
        for rt in RecordType::ALL {
            if self.channel(rt).capacity == 0 {
                return Err(Error::Config(format!("{rt} capacity must be positive")));
            }
        }
        if self.rotation.max_bytes == 0 {
            return Err(Error::Config("rotation.max_bytes must be positive".into()));
        }
        if self.priority.len() != RecordType::COUNT
            || RecordType::ALL
                .iter()
                .any(|rt| !self.priority.contains(rt))
        {
            return Err(Error::Config(format!(
                "priority must list every record type exactly once, got {:?}",
                self.priority
            )));
        }
        if self.io_retry.attempts == 0 {
            return Err(Error::Config("io_retry.attempts must be at least 1".into()));
        }
        Ok(())
    }
}
