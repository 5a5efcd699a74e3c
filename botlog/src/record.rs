//! 记录目录
//!
//! 五种遥测记录的固定二进制布局。所有结构体均为紧凑布局（无填充），
//! 多字节字段小端序，末尾携带生产者写入的 `timestamp: f64`：
//!
//! ```text
//! tag  类型          布局                                          负载大小
//! 0    StereoFrame   stereo: u8[720][2560][3], timestamp: f64        5529608
//! 1    DriveCtrl     yaw: f32, twist: f32[2], timestamp: f64              20
//! 2    DriveState    pos/vel/torque: f32[2] x3, timestamp: f64            32
//! 3    DriveStatus   voltage: f32, timestamp: f64                         12
//! 4    Imu           gyro: f32[3], accel: f32[6], timestamp: f64          44
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 双目图像高度
pub const STEREO_HEIGHT: usize = 720;
/// 双目图像宽度（左右拼接）
pub const STEREO_WIDTH: usize = 2560;
/// 每像素通道数
pub const STEREO_CHANNELS: usize = 3;
/// 双目图像像素字节数
pub const STEREO_IMAGE_SIZE: usize = STEREO_HEIGHT * STEREO_WIDTH * STEREO_CHANNELS;

const TIMESTAMP_SIZE: usize = 8;

/// 记录类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    StereoFrame,
    DriveCtrl,
    DriveState,
    DriveStatus,
    Imu,
}

impl RecordType {
    /// 类型数量
    pub const COUNT: usize = 5;

    /// 按 tag 顺序排列的全部类型
    pub const ALL: [RecordType; RecordType::COUNT] = [
        RecordType::StereoFrame,
        RecordType::DriveCtrl,
        RecordType::DriveState,
        RecordType::DriveStatus,
        RecordType::Imu,
    ];

    /// 磁盘上的类型标记
    pub const fn tag(self) -> u8 {
        match self {
            RecordType::StereoFrame => 0,
            RecordType::DriveCtrl => 1,
            RecordType::DriveState => 2,
            RecordType::DriveStatus => 3,
            RecordType::Imu => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    /// 按 tag 排列的数组下标
    pub const fn index(self) -> usize {
        self.tag() as usize
    }

    /// 固定负载大小，读者仅凭 tag 即可计算
    pub const fn payload_size(self) -> usize {
        match self {
            RecordType::StereoFrame => STEREO_IMAGE_SIZE + TIMESTAMP_SIZE,
            RecordType::DriveCtrl => 3 * 4 + TIMESTAMP_SIZE,
            RecordType::DriveState => 6 * 4 + TIMESTAMP_SIZE,
            RecordType::DriveStatus => 4 + TIMESTAMP_SIZE,
            RecordType::Imu => 9 * 4 + TIMESTAMP_SIZE,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            RecordType::StereoFrame => "stereo_frame",
            RecordType::DriveCtrl => "drive_ctrl",
            RecordType::DriveState => "drive_state",
            RecordType::DriveStatus => "drive_status",
            RecordType::Imu => "imu",
        }
    }

    /// 生产者的标称发布周期
    pub const fn nominal_period(self) -> Duration {
        match self {
            RecordType::StereoFrame => Duration::from_millis(50),
            RecordType::DriveCtrl => Duration::from_millis(30),
            RecordType::DriveState => Duration::from_millis(20),
            RecordType::DriveStatus => Duration::from_millis(1000),
            RecordType::Imu => Duration::from_millis(10),
        }
    }

    /// 默认缓冲深度：图像帧体积大，只留几帧；小而高频的通道留深一些
    pub const fn default_capacity(self) -> usize {
        match self {
            RecordType::StereoFrame => 3,
            RecordType::DriveCtrl => 256,
            RecordType::DriveState => 256,
            RecordType::DriveStatus => 16,
            RecordType::Imu => 1024,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 一条带时间戳的固定布局记录
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    record_type: RecordType,
    timestamp: f64,
    payload: Vec<u8>,
}

impl Record {
    /// 创建记录，校验负载长度与时间戳
    pub fn new(record_type: RecordType, payload: Vec<u8>, timestamp: f64) -> Result<Self> {
        if payload.len() != record_type.payload_size() {
            return Err(Error::PayloadSize {
                record_type,
                expected: record_type.payload_size(),
                actual: payload.len(),
            });
        }
        if !timestamp.is_finite() {
            return Err(Error::InvalidTimestamp(timestamp));
        }
        Ok(Self {
            record_type,
            timestamp,
            payload,
        })
    }

    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    /// 时间戳（秒）
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// 可转换为 [`Record`] 的类型化样本
pub trait Sample: Sized {
    const RECORD_TYPE: RecordType;

    fn timestamp(&self) -> f64;

    /// 序列化为紧凑布局
    fn to_bytes(&self) -> Vec<u8>;

    /// 从紧凑布局解析，长度不符返回 None
    fn from_bytes(buf: &[u8]) -> Option<Self>;

    fn to_record(&self) -> Result<Record> {
        Record::new(Self::RECORD_TYPE, self.to_bytes(), self.timestamp())
    }

    fn from_record(record: &Record) -> Option<Self> {
        if record.record_type() != Self::RECORD_TYPE {
            return None;
        }
        Self::from_bytes(record.payload())
    }
}

fn put_f32s(buf: &mut Vec<u8>, values: &[f32]) {
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

fn f32_at(buf: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn f32s_at<const N: usize>(buf: &[u8], offset: usize) -> [f32; N] {
    let mut out = [0f32; N];
    for (i, v) in out.iter_mut().enumerate() {
        *v = f32_at(buf, offset + i * 4);
    }
    out
}

pub(crate) fn f64_at(buf: &[u8], offset: usize) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    f64::from_le_bytes(raw)
}

/// 双目相机帧 (OV9281)
#[derive(Debug, Clone, PartialEq)]
pub struct StereoFrame {
    /// 行优先 [720][2560][3]
    pub stereo: Vec<u8>,
    pub timestamp: f64,
}

impl StereoFrame {
    /// 全零图像
    pub fn blank(timestamp: f64) -> Self {
        Self {
            stereo: vec![0u8; STEREO_IMAGE_SIZE],
            timestamp,
        }
    }
}

impl Sample for StereoFrame {
    const RECORD_TYPE: RecordType = RecordType::StereoFrame;

    fn timestamp(&self) -> f64 {
        self.timestamp
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::RECORD_TYPE.payload_size());
        buf.extend_from_slice(&self.stereo);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::RECORD_TYPE.payload_size() {
            return None;
        }
        Some(Self {
            stereo: buf[..STEREO_IMAGE_SIZE].to_vec(),
            timestamp: f64_at(buf, STEREO_IMAGE_SIZE),
        })
    }
}

/// 底盘控制指令
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DriveCtrl {
    pub yaw: f32,
    /// 线速度, 角速度
    pub twist: [f32; 2],
    pub timestamp: f64,
}

impl Sample for DriveCtrl {
    const RECORD_TYPE: RecordType = RecordType::DriveCtrl;

    fn timestamp(&self) -> f64 {
        self.timestamp
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::RECORD_TYPE.payload_size());
        put_f32s(&mut buf, &[self.yaw]);
        put_f32s(&mut buf, &self.twist);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::RECORD_TYPE.payload_size() {
            return None;
        }
        Some(Self {
            yaw: f32_at(buf, 0),
            twist: f32s_at(buf, 4),
            timestamp: f64_at(buf, 12),
        })
    }
}

/// 底盘电机反馈
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DriveState {
    pub pos: [f32; 2],
    pub vel: [f32; 2],
    pub torque: [f32; 2],
    pub timestamp: f64,
}

impl Sample for DriveState {
    const RECORD_TYPE: RecordType = RecordType::DriveState;

    fn timestamp(&self) -> f64 {
        self.timestamp
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::RECORD_TYPE.payload_size());
        put_f32s(&mut buf, &self.pos);
        put_f32s(&mut buf, &self.vel);
        put_f32s(&mut buf, &self.torque);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::RECORD_TYPE.payload_size() {
            return None;
        }
        Some(Self {
            pos: f32s_at(buf, 0),
            vel: f32s_at(buf, 8),
            torque: f32s_at(buf, 16),
            timestamp: f64_at(buf, 24),
        })
    }
}

/// 底盘状态（电池电压）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DriveStatus {
    pub voltage: f32,
    pub timestamp: f64,
}

impl Sample for DriveStatus {
    const RECORD_TYPE: RecordType = RecordType::DriveStatus;

    fn timestamp(&self) -> f64 {
        self.timestamp
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::RECORD_TYPE.payload_size());
        put_f32s(&mut buf, &[self.voltage]);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::RECORD_TYPE.payload_size() {
            return None;
        }
        Some(Self {
            voltage: f32_at(buf, 0),
            timestamp: f64_at(buf, 4),
        })
    }
}

/// IMU 采样
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Imu {
    pub gyro: [f32; 3],
    pub accel: [f32; 6],
    pub timestamp: f64,
}

impl Sample for Imu {
    const RECORD_TYPE: RecordType = RecordType::Imu;

    fn timestamp(&self) -> f64 {
        self.timestamp
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::RECORD_TYPE.payload_size());
        put_f32s(&mut buf, &self.gyro);
        put_f32s(&mut buf, &self.accel);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::RECORD_TYPE.payload_size() {
            return None;
        }
        Some(Self {
            gyro: f32s_at(buf, 0),
            accel: f32s_at(buf, 12),
            timestamp: f64_at(buf, 36),
        })
    }
}
