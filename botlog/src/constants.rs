//! 常量定义
//!
//! 分段日志文件格式的魔数、尺寸和标记定义。所有多字节字段均为小端序。

/// 段文件头魔数 ("BLOG")
pub const SEGMENT_MAGIC: u32 = 0x474F_4C42;
/// 格式版本号 (2: 段尾带丢弃计数)
pub const FORMAT_VERSION: u16 = 2;
/// 段文件头大小
pub const SEGMENT_HEADER_SIZE: u64 = 32;

/// 帧头大小 (Tag + Len + Timestamp + Seq)
pub const FRAME_HEADER_SIZE: usize = 1 + 4 + 8 + 8;

/// 段尾魔数 ("BLGF")
pub const FOOTER_MAGIC: u32 = 0x4647_4C42;
/// 段尾结束标记 ("BEND")
pub const FOOTER_END_MAGIC: u32 = 0x444E_4542;
/// 段尾大小
pub const FOOTER_SIZE: u64 = 208;
/// 段尾中参与 CRC 计算的字节数
pub const FOOTER_CRC_SPAN: usize = 200;
/// 段尾中丢弃计数区的起始偏移，每类型 3 个 u64
pub const FOOTER_DROPS_OFFSET: usize = 80;

/// 段尾标志位:
/// ```text
///   bit 0: 启动时被截断恢复过
///   bit 1: 关闭超时，缓冲区未排空
/// ```
pub const FOOTER_FLAG_RECOVERED: u32 = 0x01;
pub const FOOTER_FLAG_PARTIAL_SHUTDOWN: u32 = 0x02;

/// 恢复标记帧
pub const TAG_RECOVERY_MARKER: u8 = 0xF0;
/// 关闭超时标记帧
pub const TAG_SHUTDOWN_MARKER: u8 = 0xF1;
/// 标记帧负载大小 (两个 u64)
pub const MARKER_PAYLOAD_SIZE: usize = 16;

/// 段文件扩展名
pub const SEGMENT_EXTENSION: &str = "blog";
