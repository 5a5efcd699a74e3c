//! 错误类型

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::record::RecordType;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

/// botlog 错误
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// 负载长度与记录类型不匹配
    #[error("{record_type} payload must be {expected} bytes, got {actual}")]
    PayloadSize {
        record_type: RecordType,
        expected: usize,
        actual: usize,
    },

    #[error("timestamp must be finite, got {0}")]
    InvalidTimestamp(f64),

    /// 序列号回退，内部不变量被破坏
    #[error("sequence regression: last appended {last}, got {got}")]
    SequenceRegression { last: u64, got: u64 },

    /// 存储层重试耗尽
    #[error("storage exhausted after {attempts} attempts: {source}")]
    StorageExhausted {
        attempts: usize,
        #[source]
        source: io::Error,
    },

    #[error("segment {0} has no valid footer")]
    IncompleteSegment(PathBuf),

    #[error("corrupt segment {path}: {reason}")]
    CorruptSegment { path: PathBuf, reason: String },

    #[error("{got} record submitted to {expected} channel")]
    WrongChannel {
        expected: RecordType,
        got: RecordType,
    },

    #[error("producer for {0} already taken")]
    ProducerTaken(RecordType),

    #[error("dispatcher already started")]
    AlreadyStarted,

    #[error("dispatcher thread panicked")]
    DispatcherPanicked,
}

impl Error {
    /// 是否为致命错误（守护进程无法继续写入）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::StorageExhausted { .. } | Error::SequenceRegression { .. } | Error::Io(_)
        )
    }
}
