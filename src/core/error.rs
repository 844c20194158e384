use thiserror::Error;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("配置解析错误: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("无法打开输入: {0}")]
    OpenError(String),

    /// 暂时没有数据（EAGAIN/被中断），下一轮重试
    #[error("暂时无数据")]
    Again,

    #[error("解复用错误: {0}")]
    DemuxError(String),

    #[error("解码错误: {0}")]
    DecodeError(String),

    #[error("不支持的操作: {0}")]
    Unsupported(&'static str),

    #[error("无效的 PCR: {0}")]
    InvalidPcr(i64),

    #[error("无效的节目: {0}")]
    InvalidGroup(i32),

    #[error("未知轨道: {0}")]
    UnknownTrack(String),

    #[error("节目 {0} 仍有轨道，无法删除")]
    ProgramBusy(i32),

    #[error("时钟尚无参考点")]
    NoReference,

    #[error("时间戳超出可接受范围")]
    TooLate,

    #[error("资源错误: {0}")]
    ResourceError(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("其他错误: {0}")]
    Other(String),
}

impl InputError {
    /// 是否属于可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, InputError::Again)
    }
}

pub type Result<T> = std::result::Result<T, InputError>;
