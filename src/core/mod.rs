// 核心数据结构和类型定义

pub mod types;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;

pub use types::*;
pub use clock::{now, ClockState, Converted, ProgramClock};
pub use config::InputConfig;
pub use error::*;
pub use event::{EventBus, InputEvent};
