//! 播放器输入引擎
//!
//! - `core`：时间、格式、状态、配置、错误与事件
//! - `player`：输入线程、轨道路由（es_out）、解码宿主与资源中转站

pub mod core;
pub mod player;

pub use crate::core::{InputConfig, InputError, InputEvent, InputSnapshot, InputState, Result};
pub use crate::player::{InputResources, InputThread};
