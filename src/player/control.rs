use crate::core::{InputState, Tick};
use crate::player::log_ctx;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::mem::{discriminant, Discriminant};
use std::time::Instant;

/// 控制队列容量，超出时丢弃新请求（Die 除外）
pub const CONTROL_QUEUE_MAX: usize = 100;

/// 输入线程的控制请求
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    Die,
    SetState(InputState),
    SetRate(i32),
    RateSlower,
    RateFaster,
    SetPosition(f64),
    SetPositionOffset(f64),
    SetTime(Tick),
    SetTimeOffset(Tick),
    SetProgram(i32),
    SetEs(i32),
    SetAudioDelay(Tick),
    SetSpuDelay(Tick),
    SetTitle(usize),
    TitleNext,
    TitlePrev,
    SetSeekpoint(usize),
    SeekpointNext,
    SeekpointPrev,
    AddSlave(String),
    AddSubtitle { path: String, forced: bool },
    SetRecord(bool),
    SetFrameNext,
}

impl ControlRequest {
    fn kind(&self) -> Discriminant<Self> {
        discriminant(self)
    }

    /// 相邻的同类请求只需执行最后一个
    fn is_reducible(&self) -> bool {
        matches!(
            self,
            ControlRequest::SetState(_)
                | ControlRequest::SetRate(_)
                | ControlRequest::SetPosition(_)
                | ControlRequest::SetTime(_)
                | ControlRequest::SetProgram(_)
                | ControlRequest::SetTitle(_)
                | ControlRequest::SetSeekpoint(_)
        )
    }

    /// 是否会改变播放位置
    pub fn is_seek(&self) -> bool {
        matches!(
            self,
            ControlRequest::SetPosition(_)
                | ControlRequest::SetPositionOffset(_)
                | ControlRequest::SetTime(_)
                | ControlRequest::SetTimeOffset(_)
                | ControlRequest::SetTitle(_)
                | ControlRequest::TitleNext
                | ControlRequest::TitlePrev
                | ControlRequest::SetSeekpoint(_)
                | ControlRequest::SeekpointNext
                | ControlRequest::SeekpointPrev
        )
    }
}

/// 控制请求队列
///
/// 任意线程提交，输入线程单独消费；提交会唤醒正在等待的输入线程
#[derive(Default)]
pub struct ControlQueue {
    queue: Mutex<VecDeque<ControlRequest>>,
    cond: Condvar,
}

impl ControlQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 提交请求，队列已满时丢弃并返回 false
    pub fn push(&self, request: ControlRequest) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= CONTROL_QUEUE_MAX && request != ControlRequest::Die {
            warn!("{} ⚠️ 控制队列已满，丢弃请求: {:?}", log_ctx(), request);
            return false;
        }
        queue.push_back(request);
        self.cond.notify_one();
        true
    }

    /// 合并相邻的同类请求（保留后一个）
    pub fn reduce(&self) {
        let mut queue = self.queue.lock();
        let mut i = 1;
        while i < queue.len() {
            let previous = &queue[i - 1];
            let current = &queue[i];
            if previous.kind() == current.kind() && current.is_reducible() {
                debug!("{} 🔀 合并控制请求: {:?}", log_ctx(), current);
                queue.remove(i - 1);
            } else {
                i += 1;
            }
        }
    }

    /// 取出一个请求；队列为空时最多等到 deadline（None 表示不等待）
    pub fn pop(&self, deadline: Option<Instant>) -> Option<ControlRequest> {
        let mut queue = self.queue.lock();
        if let Some(deadline) = deadline {
            while queue.is_empty() {
                if self.cond.wait_until(&mut queue, deadline).timed_out() {
                    break;
                }
            }
        }
        queue.pop_front()
    }

    /// 唤醒等待中的消费者
    pub fn wake(&self) {
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// 清空队列（输入线程结束时）
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let n = queue.len();
        queue.clear();
        n
    }
}
