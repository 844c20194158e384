use crate::core::{EsCategory, EsFormat, Frame, InputError, Packet, Result, Tick};
use crate::player::log_ctx;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// 渲染端类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    Audio,
    Video,
}

impl SinkKind {
    /// 字幕画在视频输出上，没有独立的渲染端
    pub fn for_category(category: EsCategory) -> Option<Self> {
        match category {
            EsCategory::Audio => Some(SinkKind::Audio),
            EsCategory::Video => Some(SinkKind::Video),
            _ => None,
        }
    }
}

/// 渲染端（音频输出/视频输出）
pub trait Sink: Send {
    fn kind(&self) -> SinkKind;

    /// 能否直接用于新格式（不兼容时需要重建）
    fn is_compatible(&self, fmt: &EsFormat) -> bool;

    /// 在 deadline（系统时间）呈现一帧
    fn render(&mut self, frame: Frame, deadline: Tick, rate: i32);

    /// 丢弃已排队但未呈现的内容
    fn flush(&mut self);

    fn description(&self) -> String {
        format!("{:?} sink", self.kind())
    }
}

/// 渲染端工厂（设备模块）
pub trait SinkFactory: Send + Sync {
    fn create(&self, kind: SinkKind, fmt: &EsFormat) -> Result<Box<dyn Sink>>;
}

/// 输出复用器（串流或录制）
pub trait MuxOutput: Send {
    fn target(&self) -> &str;

    fn add_track(&mut self, fmt: &EsFormat) -> Result<usize>;

    fn del_track(&mut self, track: usize);

    fn send(&mut self, track: usize, packet: Packet) -> Result<()>;

    /// 输出端是否接受输入按播放节奏送数据（false 表示尽快送）
    fn can_pace_control(&self) -> bool {
        true
    }
}

pub trait MuxFactory: Send + Sync {
    fn create(&self, target: &str) -> Result<Box<dyn MuxOutput>>;
}

pub type SharedSink = Arc<Mutex<Box<dyn Sink>>>;
pub type SharedMux = Arc<Mutex<Box<dyn MuxOutput>>>;

struct BrokerState {
    /// 每类最多缓存一个空闲渲染端
    free_audio: Option<SharedSink>,
    free_video: Option<SharedSink>,
    /// 空闲的输出复用器
    mux: Option<SharedMux>,
}

impl BrokerState {
    fn free_slot(&mut self, kind: SinkKind) -> &mut Option<SharedSink> {
        match kind {
            SinkKind::Audio => &mut self.free_audio,
            SinkKind::Video => &mut self.free_video,
        }
    }
}

/// 资源中转站
///
/// 负责在轨道/节目切换之间保留与复用昂贵的渲染端与输出复用器。
/// `state` 锁保护空闲缓存；`held` 是更细粒度的锁，只保护“已借出”的列表，
/// 外部枚举（UI 等）不会阻塞送包路径。
pub struct ResourceBroker {
    state: Mutex<BrokerState>,
    held: Mutex<Vec<(SinkKind, SharedSink)>>,
    sinks: Arc<dyn SinkFactory>,
    muxes: Option<Arc<dyn MuxFactory>>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl ResourceBroker {
    pub fn new(sinks: Arc<dyn SinkFactory>, muxes: Option<Arc<dyn MuxFactory>>) -> Self {
        Self {
            state: Mutex::new(BrokerState {
                free_audio: None,
                free_video: None,
                mux: None,
            }),
            held: Mutex::new(Vec::new()),
            sinks,
            muxes,
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        }
    }

    /// 请求/归还渲染端
    ///
    /// - existing 与 fmt 都为空：销毁所有空闲缓存
    /// - 给出 fmt：复用 existing 或空闲缓存（兼容时），否则新建
    /// - 只给 existing：归还
    pub fn request_sink(&self, existing: Option<SharedSink>, fmt: Option<&EsFormat>) -> Result<Option<SharedSink>> {
        match (existing, fmt) {
            (None, None) => {
                let mut state = self.state.lock();
                for kind in [SinkKind::Audio, SinkKind::Video] {
                    if let Some(sink) = state.free_slot(kind).take() {
                        self.destroy(sink);
                    }
                }
                Ok(None)
            }
            (existing, Some(fmt)) => self.acquire(existing, fmt).map(Some),
            (Some(existing), None) => {
                self.release(existing, true);
                Ok(None)
            }
        }
    }

    fn acquire(&self, existing: Option<SharedSink>, fmt: &EsFormat) -> Result<SharedSink> {
        let kind = SinkKind::for_category(fmt.category)
            .ok_or_else(|| InputError::ResourceError(format!("{} 没有渲染端", fmt.category)))?;

        let mut state = self.state.lock();
        let candidate = match existing {
            Some(sink) => {
                self.remove_held(&sink);
                Some(sink)
            }
            None => state.free_slot(kind).take(),
        };

        let sink = match candidate {
            Some(sink) if sink.lock().is_compatible(fmt) => {
                debug!("{} ♻️ 复用 {:?} 渲染端", log_ctx(), kind);
                sink
            }
            Some(sink) => {
                // 不兼容的先放回缓存槽，槽已占用才销毁
                let slot = state.free_slot(kind);
                if slot.is_none() {
                    sink.lock().flush();
                    *slot = Some(sink);
                } else {
                    self.destroy(sink);
                }
                self.create(kind, fmt)?
            }
            None => self.create(kind, fmt)?,
        };

        self.held.lock().push((kind, sink.clone()));
        Ok(sink)
    }

    /// 归还渲染端：缓存槽空、同类没有其它在用实例且允许回收时缓存，否则销毁
    pub fn release(&self, sink: SharedSink, recycle: bool) {
        let mut state = self.state.lock();
        let Some(kind) = self.remove_held(&sink) else {
            warn!("{} ⚠️ 归还了未借出的渲染端", log_ctx());
            return;
        };
        let others_active = self.held.lock().iter().any(|(k, _)| *k == kind);
        let slot = state.free_slot(kind);
        if slot.is_some() || others_active || !recycle {
            self.destroy(sink);
        } else {
            sink.lock().flush();
            debug!("{} 📦 缓存空闲 {:?} 渲染端", log_ctx(), kind);
            *slot = Some(sink);
        }
    }

    fn create(&self, kind: SinkKind, fmt: &EsFormat) -> Result<SharedSink> {
        let sink = self.sinks.create(kind, fmt)?;
        self.created.fetch_add(1, Ordering::SeqCst);
        info!("{} 🖥️ 创建渲染端: {}", log_ctx(), sink.description());
        Ok(Arc::new(Mutex::new(sink)))
    }

    fn destroy(&self, sink: SharedSink) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        debug!("{} 🗑️ 销毁渲染端", log_ctx());
        // 外部快照仍持有时由最后一个持有者释放
        drop(sink);
    }

    fn remove_held(&self, sink: &SharedSink) -> Option<SinkKind> {
        let mut held = self.held.lock();
        let index = held.iter().position(|(_, s)| Arc::ptr_eq(s, sink))?;
        Some(held.remove(index).0)
    }

    /// 当前借出的全部渲染端快照
    pub fn hold_all(&self) -> Vec<SharedSink> {
        self.held.lock().iter().map(|(_, s)| s.clone()).collect()
    }

    /// 某类第一个借出的渲染端
    pub fn hold_first(&self, kind: SinkKind) -> Option<SharedSink> {
        self.held
            .lock()
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, s)| s.clone())
    }

    /// 销毁某类的空闲缓存
    pub fn terminate(&self, kind: SinkKind) {
        let mut state = self.state.lock();
        if let Some(sink) = state.free_slot(kind).take() {
            self.destroy(sink);
        }
    }

    /// 销毁所有空闲缓存（渲染端与输出复用器）
    pub fn terminate_all(&self) {
        let _ = self.request_sink(None, None);
        let _ = self.request_mux_output(None, None);
    }

    /// 请求/归还输出复用器，规则同渲染端；目标不同的缓存实例会被销毁
    pub fn request_mux_output(&self, existing: Option<SharedMux>, target: Option<&str>) -> Result<Option<SharedMux>> {
        let mut state = self.state.lock();

        if existing.is_none() && target.is_none() {
            if state.mux.take().is_some() {
                debug!("{} 🗑️ 销毁空闲输出复用器", log_ctx());
            }
            return Ok(None);
        }

        if let Some(existing) = existing {
            if state.mux.replace(existing).is_some() {
                debug!("{} 🗑️ 替换空闲输出复用器", log_ctx());
            }
        }

        let Some(target) = target else {
            return Ok(None);
        };

        let mismatch = state
            .mux
            .as_ref()
            .map(|m| m.lock().target() != target)
            .unwrap_or(false);
        if mismatch {
            state.mux = None;
        }

        if let Some(mux) = state.mux.take() {
            debug!("{} ♻️ 复用输出复用器: {}", log_ctx(), target);
            return Ok(Some(mux));
        }

        let factory = self
            .muxes
            .as_ref()
            .ok_or_else(|| InputError::ResourceError("没有可用的输出复用器".to_string()))?;
        let mux = factory.create(target)?;
        info!("{} 📡 创建输出复用器: {}", log_ctx(), target);
        Ok(Some(Arc::new(Mutex::new(mux))))
    }

    /// 新建一个不经缓存的输出复用器（录制用）
    pub fn create_mux_output(&self, target: &str) -> Result<SharedMux> {
        let factory = self
            .muxes
            .as_ref()
            .ok_or_else(|| InputError::ResourceError("没有可用的输出复用器".to_string()))?;
        let mux = factory.create(target)?;
        info!("{} 🔴 创建录制输出: {}", log_ctx(), target);
        Ok(Arc::new(Mutex::new(mux)))
    }

    pub fn has_mux_factory(&self) -> bool {
        self.muxes.is_some()
    }

    pub fn has_cached(&self, kind: SinkKind) -> bool {
        self.state.lock().free_slot(kind).is_some()
    }

    pub fn has_cached_mux(&self) -> bool {
        self.state.lock().mux.is_some()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// 借出的渲染端；离开作用域时自动归还给资源中转站
pub struct SinkLease {
    sink: Option<SharedSink>,
    broker: Arc<ResourceBroker>,
}

impl SinkLease {
    pub fn acquire(broker: &Arc<ResourceBroker>, fmt: &EsFormat) -> Result<Self> {
        let sink = broker.acquire(None, fmt)?;
        Ok(Self {
            sink: Some(sink),
            broker: broker.clone(),
        })
    }

    pub fn sink(&self) -> Option<&SharedSink> {
        self.sink.as_ref()
    }

    /// 格式变化后重新申请（兼容时保持同一实例）
    ///
    /// 新实例申请失败时保留原来的渲染端并返回错误
    pub fn reconfigure(&mut self, fmt: &EsFormat) -> Result<()> {
        let Some(current) = self.sink.clone() else {
            self.sink = Some(self.broker.acquire(None, fmt)?);
            return Ok(());
        };
        if current.lock().is_compatible(fmt) {
            return Ok(());
        }
        let sink = self.broker.acquire(None, fmt)?;
        self.sink = Some(sink);
        self.broker.release(current, true);
        Ok(())
    }
}

impl Drop for SinkLease {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            self.broker.release(sink, true);
        }
    }
}
