#![allow(dead_code)]

use crossbeam_channel::Receiver;
use myy_input::core::{
    EsCategory, EsFormat, EventBus, Frame, InputConfig, InputError, InputEvent, InputState, Packet, Result, Tick,
    TitleInfo,
};
use myy_input::player::{
    Capabilities, Codec, CodecFactory, DecoderContext, Demux, DemuxStatus, EsOut, InputResources, MuxFactory,
    MuxOutput, ResourceBroker, Sink, SinkFactory, SinkKind, Source, SourceOpener, StatsCounters, TrackHandle,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const FRAME: Tick = 40_000;

/// 用这个编码的视频轨道在码流里带有第一路隐藏字幕
pub const CC_VIDEO_CODEC: &str = "mp2v";

// ========== 渲染端 ==========

#[derive(Default)]
pub struct SinkLog {
    pub frames: AtomicUsize,
    pub flushes: AtomicUsize,
}

struct RecordingSink {
    kind: SinkKind,
    log: Arc<SinkLog>,
}

impl Sink for RecordingSink {
    fn kind(&self) -> SinkKind {
        self.kind
    }

    fn is_compatible(&self, _fmt: &EsFormat) -> bool {
        true
    }

    fn render(&mut self, _frame: Frame, _deadline: Tick, _rate: i32) {
        self.log.frames.fetch_add(1, Ordering::SeqCst);
    }

    fn flush(&mut self) {
        self.log.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct RecordingSinks {
    pub log: Arc<SinkLog>,
}

impl SinkFactory for RecordingSinks {
    fn create(&self, kind: SinkKind, _fmt: &EsFormat) -> Result<Box<dyn Sink>> {
        Ok(Box::new(RecordingSink {
            kind,
            log: self.log.clone(),
        }))
    }
}

// ========== 输出复用器 ==========

#[derive(Default)]
pub struct MuxLog {
    pub targets: Mutex<Vec<String>>,
    pub packets: AtomicUsize,
    pub tracks: AtomicUsize,
}

struct RecordingMux {
    target: String,
    log: Arc<MuxLog>,
    can_pace: bool,
}

impl MuxOutput for RecordingMux {
    fn target(&self) -> &str {
        &self.target
    }

    fn add_track(&mut self, _fmt: &EsFormat) -> Result<usize> {
        Ok(self.log.tracks.fetch_add(1, Ordering::SeqCst))
    }

    fn del_track(&mut self, _track: usize) {}

    fn send(&mut self, _track: usize, _packet: Packet) -> Result<()> {
        self.log.packets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn can_pace_control(&self) -> bool {
        self.can_pace
    }
}

pub struct RecordingMuxes {
    pub log: Arc<MuxLog>,
    pub can_pace: bool,
}

impl MuxFactory for RecordingMuxes {
    fn create(&self, target: &str) -> Result<Box<dyn MuxOutput>> {
        self.log.targets.lock().push(target.to_string());
        Ok(Box::new(RecordingMux {
            target: target.to_string(),
            log: self.log.clone(),
            can_pace: self.can_pace,
        }))
    }
}

// ========== 解码 ==========

struct PassthroughCodec {
    category: EsCategory,
    captions: bool,
}

impl Codec for PassthroughCodec {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>> {
        Ok(vec![Frame {
            category: self.category,
            pts: packet.date().unwrap_or(0),
            duration: packet.duration,
            data: Vec::new(),
        }])
    }

    fn cc_present(&self) -> [bool; 4] {
        [self.captions, false, false, false]
    }
}

pub struct PassthroughCodecs;

impl CodecFactory for PassthroughCodecs {
    fn create(&self, fmt: &EsFormat) -> Result<Box<dyn Codec>> {
        Ok(Box::new(PassthroughCodec {
            category: fmt.category,
            captions: fmt.codec == CC_VIDEO_CODEC,
        }))
    }
}

// ========== 解复用 ==========

/// 解复用器收到的调用记录
#[derive(Default)]
pub struct DemuxCalls {
    pub demux_calls: AtomicUsize,
    pub eof_count: AtomicUsize,
    pub errors: AtomicUsize,
    pub set_time: Mutex<Vec<Tick>>,
    pub set_position: Mutex<Vec<f64>>,
    pub pause: Mutex<Vec<bool>>,
    pub titles: Mutex<Vec<usize>>,
    pub seekpoints: Mutex<Vec<usize>>,
}

/// 注入的读取故障
#[derive(Clone, Default)]
pub struct Faults {
    /// 读到这个时间后每次 demux 都返回硬错误
    pub fail_at: Option<Tick>,
    /// 前几次 demux 返回 `Again`
    pub transient: usize,
    /// 支持 set_next_demux_time（从属源走按时间读取的路径）
    pub next_demux_time: bool,
}

/// 合成解复用器的参数
#[derive(Clone)]
pub struct DemuxScript {
    pub tracks: Vec<EsFormat>,
    pub length: Tick,
    pub caps: Capabilities,
    /// 不支持按时间跳转（退化为按比例）
    pub no_set_time: bool,
    pub titles: Option<Vec<TitleInfo>>,
    pub faults: Faults,
}

impl DemuxScript {
    pub fn av(length: Tick) -> Self {
        Self {
            tracks: vec![
                EsFormat::new(EsCategory::Video, "h264").with_id(1).with_video(640, 360),
                EsFormat::new(EsCategory::Audio, "mp4a").with_id(2).with_audio(48_000, 2),
            ],
            length,
            caps: Capabilities {
                can_pause: true,
                can_pace_control: false,
                can_rate_control: false,
                can_seek: true,
            },
            no_set_time: false,
            titles: None,
            faults: Faults::default(),
        }
    }

    pub fn paced(mut self) -> Self {
        self.caps.can_pace_control = true;
        self
    }

    pub fn with_caps(mut self, caps: Capabilities) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_track(mut self, fmt: EsFormat) -> Self {
        self.tracks.push(fmt);
        self
    }

    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }
}

pub struct ScriptedDemux {
    script: DemuxScript,
    handles: Vec<TrackHandle>,
    time: Tick,
    calls: Arc<DemuxCalls>,
    title: usize,
    seekpoint: usize,
    transient_left: usize,
}

impl ScriptedDemux {
    pub fn open(script: DemuxScript, calls: Arc<DemuxCalls>, out: &EsOut) -> Result<Self> {
        let mut handles = Vec::new();
        for fmt in &script.tracks {
            handles.push(out.add(fmt)?);
        }
        Ok(Self {
            transient_left: script.faults.transient,
            script,
            handles,
            time: 0,
            calls,
            title: 0,
            seekpoint: 0,
        })
    }
}

impl Demux for ScriptedDemux {
    fn demux(&mut self, out: &EsOut) -> Result<DemuxStatus> {
        self.calls.demux_calls.fetch_add(1, Ordering::SeqCst);
        if self.transient_left > 0 {
            self.transient_left -= 1;
            self.calls.errors.fetch_add(1, Ordering::SeqCst);
            return Err(InputError::Again);
        }
        if self.script.faults.fail_at.map_or(false, |at| self.time >= at) {
            self.calls.errors.fetch_add(1, Ordering::SeqCst);
            return Err(InputError::DemuxError(format!("坏数据 @{}ms", self.time / 1000)));
        }
        if self.time >= self.script.length {
            self.calls.eof_count.fetch_add(1, Ordering::SeqCst);
            return Ok(DemuxStatus::Eof);
        }
        out.set_pcr(self.time)?;
        for handle in &self.handles {
            let mut packet = Packet::new(vec![0u8; 64], Some(self.time), Some(self.time));
            packet.duration = FRAME;
            out.send(*handle, packet)?;
        }
        self.time += FRAME;
        Ok(DemuxStatus::More)
    }

    fn capabilities(&self) -> Capabilities {
        self.script.caps
    }

    fn position(&self) -> Option<f64> {
        Some(self.time as f64 / self.script.length.max(1) as f64)
    }

    fn time(&self) -> Option<Tick> {
        Some(self.time)
    }

    fn length(&self) -> Option<Tick> {
        Some(self.script.length)
    }

    fn titles(&self) -> Option<Vec<TitleInfo>> {
        self.script.titles.clone()
    }

    fn nav(&self) -> myy_input::core::NavState {
        myy_input::core::NavState {
            title: self.title,
            seekpoint: self.seekpoint,
        }
    }

    fn set_position(&mut self, position: f64) -> Result<()> {
        self.calls.set_position.lock().push(position);
        self.time = (self.script.length as f64 * position) as Tick;
        Ok(())
    }

    fn set_time(&mut self, time: Tick) -> Result<()> {
        if self.script.no_set_time {
            return Err(InputError::Unsupported("set_time"));
        }
        self.calls.set_time.lock().push(time);
        self.time = time.clamp(0, self.script.length);
        Ok(())
    }

    fn set_title(&mut self, title: usize) -> Result<()> {
        self.calls.titles.lock().push(title);
        self.title = title;
        self.seekpoint = 0;
        Ok(())
    }

    fn set_seekpoint(&mut self, seekpoint: usize) -> Result<()> {
        self.calls.seekpoints.lock().push(seekpoint);
        self.seekpoint = seekpoint;
        Ok(())
    }

    fn set_pause_state(&mut self, paused: bool) -> Result<()> {
        self.calls.pause.lock().push(paused);
        Ok(())
    }

    fn set_next_demux_time(&mut self, _time: Tick) -> Result<()> {
        if self.script.faults.next_demux_time {
            Ok(())
        } else {
            Err(InputError::Unsupported("set_next_demux_time"))
        }
    }
}

/// 按位置打开合成源：`fail://` 打开失败，字幕提示或字幕扩展名打开字幕源
///
/// 字幕源记录在 `subtitle_calls` 上，按 `subtitle_faults` 注入故障
pub struct ScriptedOpener {
    pub script: DemuxScript,
    pub calls: Arc<DemuxCalls>,
    pub subtitle_calls: Arc<DemuxCalls>,
    pub subtitle_faults: Faults,
    pub opened: Mutex<Vec<String>>,
    next_sub_id: AtomicUsize,
}

impl ScriptedOpener {
    pub fn new(script: DemuxScript) -> Arc<Self> {
        Self::with_subtitle_faults(script, Faults::default())
    }

    pub fn with_subtitle_faults(script: DemuxScript, subtitle_faults: Faults) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: Arc::new(DemuxCalls::default()),
            subtitle_calls: Arc::new(DemuxCalls::default()),
            subtitle_faults,
            opened: Mutex::new(Vec::new()),
            next_sub_id: AtomicUsize::new(100),
        })
    }
}

impl SourceOpener for ScriptedOpener {
    fn open(&self, location: &str, hint: Option<&str>, out: &EsOut) -> Result<Source> {
        self.opened.lock().push(location.to_string());
        if location.starts_with("fail://") {
            return Err(InputError::OpenError(location.to_string()));
        }

        let is_subtitle = hint == Some("subtitle")
            || [".srt", ".sub", ".idx"].iter().any(|ext| location.ends_with(ext));
        let (script, calls) = if is_subtitle {
            let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst) as i32;
            let script = DemuxScript {
                tracks: vec![EsFormat::new(EsCategory::Subtitle, "subt").with_id(id)],
                titles: None,
                no_set_time: false,
                faults: self.subtitle_faults.clone(),
                ..self.script.clone()
            };
            (script, self.subtitle_calls.clone())
        } else {
            (self.script.clone(), self.calls.clone())
        };
        let demux = ScriptedDemux::open(script, calls, out)?;
        Ok(Source::new(location, Box::new(demux)))
    }
}

// ========== 组装 ==========

pub struct Harness {
    pub resources: InputResources,
    pub sinks: Arc<SinkLog>,
    pub muxes: Arc<MuxLog>,
}

pub fn harness(opener: Arc<dyn SourceOpener>) -> Harness {
    harness_with_mux_pace(opener, true)
}

/// 测试日志：用 RUST_LOG 打开
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn harness_with_mux_pace(opener: Arc<dyn SourceOpener>, mux_can_pace: bool) -> Harness {
    init_logging();
    let sinks = Arc::new(SinkLog::default());
    let muxes = Arc::new(MuxLog::default());
    let broker = Arc::new(ResourceBroker::new(
        Arc::new(RecordingSinks { log: sinks.clone() }),
        Some(Arc::new(RecordingMuxes {
            log: muxes.clone(),
            can_pace: mux_can_pace,
        })),
    ));
    Harness {
        resources: InputResources {
            opener,
            codecs: Arc::new(PassthroughCodecs),
            broker,
        },
        sinks,
        muxes,
    }
}

/// 直接驱动 es_out 的测试环境
pub struct EsOutFixture {
    pub es_out: EsOut,
    pub events: Receiver<InputEvent>,
    pub broker: Arc<ResourceBroker>,
    pub die: Arc<AtomicBool>,
}

impl Drop for EsOutFixture {
    fn drop(&mut self) {
        self.es_out.shutdown();
    }
}

pub fn es_out_fixture(config: &InputConfig) -> EsOutFixture {
    init_logging();
    let sinks = Arc::new(SinkLog::default());
    let broker = Arc::new(ResourceBroker::new(Arc::new(RecordingSinks { log: sinks }), None));
    let die = Arc::new(AtomicBool::new(false));
    let ctx = DecoderContext {
        codecs: Arc::new(PassthroughCodecs),
        broker: broker.clone(),
        die: die.clone(),
        stats: Arc::new(StatsCounters::default()),
    };
    let bus = EventBus::new();
    let events = bus.subscribe();
    let es_out = EsOut::new(config, ctx, bus);
    es_out.set_active(true);
    EsOutFixture {
        es_out,
        events,
        broker,
        die,
    }
}

// ========== 事件等待 ==========

/// 等待满足条件的事件，超时返回 None
pub fn wait_event<F>(rx: &Receiver<InputEvent>, timeout: Duration, mut pred: F) -> Option<InputEvent>
where
    F: FnMut(&InputEvent) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.checked_duration_since(Instant::now())?;
        match rx.recv_timeout(left) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
}

pub fn wait_state(rx: &Receiver<InputEvent>, state: InputState, timeout: Duration) -> bool {
    wait_event(rx, timeout, |e| *e == InputEvent::State(state)).is_some()
}

/// 收集到目前为止的全部事件
pub fn drain(rx: &Receiver<InputEvent>) -> Vec<InputEvent> {
    rx.try_iter().collect()
}

/// 轮询直到条件成立
pub fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}
