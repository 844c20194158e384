use crate::core::{EsCategory, EsFormat, Frame, InputError, Packet, ProgramClock, Result, Tick, CLOCK_FREQ};
use crate::player::log_ctx;
use crate::player::resource::{ResourceBroker, SharedMux, SinkKind, SinkLease};
use crate::player::stats::StatsCounters;
use crossbeam::queue::SegQueue;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// 可控节奏时解码队列的目标长度，超过后送包方等待（背压）
pub const DECODER_QUEUE_MAX: usize = 256;

/// 解码队列的硬上限，超过后丢包
const DECODER_QUEUE_HARD_MAX: usize = 4096;

/// 时间戳超前当前时间这么多就视为异常并丢弃
const DECODER_BOGUS_DELAY: Tick = 30 * 300_000;

/// 不连续之后连续出错这么多次进入跳过窗口
const DECODER_ERROR_LIMIT: u32 = 3;
const DECODER_SKIP_WINDOW: Tick = CLOCK_FREQ / 2;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// 解码模块（外部协作者）
pub trait Codec: Send {
    /// 解码一个数据包，可能输出零到多帧
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>>;

    fn flush(&mut self) {}

    /// 输出格式发生变化时返回一次新格式
    fn format_changed(&mut self) -> Option<EsFormat> {
        None
    }

    /// 码流中出现的隐藏字幕通道
    fn cc_present(&self) -> [bool; 4] {
        [false; 4]
    }

    /// 取出某个隐藏字幕通道已解出的字幕帧
    fn take_cc(&mut self, _channel: usize) -> Vec<Frame> {
        Vec::new()
    }
}

pub trait CodecFactory: Send + Sync {
    fn create(&self, fmt: &EsFormat) -> Result<Box<dyn Codec>>;
}

/// 解码结果的去向
#[derive(Clone)]
pub enum DecoderOutput {
    /// 解码后交给渲染端
    Render,
    /// 不解码，直接送入输出复用器（串流/录制）
    Mux(SharedMux),
}

/// 创建解码器所需的共享对象
#[derive(Clone)]
pub struct DecoderContext {
    pub codecs: Arc<dyn CodecFactory>,
    pub broker: Arc<ResourceBroker>,
    pub die: Arc<AtomicBool>,
    pub stats: Arc<StatsCounters>,
}

enum DecoderMessage {
    Packet(Packet),
    Flush,
    Wakeup,
}

/// 与解码线程共享的控制状态
struct DecoderControl {
    exit: bool,
    paused: bool,
    buffering: bool,
    /// 缓冲期间是否已经有帧就绪
    buffering_full: bool,
    delay: Tick,
    frame_step: u32,
    last_duration: Tick,
    cc_state: [bool; 4],
    cc_present: [bool; 4],
    format_changed: Option<EsFormat>,
    /// seek 时递增，用于丢弃旧数据
    generation: u64,
}

struct DecoderShared {
    control: Mutex<DecoderControl>,
    cond: Condvar,
    /// 缓冲期间暂存的帧
    held: SegQueue<Frame>,
    /// 队列中与正在处理的包数
    pending: AtomicUsize,
    generation: AtomicU64,
}

/// 单个轨道的解码器宿主
///
/// 拥有独立线程，从队列中按到达顺序取包解码，
/// 经节目时钟换算后交给渲染端（或直接送入输出复用器）
pub struct DecoderHost {
    fmt: EsFormat,
    tx: Option<Sender<DecoderMessage>>,
    /// 保留一份接收端用于 seek 时清空队列
    drain_rx: Receiver<DecoderMessage>,
    shared: Arc<DecoderShared>,
    die: Arc<AtomicBool>,
    stats: Arc<StatsCounters>,
    thread_handle: Option<JoinHandle<()>>,
}

impl DecoderHost {
    pub fn spawn(fmt: &EsFormat, clock: Arc<ProgramClock>, output: DecoderOutput, ctx: &DecoderContext) -> Result<Self> {
        let sink = match &output {
            DecoderOutput::Render => WorkerSink::Render {
                codec: ctx.codecs.create(fmt)?,
                lease: None,
                broker: ctx.broker.clone(),
                lease_failed: false,
            },
            DecoderOutput::Mux(mux) => {
                let track = mux.lock().add_track(fmt)?;
                WorkerSink::Mux { mux: mux.clone(), track }
            }
        };

        let (tx, rx) = unbounded::<DecoderMessage>();
        let shared = Arc::new(DecoderShared {
            control: Mutex::new(DecoderControl {
                exit: false,
                paused: false,
                buffering: false,
                buffering_full: false,
                delay: 0,
                frame_step: 0,
                last_duration: 0,
                cc_state: [false; 4],
                cc_present: [false; 4],
                format_changed: None,
                generation: 0,
            }),
            cond: Condvar::new(),
            held: SegQueue::new(),
            pending: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        });

        let worker = DecoderWorker {
            fmt: fmt.clone(),
            clock,
            sink,
            shared: shared.clone(),
            die: ctx.die.clone(),
            stats: ctx.stats.clone(),
            errors_since_discontinuity: None,
            skip_until: None,
        };

        let drain_rx = rx.clone();
        let thread_handle = thread::Builder::new()
            .name(format!("decoder-{}", fmt.codec))
            .spawn(move || worker.run(rx))?;

        info!("{} 🎬 解码器启动: {} ({})", log_ctx(), fmt.codec, fmt.category);

        Ok(Self {
            fmt: fmt.clone(),
            tx: Some(tx),
            drain_rx,
            shared,
            die: ctx.die.clone(),
            stats: ctx.stats.clone(),
            thread_handle: Some(thread_handle),
        })
    }

    pub fn format(&self) -> &EsFormat {
        &self.fmt
    }

    /// 送入一个数据包
    ///
    /// 可控节奏且不在缓冲时，队列超过 `DECODER_QUEUE_MAX` 就等待解码线程消费；
    /// 缓冲期间解码线程不消费，不能等待。超过硬上限的包直接丢弃。
    pub fn decode(&self, packet: Packet, pace_controlled: bool) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };

        if pace_controlled {
            let mut c = self.shared.control.lock();
            while !c.buffering
                && !c.paused
                && !c.exit
                && !self.die.load(Ordering::SeqCst)
                && self.shared.pending.load(Ordering::SeqCst) >= DECODER_QUEUE_MAX
            {
                self.shared.cond.wait_for(&mut c, POLL_INTERVAL);
            }
        }

        if self.shared.pending.load(Ordering::SeqCst) >= DECODER_QUEUE_HARD_MAX {
            self.count_lost();
            debug!("{} 🗑️ 解码队列已满，丢弃数据包 ({})", log_ctx(), self.fmt.codec);
            return;
        }

        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(DecoderMessage::Packet(packet)).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("{} ⚠️ 解码线程已退出，丢弃数据包 ({})", log_ctx(), self.fmt.codec);
        }
    }

    fn count_lost(&self) {
        match self.fmt.category {
            EsCategory::Audio => StatsCounters::bump(&self.stats.lost_abuffers),
            EsCategory::Video => StatsCounters::bump(&self.stats.lost_pictures),
            _ => {}
        }
    }

    /// 队列已空且没有暂存帧
    pub fn is_empty(&self) -> bool {
        self.shared.pending.load(Ordering::SeqCst) == 0 && self.shared.held.is_empty()
    }

    /// 取出（一次）解码器报告的新格式
    pub fn format_changed(&self) -> Option<EsFormat> {
        self.shared.control.lock().format_changed.take()
    }

    pub fn cc_present(&self) -> [bool; 4] {
        self.shared.control.lock().cc_present
    }

    pub fn set_cc_state(&self, channel: usize, enabled: bool) -> Result<()> {
        if channel >= 4 {
            return Err(InputError::UnknownTrack(format!("cc{}", channel + 1)));
        }
        let mut c = self.shared.control.lock();
        c.cc_state[channel] = enabled;
        Ok(())
    }

    pub fn cc_state(&self, channel: usize) -> bool {
        channel < 4 && self.shared.control.lock().cc_state[channel]
    }

    /// 进入缓冲：清空队列与暂存帧，之后解出的帧先暂存
    pub fn start_buffering(&self) {
        let mut drained = 0usize;
        while let Ok(message) = self.drain_rx.try_recv() {
            if let DecoderMessage::Packet(_) = message {
                drained += 1;
            }
        }
        self.shared.pending.fetch_sub(drained, Ordering::SeqCst);

        {
            let mut c = self.shared.control.lock();
            c.buffering = true;
            c.buffering_full = false;
            c.generation += 1;
            self.shared.generation.store(c.generation, Ordering::SeqCst);
            while self.shared.held.pop().is_some() {}
        }
        self.shared.cond.notify_all();
        self.send_control(DecoderMessage::Flush);
        debug!("{} ⏳ 解码器开始缓冲 ({}), 清空 {} 个包", log_ctx(), self.fmt.codec, drained);
    }

    /// 结束缓冲，暂存帧交给渲染端
    pub fn stop_buffering(&self) {
        {
            let mut c = self.shared.control.lock();
            c.buffering = false;
        }
        self.shared.cond.notify_all();
        self.send_control(DecoderMessage::Wakeup);
    }

    /// 等待缓冲出第一帧；队列已空或退出时直接返回
    pub fn wait_buffering(&self) {
        let mut c = self.shared.control.lock();
        while c.buffering
            && !c.buffering_full
            && !c.exit
            && !self.die.load(Ordering::SeqCst)
            && self.shared.pending.load(Ordering::SeqCst) > 0
        {
            self.shared.cond.wait_for(&mut c, POLL_INTERVAL);
        }
    }

    pub fn is_buffering(&self) -> bool {
        self.shared.control.lock().buffering
    }

    pub fn change_pause(&self, paused: bool, _date: Tick) {
        self.shared.control.lock().paused = paused;
        self.shared.cond.notify_all();
    }

    pub fn change_delay(&self, delay: Tick) {
        self.shared.control.lock().delay = delay;
    }

    /// 暂停时放行一帧，返回上一帧的时长
    pub fn frame_next(&self) -> Tick {
        let duration = {
            let mut c = self.shared.control.lock();
            c.frame_step += 1;
            c.last_duration
        };
        self.shared.cond.notify_all();
        duration
    }

    fn send_control(&self, message: DecoderMessage) {
        if let Some(tx) = self.tx.as_ref() {
            if tx.send(message).is_err() {
                warn!("{} ⚠️ 解码线程已退出，控制消息未送达 ({})", log_ctx(), self.fmt.codec);
            }
        }
    }
}

impl Drop for DecoderHost {
    fn drop(&mut self) {
        {
            let mut c = self.shared.control.lock();
            c.exit = true;
        }
        self.shared.cond.notify_all();
        // 关闭发送端让线程退出
        self.tx.take();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("{} ❌ 解码线程异常退出 ({})", log_ctx(), self.fmt.codec);
            }
        }
        debug!("{} ⏹ 解码器已销毁: {}", log_ctx(), self.fmt.codec);
    }
}

enum WorkerSink {
    Render {
        codec: Box<dyn Codec>,
        lease: Option<SinkLease>,
        broker: Arc<ResourceBroker>,
        lease_failed: bool,
    },
    Mux {
        mux: SharedMux,
        track: usize,
    },
}

/// 解码线程内部状态
struct DecoderWorker {
    fmt: EsFormat,
    clock: Arc<ProgramClock>,
    sink: WorkerSink,
    shared: Arc<DecoderShared>,
    die: Arc<AtomicBool>,
    stats: Arc<StatsCounters>,
    /// 不连续之后的连续错误数，None 表示未处于不连续之后
    errors_since_discontinuity: Option<u32>,
    skip_until: Option<Tick>,
}

impl DecoderWorker {
    fn run(mut self, rx: Receiver<DecoderMessage>) {
        debug!("{} 🎬 解码线程启动: {}", log_ctx(), self.fmt.codec);

        loop {
            if self.die.load(Ordering::SeqCst) || self.shared.control.lock().exit {
                break;
            }

            self.drain_held();

            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(DecoderMessage::Packet(packet)) => {
                    self.process(packet);
                    self.shared.pending.fetch_sub(1, Ordering::SeqCst);
                    self.shared.cond.notify_all();
                }
                Ok(DecoderMessage::Flush) => self.flush(),
                Ok(DecoderMessage::Wakeup) => {}
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if let WorkerSink::Mux { mux, track } = &self.sink {
            mux.lock().del_track(*track);
        }
        debug!("{} 🎬 解码线程结束: {}", log_ctx(), self.fmt.codec);
    }

    fn process(&mut self, packet: Packet) {
        let generation = self.shared.generation.load(Ordering::SeqCst);

        if let WorkerSink::Mux { mux, track } = &self.sink {
            if let Err(e) = mux.lock().send(*track, packet) {
                warn!("{} ⚠️ 输出复用器拒绝数据包: {}", log_ctx(), e);
            }
            return;
        }

        if let Some(until) = self.skip_until {
            match packet.date() {
                Some(date) if date < until => {
                    self.count_lost();
                    return;
                }
                _ => self.skip_until = None,
            }
        }

        if packet.flags.discontinuity {
            self.errors_since_discontinuity = Some(0);
        }
        let preroll = packet.flags.preroll;

        let WorkerSink::Render { codec, .. } = &mut self.sink else {
            return;
        };
        let decoded = codec.decode(&packet);
        let new_format = codec.format_changed();
        let cc_present = codec.cc_present();
        let cc_enabled = {
            let mut c = self.shared.control.lock();
            c.cc_present = cc_present;
            c.cc_state
        };
        let mut cc_frames = Vec::new();
        for (channel, enabled) in cc_enabled.iter().enumerate() {
            if *enabled {
                cc_frames.extend(codec.take_cc(channel));
            }
        }

        if let Some(fmt) = new_format {
            info!("{} 🔄 解码输出格式变化: {}", log_ctx(), fmt.codec);
            if let WorkerSink::Render { lease: Some(lease), .. } = &mut self.sink {
                if let Err(e) = lease.reconfigure(&fmt) {
                    error!("{} ❌ 重新申请渲染端失败: {}", log_ctx(), e);
                }
            }
            self.shared.control.lock().format_changed = Some(fmt);
        }

        match decoded {
            Ok(frames) => {
                if self.errors_since_discontinuity.is_some() && !frames.is_empty() {
                    self.errors_since_discontinuity = None;
                }
                for frame in frames {
                    self.count_decoded();
                    self.output(frame, preroll, generation);
                }
            }
            Err(e) => {
                StatsCounters::bump(&self.stats.decode_errors);
                warn!("{} ⚠️ 解码失败 ({}): {}", log_ctx(), self.fmt.codec, e);
                if let Some(count) = self.errors_since_discontinuity.as_mut() {
                    *count += 1;
                    if *count >= DECODER_ERROR_LIMIT {
                        let from = packet.date().unwrap_or(0);
                        warn!("{} 🔇 连续 {} 次解码失败，跳过 {}ms", log_ctx(), count, DECODER_SKIP_WINDOW / 1000);
                        self.skip_until = Some(from + DECODER_SKIP_WINDOW);
                        self.errors_since_discontinuity = None;
                    }
                }
            }
        }

        for frame in cc_frames {
            self.output(frame, preroll, generation);
        }
    }

    fn count_decoded(&self) {
        match self.fmt.category {
            EsCategory::Video => StatsCounters::bump(&self.stats.decoded_video),
            EsCategory::Audio => StatsCounters::bump(&self.stats.decoded_audio),
            EsCategory::Subtitle => StatsCounters::bump(&self.stats.decoded_sub),
            EsCategory::Unknown => {}
        }
    }

    fn count_lost(&self) {
        match self.fmt.category {
            EsCategory::Audio => StatsCounters::bump(&self.stats.lost_abuffers),
            EsCategory::Video => StatsCounters::bump(&self.stats.lost_pictures),
            _ => {}
        }
    }

    /// 输出一帧：预滚动的丢弃，缓冲中的暂存
    ///
    /// 缓冲期间最多暂存一帧，解码线程随后阻塞到缓冲结束或 seek，
    /// 背压经由队列传回送包方。
    fn output(&mut self, frame: Frame, preroll: bool, generation: u64) {
        if preroll {
            return;
        }

        {
            let mut c = self.shared.control.lock();
            if c.buffering {
                if c.generation != generation {
                    return;
                }
                self.shared.held.push(frame);
                c.buffering_full = true;
                self.shared.cond.notify_all();
                while c.buffering && c.generation == generation && !c.exit && !self.die.load(Ordering::SeqCst) {
                    self.shared.cond.wait_for(&mut c, POLL_INTERVAL);
                }
                if c.buffering || c.generation != generation {
                    return;
                }
                drop(c);
                self.drain_held();
                return;
            }
        }

        // 先送出更早的暂存帧
        self.drain_held();
        self.present(frame, generation);
    }

    /// 暂停时等待（逐帧放行除外）后交给渲染端；被 seek 或退出打断返回 false
    fn present(&mut self, frame: Frame, generation: u64) -> bool {
        let delay = {
            let mut c = self.shared.control.lock();
            loop {
                if c.exit || self.die.load(Ordering::SeqCst) || c.generation != generation {
                    return false;
                }
                if !c.paused || c.frame_step > 0 {
                    break;
                }
                self.shared.cond.wait_for(&mut c, POLL_INTERVAL);
            }
            if c.frame_step > 0 {
                c.frame_step -= 1;
            }
            c.last_duration = frame.duration;
            c.delay
        };

        self.render(frame, delay);
        true
    }

    fn drain_held(&mut self) {
        if self.shared.held.is_empty() {
            return;
        }
        let generation = {
            let c = self.shared.control.lock();
            if c.buffering {
                return;
            }
            c.generation
        };
        while let Some(frame) = self.shared.held.pop() {
            if !self.present(frame, generation) {
                break;
            }
        }
    }

    fn render(&mut self, frame: Frame, delay: Tick) {
        let WorkerSink::Render {
            lease,
            broker,
            lease_failed,
            ..
        } = &mut self.sink
        else {
            return;
        };

        let converted = match self.clock.convert(frame.pts + delay, None, DECODER_BOGUS_DELAY) {
            Ok(c) => c,
            Err(e) => {
                debug!("{} ⏭️ 丢弃帧 pts={}ms: {}", log_ctx(), frame.pts / 1000, e);
                match self.fmt.category {
                    EsCategory::Audio => StatsCounters::bump(&self.stats.lost_abuffers),
                    EsCategory::Video => StatsCounters::bump(&self.stats.lost_pictures),
                    _ => {}
                }
                return;
            }
        };

        // 字幕与隐藏字幕画在当前的视频输出上
        let sink = if frame.category == EsCategory::Subtitle {
            broker.hold_first(SinkKind::Video)
        } else {
            if lease.is_none() && !*lease_failed {
                match SinkLease::acquire(broker, &self.fmt) {
                    Ok(l) => *lease = Some(l),
                    Err(e) => {
                        error!("{} ❌ 无法获取渲染端 ({}): {}", log_ctx(), self.fmt.codec, e);
                        *lease_failed = true;
                    }
                }
            }
            lease.as_ref().and_then(|l| l.sink().cloned())
        };

        let Some(sink) = sink else {
            return;
        };
        let category = frame.category;
        sink.lock().render(frame, converted.ts0, converted.rate);
        match category {
            EsCategory::Audio => StatsCounters::bump(&self.stats.played_abuffers),
            EsCategory::Video => StatsCounters::bump(&self.stats.displayed_pictures),
            _ => {}
        }
    }

    fn flush(&mut self) {
        if let WorkerSink::Render { codec, lease, .. } = &mut self.sink {
            codec.flush();
            if let Some(sink) = lease.as_ref().and_then(|l| l.sink()) {
                sink.lock().flush();
            }
        }
        self.errors_since_discontinuity = None;
        self.skip_until = None;
    }
}
