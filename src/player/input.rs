use crate::core::{
    now, EsCategory, EventBus, InputConfig, InputError, InputEvent, InputSnapshot, InputState, Meta, Mrl,
    NavState, ProgramInfo, Result, Tick, TitleInfo, TrackInfo, CLOCK_FREQ, RATE_DEFAULT, RATE_MAX, RATE_MIN,
};
use crate::player::control::{ControlQueue, ControlRequest};
use crate::player::decoder::{CodecFactory, DecoderContext};
use crate::player::es_out::{EsOut, EsOutControl, EsOutMode};
use crate::player::log_ctx;
use crate::player::resource::{ResourceBroker, SharedMux};
use crate::player::source::{DemuxStatus, Group, Source, SourceOpener, SourceUpdates};
use crate::player::stats::{StatsCounters, StatsSampler};
use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// 结束后等待退出时的轮询间隔
const INPUT_IDLE_SLEEP: Duration = Duration::from_millis(100);
/// 暂停时的轮询间隔
const PAUSED_SLEEP: Duration = Duration::from_millis(10);
/// 界面（位置/时间）更新间隔
const INTF_UPDATE_INTERVAL: Duration = Duration::from_millis(150);
/// 每隔多少次界面更新统计一次
const STATS_UPDATE_EVERY: u32 = 8;
/// 距章节起点不到这个时间时，“上一章节”跳到再前一章
const SEEKPOINT_PREV_THRESHOLD: Tick = 3 * CLOCK_FREQ;

/// 快慢速档位 (分子, 分母)，从最快到最慢
const RATE_FACTORS: [(i32, i32); 17] = [
    (1, 64),
    (1, 32),
    (1, 16),
    (1, 8),
    (1, 4),
    (1, 3),
    (1, 2),
    (2, 3),
    (1, 1),
    (3, 2),
    (2, 1),
    (3, 1),
    (4, 1),
    (8, 1),
    (16, 1),
    (32, 1),
    (64, 1),
];

/// 输入线程依赖的外部协作者
#[derive(Clone)]
pub struct InputResources {
    pub opener: Arc<dyn SourceOpener>,
    pub codecs: Arc<dyn CodecFactory>,
    pub broker: Arc<ResourceBroker>,
}

/// 输入线程句柄
///
/// 拥有一个控制线程：拉取解复用数据交给 es_out，处理控制请求，
/// 驱动结束/循环/从属源逻辑，并对外发布状态事件。
pub struct InputThread {
    queue: Arc<ControlQueue>,
    die: Arc<AtomicBool>,
    events: EventBus,
    snapshot: Arc<Mutex<InputSnapshot>>,
    es_out: EsOut,
    stats: Arc<StatsCounters>,
    worker: Option<InputWorker>,
    thread_handle: Option<JoinHandle<()>>,
}

impl InputThread {
    pub fn new(config: InputConfig, resources: InputResources) -> Result<Self> {
        config.validate()?;

        let die = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(StatsCounters::default());
        let events = EventBus::new();
        let queue = Arc::new(ControlQueue::new());
        let ctx = DecoderContext {
            codecs: resources.codecs.clone(),
            broker: resources.broker.clone(),
            die: die.clone(),
            stats: stats.clone(),
        };
        let es_out = EsOut::new(&config, ctx, events.clone());
        let snapshot = Arc::new(Mutex::new(InputSnapshot {
            rate: config.rate,
            ..Default::default()
        }));

        let worker = InputWorker::new(
            config,
            resources,
            queue.clone(),
            die.clone(),
            events.clone(),
            snapshot.clone(),
            es_out.clone(),
            stats.clone(),
        );

        Ok(Self {
            queue,
            die,
            events,
            snapshot,
            es_out,
            stats,
            worker: Some(worker),
            thread_handle: None,
        })
    }

    /// 启动输入线程
    pub fn start(&mut self) -> Result<()> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| InputError::Other("输入线程已经启动".to_string()))?;
        let handle = thread::Builder::new()
            .name("input".to_string())
            .spawn(move || worker.run())?;
        self.thread_handle = Some(handle);
        Ok(())
    }

    /// 提交控制请求（任意线程可调用）
    pub fn control(&self, request: ControlRequest) -> bool {
        self.queue.push(request)
    }

    /// 请求退出并等待线程结束
    pub fn stop(&mut self) {
        self.die.store(true, Ordering::SeqCst);
        self.queue.push(ControlRequest::Die);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("{} ❌ 输入线程异常退出", log_ctx());
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread_handle.as_ref().map_or(true, |h| h.is_finished())
    }

    pub fn subscribe(&self) -> Receiver<InputEvent> {
        self.events.subscribe()
    }

    pub fn es_out(&self) -> &EsOut {
        &self.es_out
    }

    // ========== 只读快照 ==========

    pub fn snapshot(&self) -> InputSnapshot {
        let mut snapshot = self.snapshot.lock().clone();
        snapshot.tracks = self.es_out.tracks();
        snapshot.programs = self.es_out.programs();
        snapshot.stats.demux_read_packets = self.stats.snapshot().demux_read_packets;
        snapshot
    }

    pub fn state(&self) -> InputState {
        self.snapshot.lock().state
    }

    pub fn position(&self) -> f64 {
        self.snapshot.lock().position
    }

    pub fn time(&self) -> Tick {
        self.snapshot.lock().time
    }

    pub fn length(&self) -> Tick {
        self.snapshot.lock().length
    }

    pub fn rate(&self) -> i32 {
        self.snapshot.lock().rate
    }

    pub fn tracks(&self) -> Vec<TrackInfo> {
        self.es_out.tracks()
    }

    pub fn programs(&self) -> Vec<ProgramInfo> {
        self.es_out.programs()
    }
}

impl Drop for InputThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 输入线程内部状态（只在输入线程中访问）
struct InputWorker {
    config: InputConfig,
    mrl: Mrl,
    resources: InputResources,
    queue: Arc<ControlQueue>,
    die: Arc<AtomicBool>,
    events: EventBus,
    snapshot: Arc<Mutex<InputSnapshot>>,
    es_out: EsOut,
    stats: Arc<StatsCounters>,
    sampler: StatsSampler,

    master: Option<Source>,
    slaves: Vec<Source>,
    output: Option<SharedMux>,

    state: InputState,
    published_state: Option<InputState>,
    error: bool,
    rate: i32,
    can_pause: bool,
    can_pace_control: bool,
    can_rate_control: bool,
    out_pace_control: bool,
    recording: bool,

    titles: Vec<TitleInfo>,
    nav: NavState,
    length: Tick,
    meta: Meta,

    start: Tick,
    stop: Tick,
    run: Tick,
    repeat: i32,
    run_start: Instant,
}

impl InputWorker {
    #[allow(clippy::too_many_arguments)]
    fn new(
        config: InputConfig,
        resources: InputResources,
        queue: Arc<ControlQueue>,
        die: Arc<AtomicBool>,
        events: EventBus,
        snapshot: Arc<Mutex<InputSnapshot>>,
        es_out: EsOut,
        stats: Arc<StatsCounters>,
    ) -> Self {
        let mrl = Mrl::parse(&config.mrl);
        Self {
            repeat: config.input_repeat,
            rate: config.rate,
            mrl,
            config,
            resources,
            queue,
            die,
            events,
            snapshot,
            es_out,
            stats,
            sampler: StatsSampler::new(),
            master: None,
            slaves: Vec::new(),
            output: None,
            state: InputState::Init,
            published_state: None,
            error: false,
            can_pause: false,
            can_pace_control: false,
            can_rate_control: false,
            out_pace_control: false,
            recording: false,
            titles: Vec::new(),
            nav: NavState::default(),
            length: 0,
            meta: Meta::default(),
            start: 0,
            stop: 0,
            run: 0,
            run_start: Instant::now(),
        }
    }

    fn is_dying(&self) -> bool {
        self.die.load(Ordering::SeqCst)
    }

    fn run(mut self) {
        info!("{} 🎬 输入线程启动: {}", log_ctx(), self.config.mrl);

        if let Err(e) = self.init() {
            error!("{} ❌ 打开输入失败: {}", log_ctx(), e);
            self.error = true;
            self.change_state(InputState::Error);
            self.wait_die();
            self.end();
            return;
        }

        self.main_loop();

        let master_eof = self.master.as_ref().map_or(false, |m| m.eof);
        if !self.error && master_eof {
            // 数据已读完，等待解码器播放完
            while !self.is_dying() {
                if self.es_out.is_empty() {
                    break;
                }
                debug!("{} ⏳ 等待解码队列清空", log_ctx());
                thread::sleep(INPUT_IDLE_SLEEP);
            }
            self.change_state(InputState::End);
        }

        if !self.is_dying() {
            self.wait_die();
        }
        self.end();
    }

    // ========== 初始化 ==========

    fn init(&mut self) -> Result<()> {
        self.change_state(InputState::Opening);
        self.es_out.set_active(false);
        self.es_out.set_mode(EsOutMode::None);

        if let Some(target) = self.config.sout.clone() {
            let mux = self
                .resources
                .broker
                .request_mux_output(None, Some(&target))?
                .ok_or_else(|| InputError::ResourceError(format!("无法创建输出: {}", target)))?;
            self.out_pace_control = !mux.lock().can_pace_control();
            self.es_out.set_stream_output(Some(mux.clone()));
            self.output = Some(mux);
        }

        let master = self
            .resources
            .opener
            .open(&self.mrl.location, None, &self.es_out)?;
        info!("{} 📂 已打开: {}", log_ctx(), master.location());
        self.init_title(&master);
        self.master = Some(master);

        if let Some(length) = self.master.as_ref().and_then(|m| m.demux.length()) {
            if length > 0 {
                self.length = length;
                self.events.publish(InputEvent::Length(length));
            }
        }

        self.start_title();
        self.load_subtitles();
        self.load_slaves();
        self.init_programs();
        self.init_meta();

        info!("{} ✅ 输入初始化完成: {}", log_ctx(), self.config.mrl);
        self.change_state(InputState::Playing);
        Ok(())
    }

    fn init_title(&mut self, master: &Source) {
        self.titles = master.titles().to_vec();
        if !self.titles.is_empty() {
            self.events.publish(InputEvent::Title(0));
        }

        let caps = master.capabilities();
        self.can_pace_control = caps.can_pace_control;
        self.can_pause = caps.can_pause;
        self.can_rate_control = caps.can_rate_control;

        let mut pts_delay = match master.pts_delay() {
            d if d > 0 => d,
            _ => self.config.pts_delay(),
        };
        // 音频需要提前时多缓冲一些
        if self.config.audio_desync_ms < 0 {
            pts_delay -= self.config.audio_desync_ms * 1000;
        }

        let mut cr_average = self.config.cr_average as i64;
        cr_average *= 10 * pts_delay / 200_000;
        cr_average /= 10;
        let cr_average = cr_average.max(10) as i32;

        debug!("{} ⏱️ pts_delay={}ms cr_average={}", log_ctx(), pts_delay / 1000, cr_average);
        self.es_out.set_pace_control(self.can_pace_control, self.out_pace_control);
        self.es_out.set_jitter(pts_delay, cr_average);

        let mut snapshot = self.snapshot.lock();
        snapshot.titles = self.titles.len();
        snapshot.can_pause = caps.can_pause;
        snapshot.can_seek = caps.can_seek;
    }

    fn start_title(&mut self) {
        if let Some(title) = self.mrl.title_start {
            if title > 0 && title < self.titles.len() {
                self.queue.push(ControlRequest::SetTitle(title));
            }
        }
        if let Some(chapter) = self.mrl.chapter_start {
            if chapter > 0 {
                self.queue.push(ControlRequest::SetSeekpoint(chapter));
            }
        }

        self.start = self.config.start();
        self.stop = self.config.stop();
        self.run = self.config.run();

        if self.run < 0 {
            warn!("{} ⚠️ 忽略无效的运行时长", log_ctx());
            self.run = 0;
        }
        if self.start > 0 && self.length > 0 && self.start >= self.length {
            warn!("{} ⚠️ 起始时间超出长度，忽略", log_ctx());
            self.start = 0;
        }
        if self.start > 0 {
            debug!("{} ⏩ 从 {}s 开始", log_ctx(), self.start / CLOCK_FREQ);
            self.queue.push(ControlRequest::SetTime(self.start));
        }
        if self.stop > 0 && self.stop <= self.start {
            warn!("{} ⚠️ 忽略无效的结束时间", log_ctx());
            self.stop = 0;
        }
        self.run_start = Instant::now();
    }

    fn load_subtitles(&mut self) {
        if let Some(path) = self.config.sub_file.clone() {
            self.add_subtitle(&path, true);
        }
    }

    fn load_slaves(&mut self) {
        for location in self.config.slave_list() {
            match self.resources.opener.open(&location, None, &self.es_out) {
                Ok(slave) => {
                    info!("{} 🔗 添加从属源: {}", log_ctx(), location);
                    self.slaves.push(slave);
                }
                Err(e) => warn!("{} ⚠️ 无法打开从属源 {}: {}", log_ctx(), location, e),
            }
        }
    }

    fn init_programs(&mut self) {
        self.es_out.set_active(true);

        let mode = if self.output.is_some() && self.config.sout_all {
            EsOutMode::All
        } else if self.output.is_some() && !self.config.programs.is_empty() {
            EsOutMode::Partial
        } else {
            EsOutMode::Auto
        };
        self.es_out.set_mode(mode);

        let group = match mode {
            EsOutMode::All => Group::All,
            EsOutMode::Partial => Group::List(self.config.programs.clone()),
            _ => Group::Id(self.config.program),
        };
        if let Some(master) = self.master.as_mut() {
            if let Err(e) = master.demux.set_group(&group) {
                debug!("{} 解复用器不支持节目选择: {}", log_ctx(), e);
            }
        }
    }

    fn init_meta(&mut self) {
        let mut meta = Meta {
            title: self.config.meta_title.clone(),
            artist: self.config.meta_artist.clone(),
            ..Default::default()
        };
        if let Some(master) = self.master.as_ref() {
            meta.merge(&master.meta());
        }
        for slave in &self.slaves {
            meta.merge(&slave.meta());
        }
        self.update_meta(meta);
    }

    fn update_meta(&mut self, meta: Meta) {
        if meta.is_empty() {
            return;
        }
        self.meta.merge(&meta);
        self.snapshot.lock().meta = self.meta.clone();
        self.events.publish(InputEvent::ItemMeta(self.meta.clone()));
    }

    // ========== 主循环 ==========

    fn main_loop(&mut self) {
        let mut last_intf = Instant::now();
        let mut intf_count: u32 = 0;

        while !self.is_dying() && !self.error && !self.master.as_ref().map_or(true, |m| m.eof) {
            let paused = self.state == InputState::Paused && !self.es_out.is_buffering();
            let mut force_update = false;
            let mut wakeup: Tick = 0;
            let mut idle = paused;

            if !paused {
                let (changed, retry) = self.demux_step();
                force_update |= changed;
                idle |= retry;
                wakeup = self.es_out.wakeup();
            }

            loop {
                let deadline = self.control_deadline(idle, wakeup);
                self.queue.reduce();
                while let Some(request) = self.queue.pop(deadline) {
                    if self.control(request) {
                        force_update = true;
                    }
                }
                self.refresh_state();

                if force_update || last_intf.elapsed() >= INTF_UPDATE_INTERVAL {
                    self.update_interface();
                    last_intf = Instant::now();
                    force_update = false;
                    intf_count += 1;
                    if intf_count % STATS_UPDATE_EVERY == 0 {
                        self.update_statistics();
                    }
                }

                // 按时钟节奏读取：没到唤醒时间前只处理控制请求
                if wakeup == 0 || self.is_dying() || now() >= wakeup {
                    break;
                }
                wakeup = self.es_out.wakeup();
                if wakeup == 0 {
                    break;
                }
            }
        }
    }

    /// 控制队列的等待期限
    fn control_deadline(&self, idle: bool, wakeup: Tick) -> Option<Instant> {
        if idle {
            return Some(Instant::now() + PAUSED_SLEEP);
        }
        let current = now();
        if wakeup > current {
            let wait = Duration::from_micros((wakeup - current) as u64).min(INPUT_IDLE_SLEEP);
            return Some(Instant::now() + wait);
        }
        None
    }

    /// 执行一次解复用，返回 (需要立即更新界面, 暂时无数据)
    fn demux_step(&mut self) -> (bool, bool) {
        let Some(master) = self.master.as_mut() else {
            return (false, false);
        };

        let time = master.demux.time().unwrap_or(0);
        let past_stop = self.stop > 0 && time >= self.stop;
        let past_run = self.run > 0 && self.run_start.elapsed().as_micros() as Tick > self.run;

        let mut status = if past_stop || past_run {
            Ok(DemuxStatus::Eof)
        } else {
            master.demux.demux(&self.es_out)
        };

        let mut changed = false;
        if let Ok(DemuxStatus::More) = status {
            let (in_range, updated) = self.apply_source_updates();
            changed = updated;
            if !in_range {
                status = Ok(DemuxStatus::Eof);
            }
        }

        match status {
            Ok(DemuxStatus::More) => {
                if !self.slaves.is_empty() {
                    self.slave_demux();
                }
                (changed, false)
            }
            Ok(DemuxStatus::Eof) => {
                self.handle_eof();
                (changed, false)
            }
            Err(e) if e.is_transient() => (changed, true),
            Err(e) => {
                error!("{} ❌ 解复用失败: {}", log_ctx(), e);
                self.error = true;
                self.change_state(InputState::Error);
                (changed, false)
            }
        }
    }

    fn handle_eof(&mut self) {
        if self.repeat == 0 {
            info!("{} 🏁 到达结尾", log_ctx());
            if let Some(master) = self.master.as_mut() {
                master.eof = true;
            }
            return;
        }

        info!("{} 🔁 重复播放 (剩余 {})", log_ctx(), self.repeat);
        if self.repeat > 0 {
            self.repeat -= 1;
        }

        if !self.titles.is_empty() {
            let title = self
                .mrl
                .title_start
                .filter(|t| *t < self.titles.len())
                .unwrap_or(0);
            self.queue.push(ControlRequest::SetTitle(title));
        }
        if let Some(chapter) = self.mrl.chapter_start.filter(|c| *c > 0) {
            self.queue.push(ControlRequest::SetSeekpoint(chapter));
        }
        if self.start > 0 {
            self.queue.push(ControlRequest::SetTime(self.start));
        } else {
            self.queue.push(ControlRequest::SetPosition(0.0));
        }
        self.run_start = Instant::now();
    }

    /// 处理源报告的变化；解复用器报告了就不再看访问层
    ///
    /// 返回 (仍在 MRL 指定范围内, 有变化)
    fn apply_source_updates(&mut self) -> (bool, bool) {
        let Some(master) = self.master.as_mut() else {
            return (true, false);
        };

        let demux_updates = master.demux.take_updates();
        let (updates, nav_owner_matches) = if demux_updates.any() {
            (demux_updates, master.is_title_demux())
        } else {
            match master.access.as_mut() {
                Some(access) => (access.take_updates(), !master.is_title_demux()),
                None => return (true, false),
            }
        };
        if !updates.any() {
            return (true, false);
        }

        let mut in_range = true;
        if nav_owner_matches && (updates.title || updates.seekpoint) {
            in_range = self.update_title_seekpoint(updates);
        }
        if updates.meta {
            let meta = self.master.as_ref().map(|m| m.meta()).unwrap_or_default();
            self.update_meta(meta);
        }
        if updates.size {
            if let Some(master) = self.master.as_mut() {
                master.reload_titles();
                self.titles = master.titles().to_vec();
                self.snapshot.lock().titles = self.titles.len();
            }
        }
        (in_range, true)
    }

    fn update_title_seekpoint(&mut self, updates: SourceUpdates) -> bool {
        let Some(master) = self.master.as_ref() else {
            return true;
        };
        let nav = master.nav();
        if updates.title {
            self.events.publish(InputEvent::Title(nav.title));
        }
        if updates.seekpoint {
            self.events.publish(InputEvent::Seekpoint {
                title: nav.title,
                seekpoint: nav.seekpoint,
            });
        }
        self.nav = nav;
        self.snapshot.lock().nav = nav;
        self.nav_in_range(nav)
    }

    /// 是否仍在 MRL 给出的结束标题/章节之内
    fn nav_in_range(&self, nav: NavState) -> bool {
        match (self.mrl.title_end, self.mrl.chapter_end) {
            (Some(title_end), Some(chapter_end)) => {
                !(nav.title > title_end || (nav.title == title_end && nav.seekpoint > chapter_end))
            }
            (None, Some(chapter_end)) => nav.seekpoint <= chapter_end,
            (Some(title_end), None) => nav.title <= title_end,
            (None, None) => true,
        }
    }

    fn slave_demux(&mut self) {
        let Some(time) = self.master.as_ref().and_then(|m| m.demux.time()) else {
            debug!("{} 主源不支持读取时间，跳过从属源", log_ctx());
            return;
        };

        for (index, slave) in self.slaves.iter_mut().enumerate() {
            if slave.eof {
                continue;
            }
            let mut more = true;
            if slave.demux.set_next_demux_time(time).is_ok() {
                match slave.demux.demux(&self.es_out) {
                    Ok(DemuxStatus::More) => {}
                    Err(e) if e.is_transient() => {}
                    Err(e) => {
                        warn!("{} ⚠️ 从属源 {} 读取失败: {}", log_ctx(), index, e);
                        more = false;
                    }
                    Ok(_) => more = false,
                }
            } else {
                loop {
                    let Some(slave_time) = slave.demux.time() else {
                        warn!("{} ⚠️ 从属源 {} 不支持读取时间，视为结束", log_ctx(), index);
                        more = false;
                        break;
                    };
                    if slave_time >= time {
                        break;
                    }
                    match slave.demux.demux(&self.es_out) {
                        Ok(DemuxStatus::More) => {}
                        Err(e) if e.is_transient() => break,
                        Err(e) => {
                            warn!("{} ⚠️ 从属源 {} 读取失败: {}", log_ctx(), index, e);
                            more = false;
                            break;
                        }
                        Ok(_) => {
                            more = false;
                            break;
                        }
                    }
                }
            }
            if !more {
                debug!("{} 🏁 从属源 {} 结束", log_ctx(), index);
                slave.eof = true;
            }
        }
    }

    fn slave_seek(&mut self) {
        let Some(time) = self.master.as_ref().and_then(|m| m.demux.time()) else {
            error!("{} ❌ 主源不支持读取时间，从属源无法同步", log_ctx());
            return;
        };
        for (index, slave) in self.slaves.iter_mut().enumerate() {
            match slave.demux.set_time(time) {
                Ok(()) => slave.eof = false,
                Err(e) => {
                    if !slave.eof {
                        error!("{} ❌ 从属源 {} seek 失败，视为结束: {}", log_ctx(), index, e);
                    }
                    slave.eof = true;
                }
            }
        }
    }

    // ========== 控制请求 ==========

    /// 执行一个控制请求，返回是否需要立即更新界面
    fn control(&mut self, request: ControlRequest) -> bool {
        debug!("{} 🎛️ 控制请求: {:?}", log_ctx(), request);
        match request {
            ControlRequest::Die => {
                info!("{} ⏹ 收到退出请求", log_ctx());
                self.die.store(true, Ordering::SeqCst);
                false
            }
            ControlRequest::SetPosition(position) => self.control_set_position(position, false),
            ControlRequest::SetPositionOffset(offset) => self.control_set_position(offset, true),
            ControlRequest::SetTime(time) => self.control_set_time(time, false),
            ControlRequest::SetTimeOffset(offset) => self.control_set_time(offset, true),
            ControlRequest::SetState(state) => self.control_set_state(state),
            ControlRequest::SetRate(rate) => self.control_set_rate(rate),
            ControlRequest::RateSlower => self.control_set_rate(self.walk_rate(true)),
            ControlRequest::RateFaster => self.control_set_rate(self.walk_rate(false)),
            ControlRequest::SetProgram(program) => {
                if let Err(e) = self.es_out.set_group(program) {
                    warn!("{} ⚠️ 无法切换到节目 {}: {}", log_ctx(), program, e);
                }
                if let Some(master) = self.master.as_mut() {
                    let _ = master.demux.set_group(&Group::Id(program));
                }
                false
            }
            ControlRequest::SetEs(id) => {
                self.es_out.set_es_by_id(id);
                false
            }
            ControlRequest::SetAudioDelay(delay) => {
                self.es_out.set_delay(EsCategory::Audio, delay);
                self.snapshot.lock().audio_delay = delay;
                self.events.publish(InputEvent::AudioDelay(delay));
                false
            }
            ControlRequest::SetSpuDelay(delay) => {
                self.es_out.set_delay(EsCategory::Subtitle, delay);
                self.snapshot.lock().spu_delay = delay;
                self.events.publish(InputEvent::SubtitleDelay(delay));
                false
            }
            ControlRequest::SetTitle(title) => self.control_set_title(Some(title), 0),
            ControlRequest::TitleNext => self.control_set_title(None, 1),
            ControlRequest::TitlePrev => self.control_set_title(None, -1),
            ControlRequest::SetSeekpoint(seekpoint) => self.control_set_seekpoint(Some(seekpoint), 0),
            ControlRequest::SeekpointNext => self.control_set_seekpoint(None, 1),
            ControlRequest::SeekpointPrev => self.control_set_seekpoint(None, -1),
            ControlRequest::AddSlave(location) => {
                self.add_slave(&location);
                false
            }
            ControlRequest::AddSubtitle { path, forced } => {
                self.add_subtitle(&path, forced);
                false
            }
            ControlRequest::SetRecord(record) => self.control_set_record(record),
            ControlRequest::SetFrameNext => {
                match self.state {
                    InputState::Paused => self.es_out.frame_next(),
                    InputState::Playing => {
                        self.control_set_state(InputState::Paused);
                    }
                    _ => error!("{} ❌ 当前状态无法逐帧播放", log_ctx()),
                }
                true
            }
        }
    }

    fn control_set_position(&mut self, value: f64, offset: bool) -> bool {
        if self.recording {
            error!("{} ❌ 录制中忽略跳转", log_ctx());
            return false;
        }
        let Some(master) = self.master.as_mut() else {
            return false;
        };

        let mut position = value;
        if offset {
            position += master.demux.position().unwrap_or(0.0);
        }
        let position = position.clamp(0.0, 1.0);

        // 先重置解码器与时钟，再让解复用器跳转
        self.es_out.change_position();
        match master.demux.set_position(position) {
            Ok(()) => {
                master.eof = false;
                info!("{} ⏩ 跳转到 {:.1}%", log_ctx(), position * 100.0);
                self.slave_seek();
                true
            }
            Err(e) => {
                error!("{} ❌ 跳转到 {:.1}% 失败: {}", log_ctx(), position * 100.0, e);
                false
            }
        }
    }

    fn control_set_time(&mut self, value: Tick, offset: bool) -> bool {
        if self.recording {
            error!("{} ❌ 录制中忽略跳转", log_ctx());
            return false;
        }
        let Some(master) = self.master.as_mut() else {
            return false;
        };

        let mut time = value;
        if offset {
            time += master.demux.time().unwrap_or(0);
        }
        let time = time.max(0);

        self.es_out.change_position();
        let mut result = master.demux.set_time(time);
        if result.is_err() {
            // 退化为按比例跳转
            if let Some(length) = master.demux.length().filter(|l| *l > 0) {
                result = master.demux.set_position(time as f64 / length as f64);
            }
        }

        match result {
            Ok(()) => {
                master.eof = false;
                info!("{} ⏩ 跳转到 {}ms", log_ctx(), time / 1000);
                self.slave_seek();
                true
            }
            Err(e) => {
                warn!("{} ⚠️ 跳转到 {}ms 失败: {}", log_ctx(), time / 1000, e);
                false
            }
        }
    }

    fn control_set_state(&mut self, wanted: InputState) -> bool {
        let Some(master) = self.master.as_mut() else {
            return false;
        };

        match (wanted, self.state) {
            (InputState::Playing, InputState::Paused) | (InputState::Paused, InputState::Paused) => {
                let result = master.set_pause(false);
                if let Err(e) = &result {
                    warn!("{} ⚠️ 无法取消暂停，结束播放: {}", log_ctx(), e);
                    self.queue.push(ControlRequest::Die);
                }
                self.change_state(InputState::Playing);
                if result.is_ok() {
                    self.es_out.change_pause(false, now());
                }
                true
            }
            (InputState::Paused, InputState::Playing) if self.can_pause => {
                match master.set_pause(true) {
                    Ok(()) => {
                        self.change_state(InputState::Paused);
                        self.es_out.change_pause(true, now());
                    }
                    Err(e) => warn!("{} ⚠️ 无法暂停: {}", log_ctx(), e),
                }
                true
            }
            (InputState::Paused, _) if !self.can_pause => {
                // 不能暂停：重新确认当前状态
                let state = self.effective_state();
                self.events.publish(InputEvent::State(state));
                true
            }
            (_, current) => {
                if current != InputState::Init && current != InputState::End {
                    error!("{} ❌ 无效的状态切换: {:?} -> {:?}", log_ctx(), current, wanted);
                }
                false
            }
        }
    }

    /// 在档位表中找到最接近当前速率的一档，向慢或快走一步
    fn walk_rate(&self, slower: bool) -> i32 {
        let current = self.rate.abs();
        let index = RATE_FACTORS
            .iter()
            .enumerate()
            .min_by_key(|(_, (num, den))| (current - RATE_DEFAULT * num / den).abs())
            .map(|(i, _)| i)
            .unwrap_or(8);

        if slower {
            match RATE_FACTORS.get(index + 1) {
                Some((num, den)) => RATE_DEFAULT * num / den,
                None => RATE_MAX + 1,
            }
        } else if index > 0 {
            let (num, den) = RATE_FACTORS[index - 1];
            RATE_DEFAULT * num / den
        } else {
            RATE_MIN - 1
        }
    }

    fn control_set_rate(&mut self, requested: i32) -> bool {
        let mut rate = requested.abs();
        if rate < RATE_MIN {
            debug!("{} 无法更快", log_ctx());
            rate = RATE_MIN;
        } else if rate > RATE_MAX {
            debug!("{} 无法更慢", log_ctx());
            rate = RATE_MAX;
        }

        let no_control = !self.can_pace_control && !self.can_rate_control;
        let imposed = self.output.is_some() && self.out_pace_control;
        if rate != RATE_DEFAULT && (no_control || imposed) {
            debug!("{} 🚫 当前输入无法变速", log_ctx());
            rate = RATE_DEFAULT;
        }

        if rate != self.rate && !self.can_pace_control && self.can_rate_control {
            let result = match self.master.as_mut() {
                Some(master) if master.access.is_none() => master.demux.set_rate(rate),
                _ => Err(InputError::Unsupported("set_rate")),
            };
            match result {
                Ok(applied) => rate = applied,
                Err(e) => {
                    warn!("{} ⚠️ 源变速失败: {}", log_ctx(), e);
                    rate = self.rate;
                }
            }
        }

        if rate == self.rate {
            return false;
        }

        info!("{} 🐇 速率 {} -> {}", log_ctx(), self.rate, rate);
        self.rate = rate;
        self.snapshot.lock().rate = rate;
        self.events.publish(InputEvent::Rate(rate));
        let source_rate = if self.can_pace_control || self.can_rate_control {
            rate
        } else {
            RATE_DEFAULT
        };
        self.es_out.change_rate(source_rate);
        true
    }

    fn control_set_title(&mut self, title: Option<usize>, step: i64) -> bool {
        if self.recording {
            error!("{} ❌ 录制中忽略标题切换", log_ctx());
            return false;
        }
        let Some(master) = self.master.as_mut() else {
            return false;
        };
        if self.titles.is_empty() {
            return false;
        }

        let target = match title {
            Some(t) => t as i64,
            None => master.nav().title as i64 + step,
        };
        if target < 0 || target >= self.titles.len() as i64 {
            return false;
        }

        self.es_out.change_position();
        match master.set_title(target as usize) {
            Ok(()) => {
                info!("{} 📀 切换到标题 {}", log_ctx(), target);
                self.events.publish(InputEvent::Title(target as usize));
                true
            }
            Err(e) => {
                warn!("{} ⚠️ 切换标题失败: {}", log_ctx(), e);
                false
            }
        }
    }

    fn control_set_seekpoint(&mut self, seekpoint: Option<usize>, step: i64) -> bool {
        if self.recording {
            error!("{} ❌ 录制中忽略章节切换", log_ctx());
            return false;
        }
        let Some(master) = self.master.as_mut() else {
            return false;
        };
        if self.titles.is_empty() {
            return false;
        }

        let nav = master.nav();
        let Some(title) = self.titles.get(nav.title) else {
            return false;
        };

        let target = match seekpoint {
            Some(s) => s as i64,
            None if step < 0 => {
                let mut target = nav.seekpoint as i64;
                let offset = title.seekpoints.get(nav.seekpoint).map(|s| s.time_offset).unwrap_or(-1);
                match master.demux.time() {
                    // 刚进入本章节时回到上一章，否则回到本章开头
                    Some(time) if offset >= 0 => {
                        if time < offset + SEEKPOINT_PREV_THRESHOLD {
                            target -= 1;
                        }
                    }
                    _ => target -= 1,
                }
                target
            }
            None => nav.seekpoint as i64 + step,
        };
        if target < 0 || target >= title.seekpoints.len() as i64 {
            return false;
        }

        self.es_out.change_position();
        match master.set_seekpoint(target as usize) {
            Ok(()) => {
                info!("{} 📑 切换到章节 {}", log_ctx(), target);
                true
            }
            Err(e) => {
                warn!("{} ⚠️ 切换章节失败: {}", log_ctx(), e);
                false
            }
        }
    }

    fn control_set_record(&mut self, record: bool) -> bool {
        if self.recording == record {
            return false;
        }
        let record = match self.es_out.set_record(record) {
            Ok(()) => record,
            Err(e) => {
                error!("{} ❌ 无法切换录制状态: {}", log_ctx(), e);
                false
            }
        };
        self.recording = record;
        self.snapshot.lock().recording = record;
        self.events.publish(InputEvent::Record(record));
        true
    }

    fn add_slave(&mut self, location: &str) {
        let mut slave = match self.resources.opener.open(location, None, &self.es_out) {
            Ok(slave) => slave,
            Err(e) => {
                warn!("{} ⚠️ 无法添加从属源 {}: {}", log_ctx(), location, e);
                return;
            }
        };
        info!("{} 🔗 运行中添加从属源: {}", log_ctx(), location);

        let Some(time) = self.master.as_ref().and_then(|m| m.demux.time()) else {
            error!("{} ❌ 主源不支持读取时间", log_ctx());
            return;
        };
        if let Err(e) = slave.demux.set_time(time) {
            error!("{} ❌ 新从属源 seek 失败: {}", log_ctx(), e);
            return;
        }

        let meta = slave.meta();
        self.update_meta(meta);
        self.slaves.push(slave);
    }

    fn add_subtitle(&mut self, path: &str, forced: bool) {
        // 有同名 .idx 时优先使用
        let mut location = path.to_string();
        if let Some(stem) = path.strip_suffix(".sub") {
            let idx = format!("{}.idx", stem);
            if Path::new(&idx).exists() {
                debug!("{} 使用 {} 代替 {}", log_ctx(), idx, path);
                location = idx;
            }
        }

        let before: Vec<i32> = self
            .es_out
            .tracks()
            .iter()
            .filter(|t| t.category == EsCategory::Subtitle)
            .map(|t| t.id)
            .collect();

        match self.resources.opener.open(&location, Some("subtitle"), &self.es_out) {
            Ok(slave) => {
                info!("{} 💬 加载字幕: {}", log_ctx(), location);
                self.slaves.push(slave);
            }
            Err(e) => {
                warn!("{} ⚠️ 无法加载字幕 {}: {}", log_ctx(), location, e);
                return;
            }
        }

        if !forced {
            return;
        }
        let added = self
            .es_out
            .tracks()
            .into_iter()
            .find(|t| t.category == EsCategory::Subtitle && !before.contains(&t.id));
        if let Some(track) = added {
            if let Some(handle) = self.es_out.handle_of(track.id) {
                let _ = self.es_out.control(EsOutControl::SetEsDefault(handle));
            }
            self.es_out.set_es_by_id(track.id);
        }
    }

    // ========== 状态与界面 ==========

    /// 对外可见的状态：播放中但仍在缓冲时报告 Buffering
    fn effective_state(&self) -> InputState {
        if self.state == InputState::Playing && self.es_out.is_buffering() {
            InputState::Buffering
        } else {
            self.state
        }
    }

    fn change_state(&mut self, state: InputState) {
        self.state = state;
        self.refresh_state();
    }

    fn refresh_state(&mut self) {
        let state = self.effective_state();
        if self.published_state == Some(state) {
            return;
        }
        info!("{} 🔄 状态: {:?}", log_ctx(), state);
        self.published_state = Some(state);
        {
            let mut snapshot = self.snapshot.lock();
            snapshot.state = state;
            snapshot.buffering = self.es_out.buffering_level();
        }
        self.events.publish(InputEvent::State(state));
    }

    fn update_interface(&mut self) {
        let Some(master) = self.master.as_ref() else {
            return;
        };
        let position = master.demux.position().unwrap_or(0.0);
        let time = master.demux.time().unwrap_or(0);
        let length = master.demux.length().unwrap_or(0);

        self.es_out.set_times(position, time, length);

        if length != self.length {
            self.length = length;
            self.events.publish(InputEvent::Length(length));
        }

        let delay = self.es_out.buffering_delay();
        let mut snapshot = self.snapshot.lock();
        snapshot.position = position;
        snapshot.time = (time - delay).max(0);
        snapshot.length = length;
        snapshot.buffering = self.es_out.buffering_level();
    }

    fn update_statistics(&mut self) {
        let stats = self.sampler.compute(&self.stats);
        self.snapshot.lock().stats = stats.clone();
        self.events.publish(InputEvent::Statistics(stats));
    }

    // ========== 结束 ==========

    /// 等待被要求退出
    fn wait_die(&mut self) {
        let state = if self.error { InputState::Error } else { InputState::End };
        self.change_state(state);
        while !self.is_dying() {
            if let Some(ControlRequest::Die) = self.queue.pop(Some(Instant::now() + INPUT_IDLE_SLEEP)) {
                self.die.store(true, Ordering::SeqCst);
            }
        }
    }

    fn end(&mut self) {
        self.change_state(InputState::End);

        self.es_out.shutdown();
        self.slaves.clear();
        self.master = None;

        if let Some(mux) = self.output.take() {
            self.es_out.set_stream_output(None);
            if let Err(e) = self.resources.broker.request_mux_output(Some(mux), None) {
                warn!("{} ⚠️ 归还输出失败: {}", log_ctx(), e);
            }
        }

        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!("{} 丢弃 {} 个未处理的控制请求", log_ctx(), dropped);
        }
        self.update_statistics();
        info!("{} ⏹ 输入线程结束", log_ctx());
        self.events.publish(InputEvent::Dead);
    }
}
