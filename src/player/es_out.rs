use crate::core::{
    now, Epg, EsCategory, EsFormat, EventBus, InputConfig, InputError, InputEvent, Meta, Packet, ProgramClock,
    ProgramInfo, Result, Tick, TrackInfo, RATE_DEFAULT,
};
use crate::player::decoder::{DecoderContext, DecoderHost, DecoderOutput};
use crate::player::es_select::{self, Candidate, SelectionPrefs};
use crate::player::log_ctx;
use crate::player::resource::{SharedMux, SinkKind};
use crate::player::stats::StatsCounters;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// 缓冲结束后给解码线程留出的唤醒余量
const WAKEUP_DELAY: Tick = 10_000;
/// 逐帧播放时上一帧时长未知的默认值
const FRAME_NEXT_DEFAULT: Tick = 40_000;
/// 删除轨道时等待解码队列清空的轮询间隔与上限
const DEL_POLL_INTERVAL: Duration = Duration::from_millis(20);
const DEL_WAIT_MAX: Duration = Duration::from_secs(1);

const CC_CODECS: [&str; 4] = ["cc1", "cc2", "cc3", "cc4"];

/// 轨道句柄（在 es_out 生命周期内稳定）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TrackHandle(u32);

/// 轨道选择模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EsOutMode {
    /// 不选任何轨道
    None,
    /// 所有节目的所有轨道（串流全部输出）
    All,
    /// 按偏好自动选择当前节目的轨道
    #[default]
    Auto,
    /// 选中节目列表中的所有轨道
    Partial,
}

/// es_out 控制命令
#[derive(Debug, Clone)]
pub enum EsOutControl {
    SetEsState { es: TrackHandle, selected: bool },
    SetActive(bool),
    SetMode(EsOutMode),
    /// 强制选中某轨道（同类其它轨道在自动模式下被取消）
    SetEs(TrackHandle),
    /// 取消某类（None 为全部）已选中的轨道
    UnsetEs(Option<EsCategory>),
    RestartEs(TrackHandle),
    SetEsDefault(TrackHandle),
    /// 按 ID 选择；ID 尚不存在时记下，轨道出现时自动选中
    SetEsById(i32),
    SetPcr(Tick),
    SetGroupPcr { group: i32, pcr: Tick },
    ResetPcr,
    SetGroup(i32),
    SetEsFmt { es: TrackHandle, fmt: EsFormat },
    SetEsScrambledState { es: TrackHandle, scrambled: bool },
    /// 在此时间之前的数据只解码不显示
    SetNextDisplayTime(Tick),
    SetGroupMeta { group: i32, meta: Meta },
    /// 合并节目的 EPG，并据此更新正在播出的内容
    SetGroupEpg { group: i32, epg: Epg },
    DelGroup(i32),
    SetDelay { category: EsCategory, delay: Tick },
    SetRecordState(bool),
    SetPauseState { paused: bool, date: Tick },
    SetRate(i32),
    /// 位置改变（seek）：重新进入缓冲
    SetTime,
    SetFrameNext,
    SetTimes { position: f64, time: Tick, length: Tick },
    SetJitter { pts_delay: Tick, cr_average: i32 },
}

struct Program {
    id: i32,
    tracks: usize,
    selected: bool,
    scrambled: bool,
    clock: Arc<ProgramClock>,
    name: Option<String>,
    now_playing: Option<String>,
    epg: Option<Epg>,
}

struct Track {
    handle: TrackHandle,
    id: i32,
    group: i32,
    /// 同类轨道中的序号
    channel: i32,
    fmt: EsFormat,
    language: String,
    language_code: String,
    scrambled: bool,
    decoder: Option<DecoderHost>,
    /// 录制用的影子解码器
    record: Option<DecoderHost>,
    cc_present: [bool; 4],
    cc_tracks: [Option<TrackHandle>; 4],
    /// 隐藏字幕子轨道的主轨道与通道
    cc_master: Option<(TrackHandle, usize)>,
    cc_selected: bool,
}

impl Track {
    fn is_selected(&self) -> bool {
        if self.cc_master.is_some() {
            self.cc_selected
        } else {
            self.decoder.is_some()
        }
    }

    fn candidate(&self) -> Candidate<'_> {
        Candidate {
            category: self.fmt.category,
            id: self.id,
            channel: self.channel,
            priority: self.fmt.priority,
            language_code: &self.language_code,
        }
    }

    fn name(&self) -> String {
        let base = match self.fmt.description.as_deref() {
            Some(d) if !d.is_empty() => d.to_string(),
            _ => format!("轨道 {}", self.channel + 1),
        };
        if self.language.is_empty() {
            base
        } else {
            format!("{} - [{}]", base, self.language)
        }
    }

    fn info(&self) -> TrackInfo {
        TrackInfo {
            id: self.id,
            category: self.fmt.category,
            codec: self.fmt.codec.clone(),
            group: self.group,
            name: self.name(),
            language: self.language_code.clone(),
            selected: self.is_selected(),
            scrambled: self.scrambled,
        }
    }
}

struct EsOutSys {
    events: EventBus,
    ctx: DecoderContext,

    // ========== 选择策略 ==========
    prefs: SelectionPrefs,
    mode: EsOutMode,
    active: bool,
    wanted_program: i32,
    partial_programs: Vec<i32>,
    video_enabled: bool,
    audio_enabled: bool,
    spu_enabled: bool,
    pending_es_id: Option<i32>,

    // ========== 节目与轨道 ==========
    programs: Vec<Program>,
    current: Option<i32>,
    tracks: Vec<Track>,
    next_handle: u32,
    next_id: i32,
    video_count: i32,
    audio_count: i32,
    sub_count: i32,
    main_video: Option<TrackHandle>,
    main_audio: Option<TrackHandle>,
    main_sub: Option<TrackHandle>,

    audio_delay: Tick,
    spu_delay: Tick,

    // ========== 时钟与缓冲 ==========
    paused: bool,
    pause_date: Tick,
    rate: i32,
    pts_delay: Tick,
    cr_average: i32,
    buffering: bool,
    buffering_extra_initial: Tick,
    buffering_extra_stream: Tick,
    buffering_extra_system: Tick,
    preroll_end: Option<Tick>,
    cache_level: f64,
    can_pace_control: bool,
    out_pace_control: bool,

    // ========== 输出 ==========
    /// 串流输出；存在时所有解码器改为直通复用器
    output: Option<SharedMux>,
    record: Option<SharedMux>,
    record_path: String,
}

impl EsOutSys {
    fn track_index(&self, handle: TrackHandle) -> Option<usize> {
        self.tracks.iter().position(|t| t.handle == handle)
    }

    fn program_index(&self, id: i32) -> Option<usize> {
        self.programs.iter().position(|p| p.id == id)
    }

    fn current_program(&self) -> Option<&Program> {
        self.current.and_then(|id| self.programs.iter().find(|p| p.id == id))
    }

    fn main_slot(&mut self, category: EsCategory) -> Option<&mut Option<TrackHandle>> {
        match category {
            EsCategory::Video => Some(&mut self.main_video),
            EsCategory::Audio => Some(&mut self.main_audio),
            EsCategory::Subtitle => Some(&mut self.main_sub),
            EsCategory::Unknown => None,
        }
    }

    fn main_of(&self, category: EsCategory) -> Option<TrackHandle> {
        match category {
            EsCategory::Video => self.main_video,
            EsCategory::Audio => self.main_audio,
            EsCategory::Subtitle => self.main_sub,
            EsCategory::Unknown => None,
        }
    }

    // ========== 节目 ==========

    fn program_add(&mut self, id: i32) -> usize {
        let clock = Arc::new(ProgramClock::new(self.rate));
        if self.paused {
            clock.change_pause(true, self.pause_date);
        }
        clock.set_jitter(self.pts_delay, self.cr_average);

        self.programs.push(Program {
            id,
            tracks: 0,
            selected: false,
            scrambled: false,
            clock,
            name: None,
            now_playing: None,
            epg: None,
        });
        info!("{} 📺 新节目: {}", log_ctx(), id);
        self.events.publish(InputEvent::ProgramAdd {
            id,
            name: format!("节目 {}", id),
        });

        let index = self.programs.len() - 1;
        if id == self.wanted_program || self.current.is_none() {
            self.program_select(id);
        }
        self.program_index(id).unwrap_or(index)
    }

    fn program_find_or_add(&mut self, id: i32) -> usize {
        match self.program_index(id) {
            Some(index) => index,
            None => self.program_add(id),
        }
    }

    fn program_select(&mut self, id: i32) {
        if self.current == Some(id) {
            return;
        }
        let Some(index) = self.program_index(id) else {
            return;
        };

        if let Some(old) = self.current {
            debug!("{} 📺 取消节目 {}", log_ctx(), old);
            if let Some(old_index) = self.program_index(old) {
                self.programs[old_index].selected = false;
            }
            if self.mode != EsOutMode::All {
                let handles: Vec<TrackHandle> = self
                    .tracks
                    .iter()
                    .filter(|t| t.group == old && t.is_selected())
                    .map(|t| t.handle)
                    .collect();
                for handle in handles {
                    if self.track_index(handle).map(|i| self.tracks[i].is_selected()) == Some(true) {
                        self.es_unselect(handle, true);
                    }
                }
            }
            self.main_audio = None;
            self.main_video = None;
            self.main_sub = None;
        }

        info!("{} 📺 选中节目 {}", log_ctx(), id);
        self.programs[index].selected = true;
        self.current = Some(id);

        self.events.publish(InputEvent::ProgramSelect { id });
        for category in [EsCategory::Video, EsCategory::Audio, EsCategory::Subtitle] {
            self.events.publish(InputEvent::EsSelect { category, id: None });
        }
        self.events.publish(InputEvent::TeletextSelect { id: None });
        if self.programs[index].epg.is_some() {
            let now_playing = self.programs[index].now_playing.clone();
            self.events.publish(InputEvent::NowPlaying(now_playing));
        }

        let handles: Vec<TrackHandle> = self.tracks.iter().filter(|t| t.group == id).map(|t| t.handle).collect();
        for handle in handles {
            self.select_policy(handle, false);
        }

        let scrambled = self.programs.iter().find(|p| p.id == id).map(|p| p.scrambled).unwrap_or(false);
        self.events.publish(InputEvent::ProgramScrambled { id, scrambled });
    }

    fn program_del(&mut self, id: i32) -> Result<()> {
        let index = self.program_index(id).ok_or(InputError::InvalidGroup(id))?;
        if self.programs[index].tracks > 0 {
            return Err(InputError::ProgramBusy(id));
        }
        if self.current == Some(id) {
            self.current = None;
        }
        self.programs.remove(index);
        info!("{} 📺 删除节目 {}", log_ctx(), id);
        self.events.publish(InputEvent::ProgramDel { id });
        Ok(())
    }

    fn program_update_scrambled(&mut self, id: i32) {
        let scrambled = self.tracks.iter().any(|t| t.group == id && t.scrambled);
        let Some(index) = self.program_index(id) else {
            return;
        };
        if self.programs[index].scrambled == scrambled {
            return;
        }
        self.programs[index].scrambled = scrambled;
        self.events.publish(InputEvent::ProgramScrambled { id, scrambled });
    }

    fn program_set_meta(&mut self, id: i32, meta: &Meta) {
        let index = self.program_find_or_add(id);
        let program = &mut self.programs[index];
        if meta.title.is_some() {
            program.name = meta.title.clone();
        }
        if meta.now_playing.is_some() {
            program.now_playing = meta.now_playing.clone();
        }
        self.events.publish(InputEvent::ProgramUpdated { id });
    }

    fn program_set_epg(&mut self, id: i32, epg: &Epg) {
        let Some(index) = self.program_index(id) else {
            debug!("{} 📅 节目 {} 不存在，忽略 EPG", log_ctx(), id);
            return;
        };
        let is_current = self.current == Some(id);
        let program = &mut self.programs[index];
        let name = program.name.clone();
        let merged = program.epg.get_or_insert_with(|| Epg::new(name));
        merged.merge(epg);
        debug!("{} 📅 节目 {} 的 EPG 更新: {} 个事件", log_ctx(), id, merged.events.len());

        program.now_playing = merged
            .current_event()
            .map(|e| e.name.clone())
            .filter(|name| !name.is_empty());
        let (epg, now_playing) = (merged.clone(), program.now_playing.clone());

        self.events.publish(InputEvent::ProgramEpg { id, epg });
        if is_current {
            self.events.publish(InputEvent::NowPlaying(now_playing));
        }
        self.events.publish(InputEvent::ProgramUpdated { id });
    }

    // ========== 轨道 ==========

    fn add_track(&mut self, fmt: &EsFormat, cc_master: Option<(TrackHandle, usize)>) -> Result<TrackHandle> {
        if fmt.group < 0 {
            return Err(InputError::InvalidGroup(fmt.group));
        }
        let program_index = self.program_find_or_add(fmt.group);

        let handle = TrackHandle(self.next_handle);
        self.next_handle += 1;
        let id = if fmt.id >= 0 { fmt.id } else { self.next_id };
        self.next_id += 1;

        let counter = match fmt.category {
            EsCategory::Video => Some(&mut self.video_count),
            EsCategory::Audio => Some(&mut self.audio_count),
            EsCategory::Subtitle => Some(&mut self.sub_count),
            EsCategory::Unknown => None,
        };
        let channel = match counter {
            Some(count) => {
                *count += 1;
                *count - 1
            }
            None => 0,
        };

        let mut track_fmt = fmt.clone();
        track_fmt.id = id;
        let track = Track {
            handle,
            id,
            group: fmt.group,
            channel,
            language: es_select::language_name(fmt.language.as_deref()),
            language_code: es_select::language_code(fmt.language.as_deref()),
            fmt: track_fmt,
            scrambled: false,
            decoder: None,
            record: None,
            cc_present: [false; 4],
            cc_tracks: [None; 4],
            cc_master,
            cc_selected: false,
        };
        let name = track.name();
        self.programs[program_index].tracks += 1;
        self.tracks.push(track);

        info!(
            "{} ➕ 新轨道: id={} {} {} (节目 {})",
            log_ctx(),
            id,
            fmt.category,
            fmt.codec,
            fmt.group
        );
        self.events.publish(InputEvent::EsAdd {
            category: fmt.category,
            id,
            name,
        });
        if fmt.is_teletext() {
            self.events.publish(InputEvent::TeletextAdd {
                id,
                page: fmt.teletext_page(),
            });
        }

        self.select_policy(handle, false);
        Ok(handle)
    }

    fn send(&mut self, handle: TrackHandle, mut packet: Packet) -> Result<()> {
        StatsCounters::bump(&self.ctx.stats.demux_read_packets);
        StatsCounters::add(&self.ctx.stats.demux_read_bytes, packet.data.len() as u64);

        let index = self
            .track_index(handle)
            .ok_or_else(|| InputError::UnknownTrack(format!("{:?}", handle)))?;

        if let Some(end) = self.preroll_end {
            if packet.date().map_or(false, |date| date < end) {
                packet.flags.preroll = true;
            }
        }

        let pace = self.can_pace_control && !self.out_pace_control;
        let track = &self.tracks[index];
        let Some(decoder) = track.decoder.as_ref() else {
            return Ok(());
        };
        if let Some(record) = track.record.as_ref() {
            record.decode(packet.clone(), pace);
        }
        decoder.decode(packet, pace);

        let new_format = decoder.format_changed();
        let cc_present = decoder.cc_present();

        if let Some(fmt) = new_format {
            self.update_info(index, fmt);
        }

        for channel in 0..4 {
            let Some(index) = self.track_index(handle) else {
                break;
            };
            if self.tracks[index].cc_present[channel] || !cc_present[channel] {
                continue;
            }
            debug!("{} 💬 为轨道 {} 添加隐藏字幕 {}", log_ctx(), self.tracks[index].id, channel + 1);
            let fmt = EsFormat::new(EsCategory::Subtitle, CC_CODECS[channel])
                .with_group(self.tracks[index].group)
                .with_description(&format!("隐藏字幕 {}", channel + 1));
            let child = self.add_track(&fmt, Some((handle, channel)))?;
            if let Some(index) = self.track_index(handle) {
                self.tracks[index].cc_tracks[channel] = Some(child);
                self.tracks[index].cc_present[channel] = true;
            }
        }
        Ok(())
    }

    fn update_info(&mut self, index: usize, fmt: EsFormat) {
        let track = &mut self.tracks[index];
        track.fmt.codec = fmt.codec;
        if fmt.audio.is_some() {
            track.fmt.audio = fmt.audio;
        }
        if fmt.video.is_some() {
            track.fmt.video = fmt.video;
        }
        if fmt.description.is_some() {
            track.fmt.description = fmt.description;
        }
        let (category, id) = (track.fmt.category, track.id);
        self.events.publish(InputEvent::EsUpdated { category, id });
    }

    fn del_track(&mut self, handle: TrackHandle) {
        let Some(index) = self.track_index(handle) else {
            return;
        };

        // 等待解码队列清空，最多 DEL_WAIT_MAX；暂停中的解码器不会再消费
        let started = Instant::now();
        while !self.ctx.die.load(Ordering::SeqCst) && !self.buffering && !self.paused {
            let track = &self.tracks[index];
            let Some(decoder) = track.decoder.as_ref() else {
                break;
            };
            if decoder.is_empty() && track.record.as_ref().map_or(true, |r| r.is_empty()) {
                break;
            }
            if started.elapsed() >= DEL_WAIT_MAX {
                warn!(
                    "{} ⚠️ 轨道 {} 的解码队列 {}ms 内未清空，直接删除",
                    log_ctx(),
                    track.id,
                    DEL_WAIT_MAX.as_millis()
                );
                break;
            }
            thread::sleep(DEL_POLL_INTERVAL);
        }

        let in_current = self.current == Some(self.tracks[index].group);
        if self.tracks[index].is_selected() {
            self.es_unselect(handle, in_current);
        }

        let Some(index) = self.track_index(handle) else {
            return;
        };
        let track = self.tracks.remove(index);
        info!("{} ➖ 删除轨道: id={} {}", log_ctx(), track.id, track.fmt.category);

        if let Some(program_index) = self.program_index(track.group) {
            self.programs[program_index].tracks -= 1;
            if self.programs[program_index].tracks == 0 {
                debug!("{} 📺 节目 {} 已没有轨道", log_ctx(), track.group);
            }
        }
        if track.scrambled {
            self.program_update_scrambled(track.group);
        }
        if track.fmt.is_teletext() {
            self.events.publish(InputEvent::TeletextDel { id: Some(track.id) });
        }
        self.events.publish(InputEvent::EsDel {
            category: track.fmt.category,
            id: track.id,
        });

        let category = track.fmt.category;
        let was_main = self.main_of(category) == Some(handle);
        if let Some(slot) = self.main_slot(category) {
            if *slot == Some(handle) {
                *slot = None;
            }
        }
        match category {
            EsCategory::Video => self.video_count -= 1,
            EsCategory::Audio => self.audio_count -= 1,
            EsCategory::Subtitle => self.sub_count -= 1,
            EsCategory::Unknown => {}
        }

        if was_main {
            let handles: Vec<TrackHandle> = self
                .tracks
                .iter()
                .filter(|t| t.fmt.category == category)
                .map(|t| t.handle)
                .collect();
            for handle in handles {
                self.select_policy(handle, false);
            }
        }

        // 没有轨道且未被选中的节目随之销毁
        if let Some(program_index) = self.program_index(track.group) {
            let program = &self.programs[program_index];
            if program.tracks == 0 && !program.selected {
                if let Err(e) = self.program_del(track.group) {
                    warn!("{} ⚠️ 无法删除节目 {}: {}", log_ctx(), track.group, e);
                }
            }
        }
    }

    // ========== 选择 ==========

    /// 按当前模式与偏好决定是否选中轨道
    fn select_policy(&mut self, handle: TrackHandle, force: bool) {
        if !self.active {
            return;
        }
        let Some(index) = self.track_index(handle) else {
            return;
        };
        let (id, group, category, priority, selected) = {
            let t = &self.tracks[index];
            (t.id, t.group, t.fmt.category, t.fmt.priority, t.is_selected())
        };
        if !force && priority < 0 {
            return;
        }

        let requested = self.pending_es_id == Some(id);
        let force = force || requested;

        if self.mode == EsOutMode::All || force {
            if !selected {
                self.es_select(handle);
            }
            if requested {
                debug!("{} 🎯 选中先前请求的轨道 {}", log_ctx(), id);
                self.pending_es_id = None;
            }
        } else if self.mode == EsOutMode::Partial {
            if self.partial_programs.contains(&group) && !selected {
                self.es_select(handle);
            }
        } else if self.mode == EsOutMode::Auto {
            if self.current != Some(group) {
                return;
            }
            let wanted = {
                let main = self
                    .main_of(category)
                    .and_then(|m| self.track_index(m))
                    .map(|i| self.tracks[i].candidate());
                self.prefs.auto_wants(&self.tracks[index].candidate(), main.as_ref())
            };
            if wanted && !selected {
                self.es_select(handle);
            }
        }

        let Some(index) = self.track_index(handle) else {
            return;
        };
        if !self.tracks[index].is_selected() {
            return;
        }
        match category {
            EsCategory::Audio | EsCategory::Subtitle => {
                if self.mode == EsOutMode::Auto {
                    if let Some(old) = self.main_of(category).filter(|m| *m != handle) {
                        if self.track_index(old).map(|i| self.tracks[i].is_selected()) == Some(true) {
                            self.es_unselect(old, false);
                        }
                    }
                }
                if let Some(slot) = self.main_slot(category) {
                    *slot = Some(handle);
                }
            }
            EsCategory::Video => self.main_video = Some(handle),
            EsCategory::Unknown => {}
        }
    }

    fn es_select(&mut self, handle: TrackHandle) {
        let Some(index) = self.track_index(handle) else {
            return;
        };
        if self.tracks[index].is_selected() {
            warn!("{} ⚠️ 轨道 {} 已经被选中", log_ctx(), self.tracks[index].id);
            return;
        }

        if let Some((master, channel)) = self.tracks[index].cc_master {
            let Some(master_index) = self.track_index(master) else {
                return;
            };
            let Some(decoder) = self.tracks[master_index].decoder.as_ref() else {
                return;
            };
            if decoder.set_cc_state(channel, true).is_err() {
                return;
            }
            self.tracks[index].cc_selected = true;
        } else {
            let category = self.tracks[index].fmt.category;
            let enabled = match category {
                EsCategory::Video => self.video_enabled,
                EsCategory::Audio => self.audio_enabled,
                EsCategory::Subtitle => self.video_enabled && self.spu_enabled,
                EsCategory::Unknown => false,
            };
            if !enabled {
                debug!("{} 🚫 {} 已禁用，不选中轨道 {}", log_ctx(), category, self.tracks[index].id);
                return;
            }
            self.create_decoder(index);
            let track = &self.tracks[index];
            if track.decoder.is_none() || self.current != Some(track.group) {
                return;
            }
        }

        let track = &self.tracks[index];
        info!("{} ✅ 选中轨道: id={} {}", log_ctx(), track.id, track.fmt.codec);
        self.events.publish(InputEvent::EsSelect {
            category: track.fmt.category,
            id: Some(track.id),
        });
        if track.fmt.category == EsCategory::Subtitle {
            let id = track.fmt.is_teletext().then_some(track.id);
            self.events.publish(InputEvent::TeletextSelect { id });
        }
    }

    fn es_unselect(&mut self, handle: TrackHandle, update: bool) {
        let Some(index) = self.track_index(handle) else {
            return;
        };
        if !self.tracks[index].is_selected() {
            warn!("{} ⚠️ 轨道 {} 未被选中", log_ctx(), self.tracks[index].id);
            return;
        }

        if let Some((master, channel)) = self.tracks[index].cc_master {
            if let Some(master_index) = self.track_index(master) {
                if let Some(decoder) = self.tracks[master_index].decoder.as_ref() {
                    if let Err(e) = decoder.set_cc_state(channel, false) {
                        warn!("{} ⚠️ 无法关闭隐藏字幕 {}: {}", log_ctx(), channel + 1, e);
                    }
                }
            }
            self.tracks[index].cc_selected = false;
        } else {
            let children: Vec<TrackHandle> = self.tracks[index].cc_tracks.iter().flatten().copied().collect();
            for child in children {
                if self.main_sub == Some(child) {
                    self.events.publish(InputEvent::EsSelect {
                        category: EsCategory::Subtitle,
                        id: None,
                    });
                }
                self.del_track(child);
            }
            let Some(index) = self.track_index(handle) else {
                return;
            };
            self.tracks[index].cc_present = [false; 4];
            self.tracks[index].cc_tracks = [None; 4];
            self.destroy_decoder(index);
        }

        let Some(index) = self.track_index(handle) else {
            return;
        };
        let track = &self.tracks[index];
        info!("{} ⏹ 取消轨道: id={} {}", log_ctx(), track.id, track.fmt.codec);
        if update {
            self.events.publish(InputEvent::EsSelect {
                category: track.fmt.category,
                id: None,
            });
            if track.fmt.is_teletext() {
                self.events.publish(InputEvent::TeletextSelect { id: None });
            }
        }
    }

    fn decoder_output(&self) -> DecoderOutput {
        match &self.output {
            Some(mux) => DecoderOutput::Mux(mux.clone()),
            None => DecoderOutput::Render,
        }
    }

    fn create_decoder(&mut self, index: usize) {
        let group = self.tracks[index].group;
        let Some(clock) = self.programs.iter().find(|p| p.id == group).map(|p| p.clock.clone()) else {
            return;
        };

        let fmt = self.tracks[index].fmt.clone();
        let decoder = match DecoderHost::spawn(&fmt, clock.clone(), self.decoder_output(), &self.ctx) {
            Ok(decoder) => decoder,
            Err(e) => {
                error!("{} ❌ 无法创建解码器 ({}): {}", log_ctx(), fmt.codec, e);
                return;
            }
        };
        if self.buffering {
            decoder.start_buffering();
        }
        if self.paused {
            decoder.change_pause(true, self.pause_date);
        }

        if let Some(mux) = self.record.clone() {
            match DecoderHost::spawn(&fmt, clock, DecoderOutput::Mux(mux), &self.ctx) {
                Ok(record) => {
                    if self.buffering {
                        record.start_buffering();
                    }
                    self.tracks[index].record = Some(record);
                }
                Err(e) => warn!("{} ⚠️ 无法创建录制解码器: {}", log_ctx(), e),
            }
        }

        self.tracks[index].decoder = Some(decoder);
        self.apply_delay(index);
    }

    fn destroy_decoder(&mut self, index: usize) {
        let track = &mut self.tracks[index];
        // 析构时等待解码线程退出
        track.decoder.take();
        track.record.take();
    }

    fn apply_delay(&self, index: usize) {
        let track = &self.tracks[index];
        let delay = match track.fmt.category {
            EsCategory::Audio => self.audio_delay,
            EsCategory::Subtitle => self.spu_delay,
            _ => return,
        };
        if let Some(decoder) = track.decoder.as_ref() {
            decoder.change_delay(delay);
        }
        if let Some(record) = track.record.as_ref() {
            record.change_delay(delay);
        }
    }

    fn set_es_state(&mut self, handle: TrackHandle, selected: bool) -> Result<()> {
        let index = self
            .track_index(handle)
            .ok_or_else(|| InputError::UnknownTrack(format!("{:?}", handle)))?;
        let (is_selected, group) = (self.tracks[index].is_selected(), self.tracks[index].group);
        if selected && !is_selected {
            self.es_select(handle);
            let index = self
                .track_index(handle)
                .ok_or_else(|| InputError::UnknownTrack(format!("{:?}", handle)))?;
            if !self.tracks[index].is_selected() {
                return Err(InputError::ResourceError(format!("无法选中轨道 {}", self.tracks[index].id)));
            }
        } else if !selected && is_selected {
            let update = self.current == Some(group);
            self.es_unselect(handle, update);
        }
        Ok(())
    }

    fn restart(&mut self, handle: TrackHandle) {
        let Some(index) = self.track_index(handle) else {
            return;
        };
        if self.tracks[index].decoder.is_some() {
            debug!("{} 🔁 重启解码器: id={}", log_ctx(), self.tracks[index].id);
            self.destroy_decoder(index);
            self.create_decoder(index);
        }
    }

    fn unset_category(&mut self, category: Option<EsCategory>) {
        let handles: Vec<TrackHandle> = self
            .tracks
            .iter()
            .filter(|t| category.map_or(true, |c| t.fmt.category == c))
            .map(|t| t.handle)
            .collect();
        for handle in handles {
            if let Some(index) = self.track_index(handle) {
                let track = &self.tracks[index];
                if track.is_selected() {
                    let update = self.current == Some(track.group);
                    self.es_unselect(handle, update);
                }
            }
        }
    }

    fn set_es_by_id(&mut self, id: i32) {
        match self.tracks.iter().find(|t| t.id == id).map(|t| t.handle) {
            Some(handle) => self.select_policy(handle, true),
            None => {
                debug!("{} 🎯 轨道 {} 尚不存在，出现时自动选中", log_ctx(), id);
                self.pending_es_id = Some(id);
            }
        }
    }

    fn set_mode(&mut self, mode: EsOutMode) {
        self.mode = mode;
        let handles: Vec<TrackHandle> = self.tracks.iter().map(|t| t.handle).collect();
        for handle in &handles {
            if let Some(index) = self.track_index(*handle) {
                let track = &self.tracks[index];
                if track.is_selected() {
                    let update = self.current == Some(track.group);
                    self.es_unselect(*handle, update);
                }
            }
        }
        for handle in handles {
            self.select_policy(handle, false);
        }
    }

    fn set_active(&mut self, active: bool) {
        if active && !self.active && !self.tracks.is_empty() {
            // 有轨道但没有视频时，空闲的视频输出不会再被用到
            if !self.tracks.iter().any(|t| t.fmt.category == EsCategory::Video) {
                self.ctx.broker.terminate(SinkKind::Video);
            }
        }
        self.active = active;
    }

    fn set_es_fmt(&mut self, handle: TrackHandle, fmt: EsFormat) -> Result<()> {
        let index = self
            .track_index(handle)
            .ok_or_else(|| InputError::UnknownTrack(format!("{:?}", handle)))?;
        let track = &mut self.tracks[index];
        let (id, group, category) = (track.id, track.group, track.fmt.category);
        track.fmt = EsFormat {
            id,
            group,
            category,
            ..fmt
        };
        self.restart(handle);
        self.events.publish(InputEvent::EsUpdated { category, id });
        Ok(())
    }

    fn set_scrambled(&mut self, handle: TrackHandle, scrambled: bool) -> Result<()> {
        let index = self
            .track_index(handle)
            .ok_or_else(|| InputError::UnknownTrack(format!("{:?}", handle)))?;
        if self.tracks[index].scrambled != scrambled {
            self.tracks[index].scrambled = scrambled;
            let group = self.tracks[index].group;
            self.program_update_scrambled(group);
        }
        Ok(())
    }

    // ========== 时钟与缓冲 ==========

    fn set_pcr(&mut self, group: Option<i32>, pcr: Tick) -> Result<()> {
        if pcr < 0 {
            return Err(InputError::InvalidPcr(pcr));
        }
        let index = match group {
            Some(g) if g < 0 => return Err(InputError::InvalidGroup(g)),
            Some(g) => self.program_find_or_add(g),
            None => match self.current.and_then(|id| self.program_index(id)) {
                Some(index) => index,
                None => self.program_find_or_add(0),
            },
        };

        let program = &self.programs[index];
        let late = program
            .clock
            .update(pcr, now(), self.can_pace_control || self.buffering, true);
        if late {
            debug!("{} 🐢 节目 {} 的 PCR 迟到", log_ctx(), program.id);
        }

        if self.current == Some(program.id) && self.buffering {
            self.stop_buffering(false);
        }
        Ok(())
    }

    fn change_position(&mut self) {
        self.cache_level = 0.0;
        self.events.publish(InputEvent::Cache(0.0));

        for track in &self.tracks {
            if let Some(decoder) = track.decoder.as_ref() {
                decoder.start_buffering();
            }
            if let Some(record) = track.record.as_ref() {
                record.start_buffering();
            }
        }
        for program in &self.programs {
            program.clock.reset();
        }

        self.buffering = true;
        self.buffering_extra_initial = 0;
        self.buffering_extra_stream = 0;
        self.buffering_extra_system = 0;
        self.preroll_end = None;
    }

    /// 检查缓冲是否足够，足够时把时钟原点移到当前时间并放开解码器
    fn stop_buffering(&mut self, forced: bool) {
        let Some(clock) = self.current_program().map(|p| p.clock.clone()) else {
            return;
        };
        let Ok(state) = clock.state() else {
            return;
        };

        let preroll = self
            .preroll_end
            .map(|end| (end - state.stream_start).max(0))
            .unwrap_or(0);
        let buffering_duration =
            self.pts_delay + preroll + self.buffering_extra_stream - self.buffering_extra_initial;

        if state.stream_duration <= buffering_duration && !forced {
            let level = if buffering_duration > 0 {
                (state.stream_duration as f64 / buffering_duration as f64).max(0.0)
            } else {
                0.0
            };
            // 同一轮缓冲内进度不回退
            let level = level.max(self.cache_level);
            self.cache_level = level;
            self.events.publish(InputEvent::Cache(level));
            debug!(
                "{} ⏳ 缓冲中 {}ms / {}ms",
                log_ctx(),
                state.stream_duration / 1000,
                buffering_duration / 1000
            );
            return;
        }

        self.cache_level = 1.0;
        self.events.publish(InputEvent::Cache(1.0));
        self.buffering = false;
        self.preroll_end = None;

        if self.buffering_extra_initial > 0 {
            return;
        }

        let wait_start = now();
        for track in &self.tracks {
            if track.fmt.category == EsCategory::Subtitle {
                continue;
            }
            if let Some(decoder) = track.decoder.as_ref() {
                decoder.wait_buffering();
            }
            if let Some(record) = track.record.as_ref() {
                record.wait_buffering();
            }
        }
        info!(
            "{} ✅ 缓冲完成: 流 {}ms, 解码器等待 {}ms",
            log_ctx(),
            state.stream_duration / 1000,
            (now() - wait_start) / 1000
        );

        // 缓冲结束时的空闲视频输出不再需要
        self.ctx.broker.terminate(SinkKind::Video);

        let current = if self.paused { self.pause_date } else { now() };
        clock.change_system_origin(true, current + WAKEUP_DELAY - buffering_duration);

        for track in &self.tracks {
            if let Some(decoder) = track.decoder.as_ref() {
                decoder.stop_buffering();
            }
            if let Some(record) = track.record.as_ref() {
                record.stop_buffering();
            }
        }
    }

    fn change_pause(&mut self, paused: bool, mut date: Tick) {
        // 顺序：暂停先停解码器再停时钟，恢复相反
        if paused {
            self.decoders_change_pause(true, date);
            for program in &self.programs {
                program.clock.change_pause(true, date);
            }
        } else {
            if self.buffering_extra_initial > 0 {
                if let Some(program) = self.current_program() {
                    if program.clock.state().is_ok() {
                        date -= self.buffering_extra_system - self.buffering_extra_initial;
                    }
                }
                self.buffering_extra_initial = 0;
                self.buffering_extra_stream = 0;
                self.buffering_extra_system = 0;
            }
            for program in &self.programs {
                program.clock.change_pause(false, date);
            }
            self.decoders_change_pause(false, date);
            for program in &self.programs {
                program.clock.change_rate(self.rate);
            }
        }
        self.paused = paused;
        self.pause_date = date;
    }

    fn decoders_change_pause(&self, paused: bool, date: Tick) {
        for track in &self.tracks {
            if let Some(decoder) = track.decoder.as_ref() {
                decoder.change_pause(paused, date);
            }
            if let Some(record) = track.record.as_ref() {
                record.change_pause(paused, date);
            }
        }
    }

    fn change_rate(&mut self, rate: i32) {
        self.rate = rate;
        for program in &self.programs {
            program.clock.change_rate(rate);
        }
    }

    fn frame_next(&mut self) {
        if !self.paused {
            warn!("{} ⚠️ 逐帧播放只能在暂停时使用", log_ctx());
            return;
        }
        let Some(video) = self
            .tracks
            .iter()
            .find(|t| t.fmt.category == EsCategory::Video && t.decoder.is_some())
        else {
            warn!("{} ⚠️ 没有视频轨道，无法逐帧播放", log_ctx());
            return;
        };
        let mut duration = video.decoder.as_ref().map(|d| d.frame_next()).unwrap_or(0);
        if duration <= 0 {
            duration = FRAME_NEXT_DEFAULT;
        }

        let Some(clock) = self.current_program().map(|p| p.clock.clone()) else {
            return;
        };
        if self.buffering_extra_initial <= 0 {
            let Ok(state) = clock.state() else {
                return;
            };
            self.buffering_extra_initial = 1 + state.stream_duration - self.pts_delay;
            self.buffering_extra_system = self.buffering_extra_initial;
            self.buffering_extra_stream = self.buffering_extra_initial;
        }

        let rate = clock.rate() as Tick;
        self.buffering = true;
        self.buffering_extra_system += duration;
        self.buffering_extra_stream = self.buffering_extra_initial
            + (self.buffering_extra_system - self.buffering_extra_initial) * RATE_DEFAULT as Tick / rate;
        self.preroll_end = None;
    }

    /// 缓冲中尚未消耗的延迟，用于修正对外报告的时间
    fn buffering_delay(&self) -> Tick {
        let Some(program) = self.current_program() else {
            return 0;
        };
        let Ok(state) = program.clock.state() else {
            return 0;
        };

        let delay = if self.buffering && self.buffering_extra_initial <= 0 {
            state.stream_duration
        } else {
            let system_duration = if self.paused {
                let mut duration = self.pause_date - state.system_start;
                if self.buffering_extra_initial > 0 {
                    duration += self.buffering_extra_system - self.buffering_extra_initial;
                }
                duration
            } else {
                now() - state.system_start
            };
            let consumed = system_duration * RATE_DEFAULT as Tick / self.rate as Tick - state.stream_duration;
            self.pts_delay - consumed
        };
        delay.max(0)
    }

    fn set_times(&self, mut position: f64, mut time: Tick, length: Tick) {
        let delay = self.buffering_delay();
        time = (time - delay).max(0);
        if length > 0 {
            position -= delay as f64 / length as f64;
        }
        if position < 0.0 {
            position = 0.0;
        }
        if !self.buffering {
            self.events.publish(InputEvent::Times { position, time, length });
        }
    }

    fn set_jitter(&mut self, pts_delay: Tick, cr_average: i32) {
        if pts_delay == self.pts_delay && cr_average == self.cr_average {
            return;
        }
        self.pts_delay = pts_delay;
        self.cr_average = cr_average;
        for program in &self.programs {
            program.clock.set_jitter(pts_delay, cr_average);
        }
    }

    fn set_delay(&mut self, category: EsCategory, delay: Tick) {
        match category {
            EsCategory::Audio => self.audio_delay = delay,
            EsCategory::Subtitle => self.spu_delay = delay,
            _ => return,
        }
        for index in 0..self.tracks.len() {
            if self.tracks[index].fmt.category == category {
                self.apply_delay(index);
            }
        }
    }

    fn wakeup(&self) -> Tick {
        let Some(program) = self.current_program() else {
            return 0;
        };
        if !self.can_pace_control || self.out_pace_control || self.buffering {
            return 0;
        }
        program.clock.wakeup()
    }

    fn is_empty(&mut self) -> bool {
        if self.buffering && self.current.is_some() {
            self.stop_buffering(true);
            if self.buffering {
                return true;
            }
        }
        self.tracks.iter().all(|t| {
            t.decoder.as_ref().map_or(true, |d| d.is_empty()) && t.record.as_ref().map_or(true, |r| r.is_empty())
        })
    }

    fn set_record(&mut self, record: bool) -> Result<()> {
        if record == self.record.is_some() {
            return Ok(());
        }

        if record {
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let target = format!("{}/myy-record-{}.ts", self.record_path.trim_end_matches('/'), stamp);
            let mux = self.ctx.broker.create_mux_output(&target)?;

            for index in 0..self.tracks.len() {
                let track = &self.tracks[index];
                if track.decoder.is_none() || track.cc_master.is_some() {
                    continue;
                }
                let Some(clock) = self.programs.iter().find(|p| p.id == track.group).map(|p| p.clock.clone())
                else {
                    continue;
                };
                match DecoderHost::spawn(&track.fmt, clock, DecoderOutput::Mux(mux.clone()), &self.ctx) {
                    Ok(decoder) => {
                        if self.buffering {
                            decoder.start_buffering();
                        }
                        self.tracks[index].record = Some(decoder);
                    }
                    Err(e) => warn!("{} ⚠️ 无法创建录制解码器: {}", log_ctx(), e),
                }
            }
            info!("{} 🔴 开始录制: {}", log_ctx(), target);
            self.record = Some(mux);
        } else {
            for track in &mut self.tracks {
                track.record.take();
            }
            self.record = None;
            info!("{} ⏹ 停止录制", log_ctx());
        }
        Ok(())
    }

    fn control(&mut self, control: EsOutControl) -> Result<()> {
        match control {
            EsOutControl::SetEsState { es, selected } => return self.set_es_state(es, selected),
            EsOutControl::SetActive(active) => self.set_active(active),
            EsOutControl::SetMode(mode) => self.set_mode(mode),
            EsOutControl::SetEs(es) => {
                if self.track_index(es).is_none() {
                    return Err(InputError::UnknownTrack(format!("{:?}", es)));
                }
                self.select_policy(es, true);
            }
            EsOutControl::UnsetEs(category) => self.unset_category(category),
            EsOutControl::RestartEs(es) => self.restart(es),
            EsOutControl::SetEsDefault(es) => {
                let index = self
                    .track_index(es)
                    .ok_or_else(|| InputError::UnknownTrack(format!("{:?}", es)))?;
                if self.tracks[index].fmt.category == EsCategory::Subtitle {
                    self.prefs.default_sub_id = self.tracks[index].id;
                }
            }
            EsOutControl::SetEsById(id) => self.set_es_by_id(id),
            EsOutControl::SetPcr(pcr) => return self.set_pcr(None, pcr),
            EsOutControl::SetGroupPcr { group, pcr } => return self.set_pcr(Some(group), pcr),
            EsOutControl::ResetPcr => {
                warn!("{} ⏱️ 重置 PCR", log_ctx());
                self.change_position();
            }
            EsOutControl::SetGroup(group) => {
                if self.program_index(group).is_none() {
                    return Err(InputError::InvalidGroup(group));
                }
                self.program_select(group);
            }
            EsOutControl::SetEsFmt { es, fmt } => return self.set_es_fmt(es, fmt),
            EsOutControl::SetEsScrambledState { es, scrambled } => return self.set_scrambled(es, scrambled),
            EsOutControl::SetNextDisplayTime(date) => self.preroll_end = Some(date),
            EsOutControl::SetGroupMeta { group, meta } => {
                if group < 0 {
                    return Err(InputError::InvalidGroup(group));
                }
                self.program_set_meta(group, &meta);
            }
            EsOutControl::SetGroupEpg { group, epg } => {
                if group < 0 {
                    return Err(InputError::InvalidGroup(group));
                }
                self.program_set_epg(group, &epg);
            }
            EsOutControl::DelGroup(group) => return self.program_del(group),
            EsOutControl::SetDelay { category, delay } => self.set_delay(category, delay),
            EsOutControl::SetRecordState(record) => return self.set_record(record),
            EsOutControl::SetPauseState { paused, date } => self.change_pause(paused, date),
            EsOutControl::SetRate(rate) => self.change_rate(rate),
            EsOutControl::SetTime => self.change_position(),
            EsOutControl::SetFrameNext => self.frame_next(),
            EsOutControl::SetTimes { position, time, length } => self.set_times(position, time, length),
            EsOutControl::SetJitter { pts_delay, cr_average } => self.set_jitter(pts_delay, cr_average),
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        let handles: Vec<TrackHandle> = self.tracks.iter().map(|t| t.handle).collect();
        for handle in handles {
            if let Some(index) = self.track_index(handle) {
                if self.tracks[index].is_selected() {
                    self.es_unselect(handle, true);
                }
            }
        }
        if self.tracks.iter().any(|t| t.fmt.is_teletext()) {
            self.events.publish(InputEvent::TeletextDel { id: None });
        }
        self.tracks.clear();
        self.programs.clear();
        self.current = None;
        self.main_audio = None;
        self.main_video = None;
        self.main_sub = None;
        self.record = None;
    }
}

/// 轨道复用器（ES 路由）
///
/// 持有全部节目与轨道，决定哪些轨道被选中、为选中轨道创建解码器，
/// 并实现缓冲/预滚动协议。所有状态在一把锁内，句柄可以廉价克隆后交给解复用器。
#[derive(Clone)]
pub struct EsOut {
    sys: Arc<Mutex<EsOutSys>>,
}

impl EsOut {
    pub fn new(config: &InputConfig, ctx: DecoderContext, events: EventBus) -> Self {
        let sys = EsOutSys {
            events,
            ctx,
            prefs: SelectionPrefs::from_config(config),
            mode: EsOutMode::Auto,
            active: false,
            wanted_program: config.program,
            partial_programs: config.programs.clone(),
            video_enabled: config.video,
            audio_enabled: config.audio,
            spu_enabled: config.spu,
            pending_es_id: None,
            programs: Vec::new(),
            current: None,
            tracks: Vec::new(),
            next_handle: 0,
            next_id: 0,
            video_count: 0,
            audio_count: 0,
            sub_count: 0,
            main_video: None,
            main_audio: None,
            main_sub: None,
            audio_delay: 0,
            spu_delay: 0,
            paused: false,
            pause_date: 0,
            rate: config.rate,
            pts_delay: 0,
            cr_average: config.cr_average,
            // 创建后即处于缓冲状态，直到第一次 PCR 足够
            buffering: true,
            buffering_extra_initial: 0,
            buffering_extra_stream: 0,
            buffering_extra_system: 0,
            preroll_end: None,
            cache_level: 0.0,
            can_pace_control: true,
            out_pace_control: false,
            output: None,
            record: None,
            record_path: config.record_path.clone().unwrap_or_else(|| ".".to_string()),
        };
        Self {
            sys: Arc::new(Mutex::new(sys)),
        }
    }

    // ========== 解复用器接口 ==========

    /// 注册新轨道并按策略自动选择
    pub fn add(&self, fmt: &EsFormat) -> Result<TrackHandle> {
        self.sys.lock().add_track(fmt, None)
    }

    /// 送入一个数据包；轨道未选中时静默丢弃
    pub fn send(&self, handle: TrackHandle, packet: Packet) -> Result<()> {
        self.sys.lock().send(handle, packet)
    }

    /// 删除轨道（有限等待其解码队列清空）
    pub fn del(&self, handle: TrackHandle) {
        self.sys.lock().del_track(handle)
    }

    pub fn control(&self, control: EsOutControl) -> Result<()> {
        self.sys.lock().control(control)
    }

    // ========== 常用控制 ==========

    pub fn set_pcr(&self, pcr: Tick) -> Result<()> {
        self.control(EsOutControl::SetPcr(pcr))
    }

    pub fn set_group_pcr(&self, group: i32, pcr: Tick) -> Result<()> {
        self.control(EsOutControl::SetGroupPcr { group, pcr })
    }

    pub fn change_position(&self) {
        self.sys.lock().change_position()
    }

    pub fn change_pause(&self, paused: bool, date: Tick) {
        self.sys.lock().change_pause(paused, date)
    }

    pub fn change_rate(&self, rate: i32) {
        self.sys.lock().change_rate(rate)
    }

    pub fn frame_next(&self) {
        self.sys.lock().frame_next()
    }

    pub fn set_delay(&self, category: EsCategory, delay: Tick) {
        self.sys.lock().set_delay(category, delay)
    }

    pub fn set_record(&self, record: bool) -> Result<()> {
        self.sys.lock().set_record(record)
    }

    pub fn set_times(&self, position: f64, time: Tick, length: Tick) {
        self.sys.lock().set_times(position, time, length)
    }

    pub fn set_jitter(&self, pts_delay: Tick, cr_average: i32) {
        self.sys.lock().set_jitter(pts_delay, cr_average)
    }

    pub fn set_group(&self, group: i32) -> Result<()> {
        self.control(EsOutControl::SetGroup(group))
    }

    pub fn set_es_by_id(&self, id: i32) {
        self.sys.lock().set_es_by_id(id)
    }

    pub fn set_active(&self, active: bool) {
        self.sys.lock().set_active(active)
    }

    pub fn set_mode(&self, mode: EsOutMode) {
        self.sys.lock().set_mode(mode)
    }

    /// 串流输出（None 表示本地渲染）
    pub fn set_stream_output(&self, output: Option<SharedMux>) {
        self.sys.lock().output = output;
    }

    pub fn set_pace_control(&self, can_pace_control: bool, out_pace_control: bool) {
        let mut sys = self.sys.lock();
        sys.can_pace_control = can_pace_control;
        sys.out_pace_control = out_pace_control;
    }

    /// 释放所有轨道、解码器与节目
    pub fn shutdown(&self) {
        self.sys.lock().shutdown()
    }

    // ========== 查询 ==========

    pub fn es_state(&self, handle: TrackHandle) -> bool {
        let sys = self.sys.lock();
        sys.track_index(handle).map(|i| sys.tracks[i].is_selected()).unwrap_or(false)
    }

    /// 输入线程下一次应当读取数据的系统时间（0 表示立即）
    pub fn wakeup(&self) -> Tick {
        self.sys.lock().wakeup()
    }

    pub fn is_buffering(&self) -> bool {
        self.sys.lock().buffering
    }

    /// 解码器是否都已排空（缓冲中会强制结束缓冲）
    pub fn is_empty(&self) -> bool {
        self.sys.lock().is_empty()
    }

    pub fn buffering_level(&self) -> f64 {
        self.sys.lock().cache_level
    }

    pub fn buffering_delay(&self) -> Tick {
        self.sys.lock().buffering_delay()
    }

    pub fn pts_delay(&self) -> Tick {
        self.sys.lock().pts_delay
    }

    pub fn rate(&self) -> i32 {
        self.sys.lock().rate
    }

    pub fn is_paused(&self) -> bool {
        self.sys.lock().paused
    }

    pub fn is_recording(&self) -> bool {
        self.sys.lock().record.is_some()
    }

    pub fn delay(&self, category: EsCategory) -> Tick {
        let sys = self.sys.lock();
        match category {
            EsCategory::Audio => sys.audio_delay,
            EsCategory::Subtitle => sys.spu_delay,
            _ => 0,
        }
    }

    pub fn current_program(&self) -> Option<i32> {
        self.sys.lock().current
    }

    pub fn program_clock(&self, group: i32) -> Option<Arc<ProgramClock>> {
        let sys = self.sys.lock();
        sys.programs.iter().find(|p| p.id == group).map(|p| p.clock.clone())
    }

    /// 某类当前的主轨道 ID
    pub fn selected(&self, category: EsCategory) -> Option<i32> {
        let sys = self.sys.lock();
        let handle = sys.main_of(category)?;
        let index = sys.track_index(handle)?;
        sys.tracks[index].is_selected().then_some(sys.tracks[index].id)
    }

    pub fn handle_of(&self, id: i32) -> Option<TrackHandle> {
        self.sys.lock().tracks.iter().find(|t| t.id == id).map(|t| t.handle)
    }

    /// 当前存在的解码器数量（含录制）
    pub fn decoder_count(&self) -> usize {
        let sys = self.sys.lock();
        sys.tracks
            .iter()
            .map(|t| t.decoder.is_some() as usize + t.record.is_some() as usize)
            .sum()
    }

    pub fn tracks(&self) -> Vec<TrackInfo> {
        self.sys.lock().tracks.iter().map(Track::info).collect()
    }

    pub fn programs(&self) -> Vec<ProgramInfo> {
        self.sys
            .lock()
            .programs
            .iter()
            .map(|p| ProgramInfo {
                id: p.id,
                name: p.name.clone(),
                now_playing: p.now_playing.clone(),
                selected: p.selected,
                scrambled: p.scrambled,
                tracks: p.tracks,
            })
            .collect()
    }

    pub fn program_epg(&self, group: i32) -> Option<Epg> {
        let sys = self.sys.lock();
        sys.programs.iter().find(|p| p.id == group).and_then(|p| p.epg.clone())
    }
}
