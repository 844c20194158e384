use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 时间戳（微秒）
pub type Tick = i64;

/// 每秒的 Tick 数
pub const CLOCK_FREQ: Tick = 1_000_000;

/// 毫秒转 Tick
pub const fn ms(v: i64) -> Tick {
    v * 1000
}

/// 默认速率（不变速）
///
/// 速率数值 = 系统时间相对流时间的斜率 × 1000：
/// 2000 表示半速播放，500 表示两倍速播放
pub const RATE_DEFAULT: i32 = 1000;
pub const RATE_MIN: i32 = RATE_DEFAULT / 32;
pub const RATE_MAX: i32 = RATE_DEFAULT * 32;

/// 基本流类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EsCategory {
    Unknown,
    Video,
    Audio,
    Subtitle,
}

impl EsCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EsCategory::Unknown => "unknown",
            EsCategory::Video => "video",
            EsCategory::Audio => "audio",
            EsCategory::Subtitle => "subtitle",
        }
    }
}

impl fmt::Display for EsCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 音频参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
}

/// 视频参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
}

/// 图文电视字幕的编码标识
pub const TELETEXT_CODEC: &str = "telx";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeletextParams {
    pub magazine: i32,
    /// 页号（BCD，按十六进制显示）
    pub page: i32,
}

/// 基本流格式描述（由解复用器声明）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EsFormat {
    pub category: EsCategory,
    /// 编码标识（fourcc 风格，如 "h264"、"mp4a"、"cc1"）
    pub codec: String,
    /// 轨道 ID，小于 0 表示自动分配
    pub id: i32,
    /// 所属节目 ID
    pub group: i32,
    /// 优先级，小于 0 表示从不自动选中
    pub priority: i32,
    pub language: Option<String>,
    pub description: Option<String>,
    pub audio: Option<AudioParams>,
    pub video: Option<VideoParams>,
    /// 图文电视页（仅 "telx" 字幕）
    #[serde(default)]
    pub teletext: Option<TeletextParams>,
    /// 解码器私有数据（部分容器会在播放中更新）
    pub extra: Vec<u8>,
}

impl EsFormat {
    pub fn new(category: EsCategory, codec: &str) -> Self {
        Self {
            category,
            codec: codec.to_string(),
            id: -1,
            group: 0,
            priority: 0,
            language: None,
            description: None,
            audio: None,
            video: None,
            teletext: None,
            extra: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: i32) -> Self {
        self.id = id;
        self
    }

    pub fn with_group(mut self, group: i32) -> Self {
        self.group = group;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_audio(mut self, sample_rate: u32, channels: u16) -> Self {
        self.audio = Some(AudioParams { sample_rate, channels });
        self
    }

    pub fn with_teletext(mut self, magazine: i32, page: i32) -> Self {
        self.teletext = Some(TeletextParams { magazine, page });
        self
    }

    pub fn is_teletext(&self) -> bool {
        self.category == EsCategory::Subtitle && self.codec == TELETEXT_CODEC
    }

    /// 初始页号，如 "100"；杂志号未知时为 None
    pub fn teletext_page(&self) -> Option<String> {
        self.teletext
            .filter(|t| t.magazine >= 0)
            .map(|t| format!("{}{:02x}", t.magazine, t.page))
    }

    pub fn with_video(mut self, width: u32, height: u32) -> Self {
        self.video = Some(VideoParams {
            width,
            height,
            frame_rate_num: 25,
            frame_rate_den: 1,
        });
        self
    }
}

/// 数据包标志
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags {
    /// 数据不连续（seek 之后的第一个包等）
    pub discontinuity: bool,
    /// 预滚动：解码但不渲染
    pub preroll: bool,
    pub corrupted: bool,
}

/// 压缩数据包（解复用器输出）
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub data: Vec<u8>,
    pub pts: Option<Tick>,
    pub dts: Option<Tick>,
    pub duration: Tick,
    pub flags: PacketFlags,
}

impl Packet {
    pub fn new(data: Vec<u8>, pts: Option<Tick>, dts: Option<Tick>) -> Self {
        Self {
            data,
            pts,
            dts,
            duration: 0,
            flags: PacketFlags::default(),
        }
    }

    /// 用于预滚动判断的时间：优先 pts，缺失时退回 dts
    pub fn date(&self) -> Option<Tick> {
        self.pts.or(self.dts)
    }
}

/// 解码后的帧（交给渲染端）
#[derive(Debug, Clone)]
pub struct Frame {
    pub category: EsCategory,
    pub pts: Tick,
    pub duration: Tick,
    pub data: Vec<u8>,
}

/// 输入状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputState {
    Init,
    Opening,
    Buffering,
    Playing,
    Paused,
    End,
    Error,
}

impl InputState {
    /// 终止状态之后不再接受状态迁移（Error 仍可转入 End 用于清理）
    pub fn is_terminal(&self) -> bool {
        matches!(self, InputState::End | InputState::Error)
    }
}

/// 媒体元数据
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub now_playing: Option<String>,
    pub publisher: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl Meta {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.now_playing.is_none()
            && self.publisher.is_none()
            && self.extra.is_empty()
    }

    /// 合并：other 中存在的字段覆盖当前值
    pub fn merge(&mut self, other: &Meta) {
        if other.title.is_some() {
            self.title = other.title.clone();
        }
        if other.artist.is_some() {
            self.artist = other.artist.clone();
        }
        if other.now_playing.is_some() {
            self.now_playing = other.now_playing.clone();
        }
        if other.publisher.is_some() {
            self.publisher = other.publisher.clone();
        }
        for (k, v) in &other.extra {
            self.extra.insert(k.clone(), v.clone());
        }
    }
}

/// 章节（seekpoint）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seekpoint {
    pub name: Option<String>,
    /// 相对标题起点的时间偏移，小于 0 表示未知
    pub time_offset: Tick,
}

/// 标题
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TitleInfo {
    pub name: Option<String>,
    pub length: Tick,
    pub seekpoints: Vec<Seekpoint>,
}

/// 节目指南中的一个节目事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpgEvent {
    /// 开始时间（Unix 秒）
    pub start: i64,
    /// 时长（秒）
    pub duration: i32,
    pub name: String,
    pub short_description: Option<String>,
}

/// 电子节目指南（EPG）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epg {
    pub name: Option<String>,
    /// 按开始时间排序
    pub events: Vec<EpgEvent>,
    /// 正在播出的事件的开始时间
    pub current: Option<i64>,
}

impl Epg {
    pub fn new(name: Option<String>) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    /// 合并另一份节目表：同一开始时间的事件被替换，正在播出的事件以新表为准
    pub fn merge(&mut self, other: &Epg) {
        for event in &other.events {
            match self.events.binary_search_by_key(&event.start, |e| e.start) {
                Ok(i) => self.events[i] = event.clone(),
                Err(i) => self.events.insert(i, event.clone()),
            }
        }
        self.current = other.current.filter(|start| self.events.iter().any(|e| e.start == *start));
    }

    pub fn current_event(&self) -> Option<&EpgEvent> {
        let start = self.current?;
        self.events.iter().find(|e| e.start == start)
    }
}

/// 附件（字体、封面等）
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub mime: String,
    pub data: Vec<u8>,
}

/// 当前标题/章节
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NavState {
    pub title: usize,
    pub seekpoint: usize,
}

/// 轨道快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: i32,
    pub category: EsCategory,
    pub codec: String,
    pub group: i32,
    pub name: String,
    pub language: String,
    pub selected: bool,
    pub scrambled: bool,
}

/// 节目快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramInfo {
    pub id: i32,
    pub name: Option<String>,
    pub now_playing: Option<String>,
    pub selected: bool,
    pub scrambled: bool,
    pub tracks: usize,
}

/// 输入统计信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputStats {
    pub demux_read_packets: u64,
    pub demux_read_bytes: u64,
    /// 最近一个统计周期的解复用码率（字节/秒）
    pub demux_bitrate: f64,
    pub decoded_video: u64,
    pub decoded_audio: u64,
    pub decoded_sub: u64,
    pub displayed_pictures: u64,
    pub lost_pictures: u64,
    pub played_abuffers: u64,
    pub lost_abuffers: u64,
    pub decode_errors: u64,
}

/// 输入整体快照（只读）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSnapshot {
    pub state: InputState,
    pub position: f64,
    pub time: Tick,
    pub length: Tick,
    pub rate: i32,
    pub buffering: f64,
    pub nav: NavState,
    pub titles: usize,
    pub audio_delay: Tick,
    pub spu_delay: Tick,
    pub recording: bool,
    pub can_pause: bool,
    pub can_seek: bool,
    pub meta: Meta,
    pub tracks: Vec<TrackInfo>,
    pub programs: Vec<ProgramInfo>,
    pub stats: InputStats,
}

impl Default for InputSnapshot {
    fn default() -> Self {
        Self {
            state: InputState::Init,
            position: 0.0,
            time: 0,
            length: 0,
            rate: RATE_DEFAULT,
            buffering: 0.0,
            nav: NavState::default(),
            titles: 0,
            audio_delay: 0,
            spu_delay: 0,
            recording: false,
            can_pause: false,
            can_seek: false,
            meta: Meta::default(),
            tracks: Vec::new(),
            programs: Vec::new(),
            stats: InputStats::default(),
        }
    }
}

/// 媒体资源定位（MRL）
///
/// 语法：`location[@title-start[:chapter-start][-title-end[:chapter-end]]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mrl {
    pub location: String,
    pub title_start: Option<usize>,
    pub chapter_start: Option<usize>,
    pub title_end: Option<usize>,
    pub chapter_end: Option<usize>,
}

impl Mrl {
    /// 解析 MRL；章节段不合法时整个字符串都当作 location
    pub fn parse(mrl: &str) -> Self {
        let plain = Self {
            location: mrl.to_string(),
            title_start: None,
            chapter_start: None,
            title_end: None,
            chapter_end: None,
        };

        let Some(at) = mrl.rfind('@') else {
            return plain;
        };
        let section = &mrl[at + 1..];
        if section.is_empty() || !Self::is_section(section) {
            return plain;
        }

        let (start, end) = match section.split_once('-') {
            Some((s, e)) => (s, Some(e)),
            None => (section, None),
        };
        let (title_start, chapter_start) = Self::split_pair(start);
        let (title_end, chapter_end) = match end {
            Some(e) => Self::split_pair(e),
            None => (title_start, chapter_start),
        };

        Self {
            location: mrl[..at].to_string(),
            title_start,
            chapter_start,
            title_end,
            chapter_end,
        }
    }

    /// 检查 `[t][:c][-[t][:c]]` 结构
    fn is_section(section: &str) -> bool {
        let mut halves = section.splitn(2, '-');
        let ok_half = |half: &str| {
            let mut parts = half.splitn(2, ':');
            let title_ok = parts
                .next()
                .map(|t| t.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(true);
            let chapter_ok = parts
                .next()
                .map(|c| c.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(true);
            title_ok && chapter_ok
        };
        let first = halves.next().map(ok_half).unwrap_or(true);
        let second = halves.next().map(ok_half).unwrap_or(true);
        first && second
    }

    fn split_pair(half: &str) -> (Option<usize>, Option<usize>) {
        let (t, c) = match half.split_once(':') {
            Some((t, c)) => (t, Some(c)),
            None => (half, None),
        };
        (t.parse().ok(), c.and_then(|c| c.parse().ok()))
    }

    pub fn has_sections(&self) -> bool {
        self.title_start.is_some()
            || self.chapter_start.is_some()
            || self.title_end.is_some()
            || self.chapter_end.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("movie.mkv", "movie.mkv", None, None, None, None)]
    #[case("dvd:///dev/sr0@2", "dvd:///dev/sr0", Some(2), None, Some(2), None)]
    #[case("dvd:///dev/sr0@1:3", "dvd:///dev/sr0", Some(1), Some(3), Some(1), Some(3))]
    #[case("dvd:///dev/sr0@1:3-2:5", "dvd:///dev/sr0", Some(1), Some(3), Some(2), Some(5))]
    #[case("dvd:///dev/sr0@:4", "dvd:///dev/sr0", None, Some(4), None, Some(4))]
    #[case("user@host/file.ts", "user@host/file.ts", None, None, None, None)]
    fn mrl_sections(
        #[case] input: &str,
        #[case] location: &str,
        #[case] title_start: Option<usize>,
        #[case] chapter_start: Option<usize>,
        #[case] title_end: Option<usize>,
        #[case] chapter_end: Option<usize>,
    ) {
        let mrl = Mrl::parse(input);
        assert_eq!(mrl.location, location);
        assert_eq!(mrl.title_start, title_start);
        assert_eq!(mrl.chapter_start, chapter_start);
        assert_eq!(mrl.title_end, title_end);
        assert_eq!(mrl.chapter_end, chapter_end);
    }

    fn event(start: i64, name: &str) -> EpgEvent {
        EpgEvent {
            start,
            duration: 1800,
            name: name.to_string(),
            short_description: None,
        }
    }

    #[test]
    fn epg_merge_replaces_same_start_and_follows_current() {
        let mut epg = Epg::new(Some("频道".to_string()));
        epg.merge(&Epg {
            name: None,
            events: vec![event(200, "新闻"), event(100, "早间")],
            current: Some(100),
        });
        assert_eq!(epg.events.iter().map(|e| e.start).collect::<Vec<_>>(), vec![100, 200]);
        assert_eq!(epg.current_event().map(|e| e.name.as_str()), Some("早间"));

        epg.merge(&Epg {
            name: None,
            events: vec![event(200, "午间新闻")],
            current: Some(200),
        });
        assert_eq!(epg.events.len(), 2);
        assert_eq!(epg.current_event().map(|e| e.name.as_str()), Some("午间新闻"));

        epg.merge(&Epg::default());
        assert!(epg.current_event().is_none());
    }

    #[rstest]
    #[case(Some((1, 0x00)), Some("100"))]
    #[case(Some((8, 0x88)), Some("888"))]
    #[case(Some((-1, 0x00)), None)]
    #[case(None, None)]
    fn teletext_page_label(#[case] params: Option<(i32, i32)>, #[case] expected: Option<&str>) {
        let mut fmt = EsFormat::new(EsCategory::Subtitle, TELETEXT_CODEC);
        if let Some((magazine, page)) = params {
            fmt = fmt.with_teletext(magazine, page);
        }
        assert!(fmt.is_teletext());
        assert_eq!(fmt.teletext_page().as_deref(), expected);
    }

    #[test]
    fn meta_merge_keeps_existing_fields() {
        let mut meta = Meta {
            title: Some("a".into()),
            artist: Some("b".into()),
            ..Default::default()
        };
        let other = Meta {
            title: Some("c".into()),
            ..Default::default()
        };
        meta.merge(&other);
        assert_eq!(meta.title.as_deref(), Some("c"));
        assert_eq!(meta.artist.as_deref(), Some("b"));
    }

    #[test]
    fn packet_date_falls_back_to_dts() {
        let p = Packet::new(vec![], None, Some(42));
        assert_eq!(p.date(), Some(42));
    }
}
