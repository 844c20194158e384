use crate::core::{Attachment, InputError, Meta, NavState, Result, Tick, TitleInfo};
use crate::player::es_out::EsOut;
use crate::player::log_ctx;
use log::{debug, info};

/// 一次解复用的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxStatus {
    /// 还有数据
    More,
    /// 正常结束
    Eof,
}

/// 解复用器报告的待处理变化
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceUpdates {
    pub title: bool,
    pub seekpoint: bool,
    pub meta: bool,
    pub size: bool,
}

impl SourceUpdates {
    pub fn any(&self) -> bool {
        self.title || self.seekpoint || self.meta || self.size
    }
}

/// 源的能力
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub can_pause: bool,
    /// 能否按播放节奏读取（本地文件可以，直播流不行）
    pub can_pace_control: bool,
    /// 不能控制节奏时，能否由源自己变速
    pub can_rate_control: bool,
    pub can_seek: bool,
}

/// 解复用器要输出的节目
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Group {
    All,
    List(Vec<i32>),
    Id(i32),
}

fn unsupported<T>(what: &'static str) -> Result<T> {
    Err(InputError::Unsupported(what))
}

/// 解复用器（外部协作者）
///
/// `demux` 每次处理一个单元，并通过 es_out 声明轨道、送出数据包与 PCR
pub trait Demux: Send {
    fn demux(&mut self, out: &EsOut) -> Result<DemuxStatus>;

    fn capabilities(&self) -> Capabilities;

    fn position(&self) -> Option<f64> {
        None
    }

    fn time(&self) -> Option<Tick> {
        None
    }

    fn length(&self) -> Option<Tick> {
        None
    }

    /// 标题表；返回 Some 表示由解复用器负责标题/章节
    fn titles(&self) -> Option<Vec<TitleInfo>> {
        None
    }

    fn attachments(&self) -> Option<Vec<Attachment>> {
        None
    }

    fn meta(&self) -> Option<Meta> {
        None
    }

    /// 源建议的缓存时长
    fn pts_delay(&self) -> Option<Tick> {
        None
    }

    fn nav(&self) -> NavState {
        NavState::default()
    }

    /// 取出并清除待处理的变化标志
    fn take_updates(&mut self) -> SourceUpdates {
        SourceUpdates::default()
    }

    fn set_position(&mut self, _position: f64) -> Result<()> {
        unsupported("set_position")
    }

    fn set_time(&mut self, _time: Tick) -> Result<()> {
        unsupported("set_time")
    }

    fn set_title(&mut self, _title: usize) -> Result<()> {
        unsupported("set_title")
    }

    fn set_seekpoint(&mut self, _seekpoint: usize) -> Result<()> {
        unsupported("set_seekpoint")
    }

    /// 由源自己变速，返回实际生效的速率
    fn set_rate(&mut self, _rate: i32) -> Result<i32> {
        unsupported("set_rate")
    }

    fn set_pause_state(&mut self, _paused: bool) -> Result<()> {
        unsupported("set_pause_state")
    }

    fn set_group(&mut self, _group: &Group) -> Result<()> {
        unsupported("set_group")
    }

    /// 从属源：下一次 demux 读到这个时间为止
    fn set_next_demux_time(&mut self, _time: Tick) -> Result<()> {
        unsupported("set_next_demux_time")
    }
}

/// 访问层（可选）：负责读取、暂停，以及部分源的标题/章节
pub trait Access: Send {
    fn capabilities(&self) -> Capabilities;

    fn pts_delay(&self) -> Option<Tick> {
        None
    }

    fn titles(&self) -> Option<Vec<TitleInfo>> {
        None
    }

    fn meta(&self) -> Option<Meta> {
        None
    }

    fn nav(&self) -> NavState {
        NavState::default()
    }

    fn take_updates(&mut self) -> SourceUpdates {
        SourceUpdates::default()
    }

    fn set_title(&mut self, _title: usize) -> Result<()> {
        unsupported("set_title")
    }

    fn set_seekpoint(&mut self, _seekpoint: usize) -> Result<()> {
        unsupported("set_seekpoint")
    }

    fn set_pause_state(&mut self, _paused: bool) -> Result<()> {
        unsupported("set_pause_state")
    }
}

/// 打开源（外部协作者）
pub trait SourceOpener: Send + Sync {
    /// hint 为解复用器提示，如 "subtitle"
    fn open(&self, location: &str, hint: Option<&str>, out: &EsOut) -> Result<Source>;
}

/// 一个已打开的源（主源或从属源）
pub struct Source {
    location: String,
    pub demux: Box<dyn Demux>,
    pub access: Option<Box<dyn Access>>,
    caps: Capabilities,
    titles: Vec<TitleInfo>,
    /// 标题/章节由解复用器负责
    title_demux: bool,
    pts_delay: Tick,
    pub eof: bool,
}

impl Source {
    pub fn new(location: &str, demux: Box<dyn Demux>) -> Self {
        let mut source = Self {
            location: location.to_string(),
            demux,
            access: None,
            caps: Capabilities::default(),
            titles: Vec::new(),
            title_demux: false,
            pts_delay: 0,
            eof: false,
        };
        source.refresh();
        source
    }

    pub fn with_access(mut self, access: Box<dyn Access>) -> Self {
        self.access = Some(access);
        self.refresh();
        self
    }

    /// 重新读取能力与标题表；有访问层时暂停与节奏由访问层决定
    fn refresh(&mut self) {
        self.caps = match self.access.as_ref() {
            Some(access) => {
                let mut caps = access.capabilities();
                caps.can_seek |= self.demux.capabilities().can_seek;
                caps
            }
            None => self.demux.capabilities(),
        };

        match self.demux.titles() {
            Some(titles) => {
                self.titles = titles;
                self.title_demux = true;
            }
            None => {
                self.titles = self.access.as_ref().and_then(|a| a.titles()).unwrap_or_default();
                self.title_demux = false;
            }
        }

        self.pts_delay = self
            .access
            .as_ref()
            .and_then(|a| a.pts_delay())
            .or_else(|| self.demux.pts_delay())
            .unwrap_or(0)
            .max(0);
        debug!(
            "{} 📂 源 {}: {:?}, {} 个标题",
            log_ctx(),
            self.location,
            self.caps,
            self.titles.len()
        );
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    pub fn titles(&self) -> &[TitleInfo] {
        &self.titles
    }

    pub fn reload_titles(&mut self) {
        self.refresh();
    }

    pub fn is_title_demux(&self) -> bool {
        self.title_demux
    }

    pub fn pts_delay(&self) -> Tick {
        self.pts_delay
    }

    /// 当前标题/章节，按负责标题的一层读取
    pub fn nav(&self) -> NavState {
        match (self.title_demux, self.access.as_ref()) {
            (false, Some(access)) => access.nav(),
            _ => self.demux.nav(),
        }
    }

    pub fn set_pause(&mut self, paused: bool) -> Result<()> {
        match self.access.as_mut() {
            Some(access) => access.set_pause_state(paused),
            None => self.demux.set_pause_state(paused),
        }
    }

    pub fn set_title(&mut self, title: usize) -> Result<()> {
        if title >= self.titles.len() {
            return Err(InputError::Other(format!("标题 {} 超出范围", title)));
        }
        match (self.title_demux, self.access.as_mut()) {
            (false, Some(access)) => access.set_title(title),
            _ => self.demux.set_title(title),
        }
    }

    pub fn set_seekpoint(&mut self, seekpoint: usize) -> Result<()> {
        let title = self.nav().title;
        let count = self.titles.get(title).map(|t| t.seekpoints.len()).unwrap_or(0);
        if seekpoint >= count {
            return Err(InputError::Other(format!("章节 {} 超出范围", seekpoint)));
        }
        match (self.title_demux, self.access.as_mut()) {
            (false, Some(access)) => access.set_seekpoint(seekpoint),
            _ => self.demux.set_seekpoint(seekpoint),
        }
    }

    /// 合并解复用器与访问层的元数据（解复用器优先）
    pub fn meta(&self) -> Meta {
        let mut meta = self.access.as_ref().and_then(|a| a.meta()).unwrap_or_default();
        if let Some(demux_meta) = self.demux.meta() {
            meta.merge(&demux_meta);
        }
        meta
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        info!("{} 📕 关闭源: {}", log_ctx(), self.location);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Seekpoint;

    struct TitledDemux;

    impl Demux for TitledDemux {
        fn demux(&mut self, _out: &EsOut) -> Result<DemuxStatus> {
            Ok(DemuxStatus::Eof)
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                can_seek: true,
                ..Default::default()
            }
        }
        fn titles(&self) -> Option<Vec<TitleInfo>> {
            Some(vec![TitleInfo {
                name: Some("main".into()),
                length: 0,
                seekpoints: vec![Seekpoint {
                    name: None,
                    time_offset: 0,
                }],
            }])
        }
        fn set_title(&mut self, _title: usize) -> Result<()> {
            Ok(())
        }
    }

    struct PausableAccess;

    impl Access for PausableAccess {
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                can_pause: true,
                can_pace_control: true,
                ..Default::default()
            }
        }
        fn titles(&self) -> Option<Vec<TitleInfo>> {
            Some(vec![TitleInfo::default(), TitleInfo::default()])
        }
        fn pts_delay(&self) -> Option<Tick> {
            Some(-5)
        }
        fn set_pause_state(&mut self, _paused: bool) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn demux_titles_take_precedence() {
        let source = Source::new("file:///a.mkv", Box::new(TitledDemux)).with_access(Box::new(PausableAccess));
        assert!(source.is_title_demux());
        assert_eq!(source.titles().len(), 1);
        assert!(source.capabilities().can_pause);
        assert!(source.capabilities().can_seek);
        assert_eq!(source.pts_delay(), 0);
    }

    #[test]
    fn pause_goes_through_access() {
        let mut source = Source::new("x", Box::new(TitledDemux));
        assert!(source.set_pause(true).is_err());
        let mut source = source.with_access(Box::new(PausableAccess));
        assert!(source.set_pause(true).is_ok());
    }

    #[test]
    fn out_of_range_title_is_rejected() {
        let mut source = Source::new("x", Box::new(TitledDemux));
        assert!(source.set_title(0).is_ok());
        assert!(source.set_title(1).is_err());
        assert!(source.set_seekpoint(3).is_err());
    }
}
