use crate::core::{InputError, Result, Tick, CLOCK_FREQ, RATE_DEFAULT, RATE_MAX, RATE_MIN};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 输入引擎配置
///
/// 可从 JSON 加载（缺失字段取默认值），也可以用 `with_*` 链式构造
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// 媒体资源定位（可带 @标题:章节 段）
    pub mrl: String,

    // ========== 缓冲与时钟 ==========
    /// 延迟预算（毫秒），源未给出缓存值时使用
    pub pts_delay_ms: i64,
    /// 漂移估计的平均窗口（采样数）
    pub cr_average: i32,
    /// 音频去同步（毫秒），为负时加大缓冲
    pub audio_desync_ms: i64,
    /// 初始速率
    pub rate: i32,

    // ========== 播放范围 ==========
    /// 重复次数，-1 表示无限循环
    pub input_repeat: i32,
    /// 起始时间（秒）
    pub start_time: i64,
    /// 结束时间（秒），0 表示不限
    pub stop_time: i64,
    /// 最长运行时间（秒），0 表示不限
    pub run_time: i64,

    // ========== 轨道选择 ==========
    /// 音频语言偏好，逗号分隔，支持 "any"
    pub audio_language: String,
    /// 字幕语言偏好
    pub sub_language: String,
    /// 按通道序号选择音频轨（-1 不指定）
    pub audio_track: i32,
    pub sub_track: i32,
    /// 按轨道 ID 选择（-1 不指定）
    pub audio_track_id: i32,
    pub sub_track_id: i32,
    /// 自动选中的节目 ID（-1 表示第一个）
    pub program: i32,
    /// 部分模式下输出的节目列表
    pub programs: Vec<i32>,
    pub video: bool,
    pub audio: bool,
    pub spu: bool,

    // ========== 输出 ==========
    /// 串流输出目标，非空时由复用器接收数据包
    pub sout: Option<String>,
    /// 串流时输出所有轨道
    pub sout_all: bool,
    /// 录制文件所在目录
    pub record_path: Option<String>,

    // ========== 附加源 ==========
    /// 从属源，'#' 分隔
    pub input_slave: Option<String>,
    /// 强制加载的字幕文件
    pub sub_file: Option<String>,

    // ========== 用户元数据 ==========
    pub meta_title: Option<String>,
    pub meta_artist: Option<String>,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            mrl: String::new(),
            pts_delay_ms: 300,
            cr_average: 40,
            audio_desync_ms: 0,
            rate: RATE_DEFAULT,
            input_repeat: 0,
            start_time: 0,
            stop_time: 0,
            run_time: 0,
            audio_language: String::new(),
            sub_language: String::new(),
            audio_track: -1,
            sub_track: -1,
            audio_track_id: -1,
            sub_track_id: -1,
            program: -1,
            programs: Vec::new(),
            video: true,
            audio: true,
            spu: true,
            sout: None,
            sout_all: false,
            record_path: None,
            input_slave: None,
            sub_file: None,
            meta_title: None,
            meta_artist: None,
        }
    }
}

impl InputConfig {
    pub fn new(mrl: &str) -> Self {
        Self {
            mrl: mrl.to_string(),
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: InputConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// 检查明显不合法的组合
    pub fn validate(&self) -> Result<()> {
        if self.cr_average <= 0 {
            return Err(InputError::ConfigError(format!("cr_average 必须为正: {}", self.cr_average)));
        }
        if !(RATE_MIN..=RATE_MAX).contains(&self.rate) {
            return Err(InputError::ConfigError(format!("速率超出范围: {}", self.rate)));
        }
        if self.input_repeat < -1 {
            return Err(InputError::ConfigError(format!("无效的重复次数: {}", self.input_repeat)));
        }
        Ok(())
    }

    pub fn with_pts_delay_ms(mut self, ms: i64) -> Self {
        self.pts_delay_ms = ms;
        self
    }

    pub fn with_repeat(mut self, repeat: i32) -> Self {
        self.input_repeat = repeat;
        self
    }

    pub fn with_times(mut self, start: i64, stop: i64, run: i64) -> Self {
        self.start_time = start;
        self.stop_time = stop;
        self.run_time = run;
        self
    }

    pub fn with_audio_language(mut self, languages: &str) -> Self {
        self.audio_language = languages.to_string();
        self
    }

    pub fn with_sub_language(mut self, languages: &str) -> Self {
        self.sub_language = languages.to_string();
        self
    }

    pub fn with_audio_track_id(mut self, id: i32) -> Self {
        self.audio_track_id = id;
        self
    }

    pub fn with_sub_track_id(mut self, id: i32) -> Self {
        self.sub_track_id = id;
        self
    }

    pub fn with_program(mut self, program: i32) -> Self {
        self.program = program;
        self
    }

    pub fn with_sout(mut self, target: &str, all: bool) -> Self {
        self.sout = Some(target.to_string());
        self.sout_all = all;
        self
    }

    pub fn with_record_path(mut self, path: &str) -> Self {
        self.record_path = Some(path.to_string());
        self
    }

    pub fn with_slaves(mut self, slaves: &str) -> Self {
        self.input_slave = Some(slaves.to_string());
        self
    }

    pub fn with_sub_file(mut self, path: &str) -> Self {
        self.sub_file = Some(path.to_string());
        self
    }

    pub fn pts_delay(&self) -> Tick {
        self.pts_delay_ms.max(0) * 1000
    }

    pub fn start(&self) -> Tick {
        self.start_time * CLOCK_FREQ
    }

    pub fn stop(&self) -> Tick {
        self.stop_time * CLOCK_FREQ
    }

    pub fn run(&self) -> Tick {
        self.run_time * CLOCK_FREQ
    }

    /// 拆分 '#' 分隔的从属源列表
    pub fn slave_list(&self) -> Vec<String> {
        self.input_slave
            .as_deref()
            .map(|s| {
                s.split('#')
                    .map(|p| p.trim())
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}
