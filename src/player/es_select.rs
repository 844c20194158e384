use crate::core::{EsCategory, InputConfig};

/// 未知语言代码
pub const UNKNOWN_LANGUAGE: &str = "??";

/// (ISO 639-1, ISO 639-2/T, ISO 639-2/B, 名称)
const LANGUAGES: &[(&str, &str, &str, &str)] = &[
    ("ar", "ara", "ara", "Arabic"),
    ("cs", "ces", "cze", "Czech"),
    ("da", "dan", "dan", "Danish"),
    ("de", "deu", "ger", "German"),
    ("el", "ell", "gre", "Greek"),
    ("en", "eng", "eng", "English"),
    ("es", "spa", "spa", "Spanish"),
    ("fi", "fin", "fin", "Finnish"),
    ("fr", "fra", "fre", "French"),
    ("he", "heb", "heb", "Hebrew"),
    ("hi", "hin", "hin", "Hindi"),
    ("hu", "hun", "hun", "Hungarian"),
    ("it", "ita", "ita", "Italian"),
    ("ja", "jpn", "jpn", "Japanese"),
    ("ko", "kor", "kor", "Korean"),
    ("nl", "nld", "dut", "Dutch"),
    ("no", "nor", "nor", "Norwegian"),
    ("pl", "pol", "pol", "Polish"),
    ("pt", "por", "por", "Portuguese"),
    ("ru", "rus", "rus", "Russian"),
    ("sv", "swe", "swe", "Swedish"),
    ("tr", "tur", "tur", "Turkish"),
    ("zh", "zho", "chi", "Chinese"),
];

fn lookup(language: &str) -> Option<&'static (&'static str, &'static str, &'static str, &'static str)> {
    let language = language.trim();
    if language.is_empty() {
        return None;
    }
    LANGUAGES.iter().find(|(a, b, c, name)| {
        language.eq_ignore_ascii_case(a)
            || language.eq_ignore_ascii_case(b)
            || language.eq_ignore_ascii_case(c)
            || language.eq_ignore_ascii_case(name)
    })
}

/// 语言代码（ISO 639-2），无法识别时为 "??"
pub fn language_code(language: Option<&str>) -> String {
    language
        .and_then(lookup)
        .map(|entry| entry.1.to_string())
        .unwrap_or_else(|| UNKNOWN_LANGUAGE.to_string())
}

/// 可读的语言名；无法识别时原样返回
pub fn language_name(language: Option<&str>) -> String {
    match language {
        Some(l) => lookup(l).map(|entry| entry.3.to_string()).unwrap_or_else(|| l.trim().to_string()),
        None => String::new(),
    }
}

/// 拆分语言偏好列表（逗号分隔），识别不了的条目被忽略，"any" 保留
///
/// 列表为空时返回 None（表示没有偏好）
pub fn split_languages(list: &str) -> Option<Vec<String>> {
    let languages: Vec<String> = list
        .split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| {
            if l.eq_ignore_ascii_case("any") {
                Some("any".to_string())
            } else {
                lookup(l).map(|entry| entry.1.to_string())
            }
        })
        .collect();
    if languages.is_empty() {
        None
    } else {
        Some(languages)
    }
}

/// 语言代码在偏好列表中的位置；"any" 匹配任意语言
pub fn language_index(list: Option<&[String]>, code: &str) -> Option<usize> {
    list?
        .iter()
        .position(|l| l.eq_ignore_ascii_case(code) || l == "any")
}

/// 参与自动选择的轨道描述
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub category: EsCategory,
    pub id: i32,
    /// 同类轨道中的序号
    pub channel: i32,
    pub priority: i32,
    pub language_code: &'a str,
}

/// 用户的轨道选择偏好
#[derive(Debug, Clone)]
pub struct SelectionPrefs {
    pub audio_languages: Option<Vec<String>>,
    pub sub_languages: Option<Vec<String>>,
    /// 按序号指定（-1 不指定）
    pub audio_last: i32,
    pub sub_last: i32,
    /// 按 ID 指定（-1 不指定）
    pub audio_id: i32,
    pub sub_id: i32,
    /// 容器标记的默认字幕
    pub default_sub_id: i32,
}

impl Default for SelectionPrefs {
    fn default() -> Self {
        Self {
            audio_languages: None,
            sub_languages: None,
            audio_last: -1,
            sub_last: -1,
            audio_id: -1,
            sub_id: -1,
            default_sub_id: -1,
        }
    }
}

impl SelectionPrefs {
    pub fn from_config(config: &InputConfig) -> Self {
        Self {
            audio_languages: split_languages(&config.audio_language),
            sub_languages: split_languages(&config.sub_language),
            audio_last: config.audio_track,
            sub_last: config.sub_track,
            audio_id: config.audio_track_id,
            sub_id: config.sub_track_id,
            default_sub_id: -1,
        }
    }

    /// 自动模式下该轨道是否应当被选中
    ///
    /// main 为同类当前的主轨道（若有）
    pub fn auto_wants(&self, es: &Candidate, main: Option<&Candidate>) -> bool {
        let mut wanted = -1;

        match es.category {
            EsCategory::Audio => {
                let list = self.audio_languages.as_deref();
                let index = language_index(list, es.language_code);
                match main.filter(|m| m.priority >= es.priority) {
                    Some(main) => {
                        let current = language_index(list, main.language_code);
                        // 语言排序不优于当前主轨道时保持不变
                        match (index, current) {
                            (None, _) => return false,
                            (Some(i), Some(c)) if c <= i => return false,
                            _ => wanted = es.channel,
                        }
                    }
                    None => {
                        if index.is_some() || es.language_code == UNKNOWN_LANGUAGE || list.is_none() {
                            wanted = es.channel;
                        }
                    }
                }
                if self.audio_last >= 0 {
                    wanted = self.audio_last;
                }
                if self.audio_id >= 0 {
                    if es.id != self.audio_id {
                        return false;
                    }
                    wanted = es.channel;
                }
            }
            EsCategory::Subtitle => {
                let list = self.sub_languages.as_deref();
                let index = language_index(list, es.language_code);
                match main.filter(|m| m.priority >= es.priority) {
                    Some(main) => {
                        let current = language_index(list, main.language_code);
                        match (index, current) {
                            (None, _) => return false,
                            (Some(i), Some(c)) if c <= i => return false,
                            _ => wanted = es.channel,
                        }
                    }
                    None if index.is_some() => wanted = es.channel,
                    None if self.default_sub_id >= 0 => {
                        if es.id == self.default_sub_id {
                            wanted = es.channel;
                        }
                    }
                    None => {}
                }
                if self.sub_last >= 0 {
                    wanted = self.sub_last;
                }
                if self.sub_id >= 0 {
                    if es.id != self.sub_id {
                        return false;
                    }
                    wanted = es.channel;
                }
            }
            EsCategory::Video => wanted = es.channel,
            EsCategory::Unknown => {}
        }

        wanted == es.channel
    }
}
