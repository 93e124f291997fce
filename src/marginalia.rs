//! 추적 주석(marginalia)
//!
//! writer가 보내는 모든 문장 앞에 `/*<태그>*/ ` 주석을 붙입니다.
//! MySQL은 ROWS_QUERY 이벤트에 문장을 받은 그대로 기록하므로,
//! binlog에서 읽은 문장 텍스트에도 같은 주석이 남습니다.

use regex::Regex;
use std::sync::OnceLock;

pub const DEFAULT_MARGINALIA: &str = "application:mysql_ferry";

fn annotation_regex() -> &'static Regex {
    static ANNOTATION: OnceLock<Regex> = OnceLock::new();
    ANNOTATION.get_or_init(|| Regex::new(r"(?s)^/\*(.*?)\*/ (.*)$").expect("valid marginalia regex"))
}

/// `/*<marginalia>*/ <statement>`
pub fn annotate(marginalia: &str, statement: &str) -> String {
    format!("/*{}*/ {}", marginalia, statement)
}

/// 주석이 붙은 문장을 (태그, 원본 문장)으로 분리
pub fn split(query: &str) -> Option<(&str, &str)> {
    let captures = annotation_regex().captures(query)?;
    Some((captures.get(1)?.as_str(), captures.get(2)?.as_str()))
}
