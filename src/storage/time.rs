use crate::error::QuotaError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
const LEGACY_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Fixed-width UTC timestamp (`YYYY-MM-DDTHH:MM:SSZ`); lexical order equals time order.
pub fn to_iso8601_utc_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn to_date_string(d: &NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

pub fn parse_date_string(s: &str) -> crate::error::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|e| QuotaError::TimeParse(e.to_string()))
}

/// 解析时间字符串为 UTC：
/// - 优先 RFC3339 / ISO-8601（带时区偏移或 `Z`）
/// - 兼容 `YYYY-MM-DD HH:mm:ss(.f)?(+/-offset)`
/// - 无偏移的 `YYYY-MM-DD HH:mm:ss` 按 UTC 解释
pub fn parse_datetime_string(s: &str) -> crate::error::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    fn normalize_trailing_offset(raw: &str) -> Option<String> {
        let pos = raw.rfind(['+', '-'])?;
        let (prefix, offset) = raw.split_at(pos);
        if offset.contains(':') {
            return None;
        }
        match offset.len() {
            // +HH / -HH
            3 => Some(format!("{prefix}{offset}:00")),
            // +HHMM / -HHMM
            5 => Some(format!("{prefix}{}:{}", &offset[..3], &offset[3..])),
            _ => None,
        }
    }

    if let Some(stripped) = s.strip_suffix(" UTC") {
        let naive = NaiveDateTime::parse_from_str(stripped, LEGACY_DATETIME_FORMAT)
            .map_err(|e| QuotaError::TimeParse(e.to_string()))?;
        return Ok(Utc.from_utc_datetime(&naive));
    }

    let candidates = [Some(s.to_string()), normalize_trailing_offset(s)];
    for cand in candidates.into_iter().flatten() {
        for fmt in [
            "%Y-%m-%d %H:%M:%S%:z",
            "%Y-%m-%d %H:%M:%S%.f%:z",
            "%Y-%m-%d %H:%M:%S%z",
            "%Y-%m-%d %H:%M:%S%.f%z",
        ] {
            if let Ok(dt) = DateTime::parse_from_str(&cand, fmt) {
                return Ok(dt.with_timezone(&Utc));
            }
        }
    }

    let naive = NaiveDateTime::parse_from_str(s, LEGACY_DATETIME_FORMAT)
        .map_err(|e| QuotaError::TimeParse(format!("{s}: {e}")))?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Wraps a parse failure so it can be returned from a `rusqlite` row mapper.
pub fn sql_conversion_error(idx: usize, e: QuotaError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
    )
}
