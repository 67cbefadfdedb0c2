//! Encoded queries for the `sys_cs_message` table.

use chrono::{DateTime, NaiveDateTime};

/// Table API datetime format; values are UTC.
const GLIDE_DATETIME: &str = "%Y-%m-%d %H:%M:%S";

/// Outbound agent text messages for one conversation, oldest first, so a
/// limited page never skips records older than the ones it returns.
/// `since` is inclusive.
pub(crate) fn agent_messages(conversation: &str, since: Option<&str>) -> String {
    let mut query = format!(
        "q_data_message_type=systemTextMessage^direction=outbound^is_agent=true^conversation={conversation}"
    );
    if let Some(since) = since.and_then(glide_datetime) {
        query.push_str("^send_time>=");
        query.push_str(&since);
    }
    query.push_str("^ORDERBYsend_time");
    query
}

/// Accepts RFC 3339 or an already-formatted table datetime.
fn glide_datetime(raw: &str) -> Option<String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_utc().format(GLIDE_DATETIME).to_string());
    }
    NaiveDateTime::parse_from_str(raw, GLIDE_DATETIME)
        .ok()
        .map(|ts| ts.format(GLIDE_DATETIME).to_string())
}
