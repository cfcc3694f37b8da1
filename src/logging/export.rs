use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rusqlite::Connection;
use serde::Serialize;

use super::RequestRecord;
use crate::error::Result;

#[derive(Debug, Serialize)]
struct LogEntry {
    id: i64,
    timestamp: String,
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    /// `"utf8"` or `"base64"`.
    body_encoding: &'static str,
    body: String,
    response_status: Option<u16>,
    response_body_encoding: Option<&'static str>,
    response_body: Option<String>,
}

impl From<&RequestRecord> for LogEntry {
    fn from(record: &RequestRecord) -> Self {
        let (body_encoding, body) = encode_body(&record.body);
        let response = record.response_body.as_deref().map(encode_body);
        LogEntry {
            id: record.id.unwrap_or(0),
            timestamp: record.timestamp.clone(),
            method: record.method.clone(),
            path: record.path.clone(),
            headers: record.headers.clone(),
            body_encoding,
            body,
            response_status: record.response_status,
            response_body_encoding: response.as_ref().map(|(encoding, _)| *encoding),
            response_body: response.map(|(_, body)| body),
        }
    }
}

fn encode_body(body: &[u8]) -> (&'static str, String) {
    match std::str::from_utf8(body) {
        Ok(text) => ("utf8", text.to_string()),
        Err(_) => ("base64", STANDARD.encode(body)),
    }
}

/// Quote a CSV field when it contains a delimiter, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Export all records as a JSON string, oldest first.
pub fn export_json(conn: &Connection) -> Result<String> {
    let mut records = super::query_recent(conn, usize::MAX)?;
    records.reverse();
    let entries: Vec<LogEntry> = records.iter().map(LogEntry::from).collect();
    let json = serde_json::to_string_pretty(&entries)?;
    Ok(json)
}

/// Export all records as a CSV string, oldest first.
///
/// Headers are written as a JSON array in one column. Response columns are
/// empty for requests that were never answered.
pub fn export_csv(conn: &Connection) -> Result<String> {
    let mut records = super::query_recent(conn, usize::MAX)?;
    records.reverse();
    let mut output = String::from(
        "id,timestamp,method,path,headers,body_encoding,body,response_status,response_body_encoding,response_body\n",
    );
    for record in &records {
        let entry = LogEntry::from(record);
        let headers = serde_json::to_string(&entry.headers)?;
        output.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{}\n",
            entry.id,
            csv_field(&entry.timestamp),
            csv_field(&entry.method),
            csv_field(&entry.path),
            csv_field(&headers),
            entry.body_encoding,
            csv_field(&entry.body),
            entry.response_status.map(|s| s.to_string()).unwrap_or_default(),
            entry.response_body_encoding.unwrap_or_default(),
            csv_field(entry.response_body.as_deref().unwrap_or_default()),
        ));
    }
    Ok(output)
}
