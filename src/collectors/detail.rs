//! Per-process `lsof` rows for detail views.

use serde::{Deserialize, Serialize};

use crate::parse::{collect_records, columns, ParsedLine};

pub const LSOF_PROGRAM: &str = "lsof";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFileEntry {
    pub command: String,
    pub pid: u32,
    pub user: String,
    pub fd: String,
    pub file_type: String,
    pub device: String,
    pub size_offset: String,
    pub node: String,
    /// Path or socket address; may contain spaces
    pub name: String,
}

pub fn connection_args(pid: u32) -> Vec<String> {
    vec!["-Pan".into(), "-p".into(), pid.to_string(), "-i".into()]
}

pub fn descriptor_args(pid: u32) -> Vec<String> {
    vec!["-p".into(), pid.to_string()]
}

pub fn parse_open_file_line(line: &str) -> ParsedLine<OpenFileEntry> {
    let cols = columns(line);
    if cols.is_empty() || cols[0] == "COMMAND" {
        return ParsedLine::Skip;
    }
    if cols.len() < 9 {
        return ParsedLine::Malformed(format!("expected 9 columns, got {}", cols.len()));
    }
    let Ok(pid) = cols[1].parse() else {
        return ParsedLine::Malformed(format!("bad pid {:?}", cols[1]));
    };
    ParsedLine::Record(OpenFileEntry {
        command: cols[0].to_string(),
        pid,
        user: cols[2].to_string(),
        fd: cols[3].to_string(),
        file_type: cols[4].to_string(),
        device: cols[5].to_string(),
        size_offset: cols[6].to_string(),
        node: cols[7].to_string(),
        name: cols[8..].join(" "),
    })
}

pub fn parse_open_files(output: &str) -> Vec<OpenFileEntry> {
    collect_records("lsof -p", output.lines().map(parse_open_file_line))
}
