//! Process table from `ps`.
//!
//! `comm` and `args` may both contain spaces, so each is requested as the last
//! column of its own listing and the two are joined by pid.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::parse::{collect_records, split_leading, ParsedLine};

pub const PS_PROGRAM: &str = "ps";
pub const PS_ARGS: &[&str] = &["-eo", "pid,ppid,pcpu,pmem,rss,vsz,time,user,comm"];
pub const PS_COMMAND_LINE_ARGS: &[&str] = &["-eo", "pid,args"];

/// pid, ppid, pcpu, pmem, rss, vsz, time, user; `comm` is the remainder
const LEADING_COLUMNS: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub parent_pid: u32,
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub resident_kb: u64,
    pub virtual_kb: u64,
    /// Accumulated CPU time as printed by `ps`
    pub runtime: String,
    pub owner: String,
    pub command: String,
    pub full_command_line: String,
}

pub fn parse_ps_line(line: &str) -> ParsedLine<ProcessRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with("PID") {
        return ParsedLine::Skip;
    }
    let Some((cols, command)) = split_leading(trimmed, LEADING_COLUMNS) else {
        return ParsedLine::Malformed(format!("expected {} columns in {line:?}", LEADING_COLUMNS + 1));
    };

    macro_rules! num {
        ($idx:expr, $name:literal) => {
            match cols[$idx].parse() {
                Ok(v) => v,
                Err(_) => {
                    return ParsedLine::Malformed(format!("bad {} {:?}", $name, cols[$idx]));
                }
            }
        };
    }

    ParsedLine::Record(ProcessRecord {
        pid: num!(0, "pid"),
        parent_pid: num!(1, "ppid"),
        cpu_percent: num!(2, "pcpu"),
        mem_percent: num!(3, "pmem"),
        resident_kb: num!(4, "rss"),
        virtual_kb: num!(5, "vsz"),
        runtime: cols[6].to_string(),
        owner: cols[7].to_string(),
        full_command_line: command.to_string(),
        command: command.to_string(),
    })
}

pub fn parse_ps_output(output: &str) -> Vec<ProcessRecord> {
    collect_records("ps", output.lines().map(parse_ps_line))
}

/// `pid args` rows keyed by pid
pub fn parse_command_lines(output: &str) -> HashMap<u32, String> {
    output
        .lines()
        .filter_map(|line| split_leading(line.trim(), 1))
        .filter_map(|(cols, args)| Some((cols[0].parse::<u32>().ok()?, args.to_string())))
        .collect()
}

/// Replace each record's command line with the full one, when known.
pub fn apply_command_lines(records: &mut [ProcessRecord], lines: &HashMap<u32, String>) {
    for record in records {
        if let Some(args) = lines.get(&record.pid) {
            record.full_command_line = args.clone();
        }
    }
}
