//! Socket tables: process-attributed rows from `lsof -i` and bare rows from `netstat -an`.

use serde::{Deserialize, Serialize};

use crate::parse::{collect_records, columns, ParsedLine};

pub const LSOF_SOCKETS_ARGS: &[&str] = &["-i", "-n", "-P"];
pub const NETSTAT_ARGS: &[&str] = &["-an"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Listen,
    Established,
    TimeWait,
    CloseWait,
    FinWait,
    SynSent,
    SynRecv,
    Closed,
    /// Connectionless datagram socket
    Udp,
    Unknown,
}

/// Substring table, checked in order; CLOSE_WAIT must precede CLOSED.
const STATE_TABLE: &[(&str, ConnectionState)] = &[
    ("LISTEN", ConnectionState::Listen),
    ("ESTABLISHED", ConnectionState::Established),
    ("TIME_WAIT", ConnectionState::TimeWait),
    ("CLOSE_WAIT", ConnectionState::CloseWait),
    ("FIN_WAIT", ConnectionState::FinWait),
    ("SYN_SENT", ConnectionState::SynSent),
    ("SYN_RECV", ConnectionState::SynRecv),
    ("SYN_RCVD", ConnectionState::SynRecv),
    ("CLOSED", ConnectionState::Closed),
    ("UDP", ConnectionState::Udp),
];

impl ConnectionState {
    /// Case-insensitive containment match against the known states
    pub fn normalize(raw: &str) -> Self {
        let upper = raw.trim().to_ascii_uppercase();
        if upper.is_empty() {
            return Self::Unknown;
        }
        STATE_TABLE
            .iter()
            .find(|(needle, _)| upper.contains(needle))
            .map_or(Self::Unknown, |(_, state)| *state)
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Listen => "Waiting for incoming connections",
            Self::Established => "Active connection with data transfer",
            Self::TimeWait => "Connection closed, waiting for remote shutdown",
            Self::CloseWait => "Remote end closed, waiting for local close",
            Self::FinWait => "Connection closing, waiting for remote close",
            Self::SynSent => "Attempting to establish connection",
            Self::SynRecv => "Connection request received, establishing",
            Self::Closed => "Connection is closed",
            Self::Udp => "Connectionless datagram socket",
            Self::Unknown => "Connection state unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConnection {
    pub protocol: String,
    pub local_endpoint: String,
    pub remote_endpoint: String,
    pub state: ConnectionState,
    pub state_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owning_process_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owning_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owning_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_descriptor: Option<String>,
}

impl NetworkConnection {
    fn unowned(protocol: String, local: String, remote: String, state: ConnectionState) -> Self {
        Self {
            protocol,
            local_endpoint: local,
            remote_endpoint: remote,
            state,
            state_description: state.description().to_string(),
            owning_process_name: None,
            owning_pid: None,
            owning_user: None,
            file_descriptor: None,
        }
    }
}

/// Decomposed `lsof` NAME field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketName {
    pub protocol: String,
    pub local: String,
    pub remote: String,
    pub state: ConnectionState,
}

/// Split a trailing ` (STATE)` off an address field.
fn split_state(field: &str) -> (&str, Option<&str>) {
    match field.split_once(" (") {
        Some((addr, state)) => (addr.trim(), Some(state.trim().trim_end_matches(')'))),
        None => (field.trim(), None),
    }
}

fn is_wildcard_listen(addr: &str) -> bool {
    addr.starts_with("*:") || addr.starts_with("*.")
}

/// Decompose an `lsof` NAME field given its TYPE column (`IPv4`, `IPv6`, `tcp6`…).
pub fn parse_socket_name(kind: &str, name: &str) -> SocketName {
    let name = name.trim();

    if let Some((local, rest)) = name.split_once("->") {
        let (remote, state) = split_state(rest);
        return SocketName {
            protocol: "TCP".to_string(),
            local: local.trim().to_string(),
            remote: remote.to_string(),
            state: state.map_or(ConnectionState::Established, ConnectionState::normalize),
        };
    }

    let (addr, _) = split_state(name);
    if is_wildcard_listen(addr) {
        let protocol = if kind.ends_with('6') { "TCP6" } else { "TCP" };
        return SocketName {
            protocol: protocol.to_string(),
            local: addr.to_string(),
            remote: "*:*".to_string(),
            state: ConnectionState::Listen,
        };
    }

    if addr.contains(':') {
        return SocketName {
            protocol: "UDP".to_string(),
            local: addr.to_string(),
            remote: "*:*".to_string(),
            state: ConnectionState::Udp,
        };
    }

    SocketName {
        protocol: kind.to_ascii_uppercase(),
        local: addr.to_string(),
        remote: String::new(),
        state: ConnectionState::Unknown,
    }
}

/// `COMMAND PID USER FD TYPE DEVICE SIZE/OFF NODE NAME…`
pub fn parse_lsof_socket_line(line: &str) -> ParsedLine<NetworkConnection> {
    let cols = columns(line);
    if cols.is_empty() || cols[0] == "COMMAND" {
        return ParsedLine::Skip;
    }
    if cols.len() < 9 {
        return ParsedLine::Malformed(format!("expected 9 columns, got {}", cols.len()));
    }
    let Ok(pid) = cols[1].parse::<u32>() else {
        return ParsedLine::Malformed(format!("bad pid {:?}", cols[1]));
    };
    let name = cols[8..].join(" ");
    let socket = parse_socket_name(cols[4], &name);
    ParsedLine::Record(NetworkConnection {
        protocol: socket.protocol,
        local_endpoint: socket.local,
        remote_endpoint: socket.remote,
        state: socket.state,
        state_description: socket.state.description().to_string(),
        owning_process_name: Some(cols[0].to_string()),
        owning_pid: Some(pid),
        owning_user: Some(cols[2].to_string()),
        file_descriptor: Some(cols[3].to_string()),
    })
}

pub fn parse_lsof_sockets(output: &str) -> Vec<NetworkConnection> {
    collect_records("lsof -i", output.lines().map(parse_lsof_socket_line))
}

/// `Proto Recv-Q Send-Q Local Foreign (state)`; only tcp*/udp* rows are data.
pub fn parse_netstat_line(line: &str) -> ParsedLine<NetworkConnection> {
    let cols = columns(line);
    let Some(proto) = cols.first() else {
        return ParsedLine::Skip;
    };
    let lower = proto.to_ascii_lowercase();
    let is_udp = lower.starts_with("udp");
    if !is_udp && !lower.starts_with("tcp") {
        return ParsedLine::Skip;
    }

    let state = if is_udp {
        if cols.len() < 5 {
            return ParsedLine::Malformed(format!("short udp row ({} columns)", cols.len()));
        }
        cols.get(5)
            .map_or(ConnectionState::Udp, |s| ConnectionState::normalize(s))
    } else {
        if cols.len() < 6 {
            return ParsedLine::Malformed(format!("short tcp row ({} columns)", cols.len()));
        }
        ConnectionState::normalize(cols[5])
    };

    ParsedLine::Record(NetworkConnection::unowned(
        (*proto).to_string(),
        cols[3].to_string(),
        cols[4].to_string(),
        state,
    ))
}

pub fn parse_netstat(output: &str) -> Vec<NetworkConnection> {
    collect_records("netstat", output.lines().map(parse_netstat_line))
}
