//! Host-level network state: interfaces, routes, ARP cache, DNS resolvers,
//! and a general host summary from `sysinfo`.

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::parse::{collect_records, columns, ParsedLine};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub arch: String,
    pub uptime_secs: u64,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub cpu_count: usize,
    pub load_average: [f64; 3],
    pub current_user: Option<String>,
    pub home_directory: Option<String>,
}

pub fn host_info() -> HostInfo {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();
    let load = System::load_average();
    HostInfo {
        hostname: System::host_name(),
        os_name: System::name(),
        os_version: System::os_version(),
        kernel_version: System::kernel_version(),
        arch: std::env::consts::ARCH.to_string(),
        uptime_secs: System::uptime(),
        total_memory_bytes: sys.total_memory(),
        available_memory_bytes: sys.available_memory(),
        cpu_count: sys.cpus().len(),
        load_average: [load.one, load.five, load.fifteen],
        current_user: std::env::var("USER").ok(),
        home_directory: dirs::home_dir().map(|p| p.display().to_string()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub flags: Vec<String>,
    pub mtu: Option<u32>,
    pub ether: Option<String>,
    pub inet: Vec<String>,
    pub inet6: Vec<String>,
    pub status: Option<String>,
}

/// Parse `ifconfig -a`. Interface headers start at column 0, attributes are indented.
pub fn parse_ifconfig(output: &str) -> Vec<InterfaceInfo> {
    let mut out: Vec<InterfaceInfo> = Vec::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let indented = line.starts_with(char::is_whitespace);
        if !indented {
            let Some((name, rest)) = line.split_once(": ") else {
                continue;
            };
            let flags = rest
                .split_once('<')
                .and_then(|(_, r)| r.split_once('>'))
                .map(|(f, _)| f.split(',').filter(|s| !s.is_empty()).map(String::from).collect())
                .unwrap_or_default();
            let mtu = rest
                .split_once("mtu ")
                .and_then(|(_, m)| m.split_whitespace().next())
                .and_then(|m| m.parse().ok());
            out.push(InterfaceInfo {
                name: name.to_string(),
                flags,
                mtu,
                ..InterfaceInfo::default()
            });
            continue;
        }
        let Some(iface) = out.last_mut() else {
            continue;
        };
        let cols = columns(line);
        match cols.as_slice() {
            ["ether", mac, ..] => iface.ether = Some((*mac).to_string()),
            ["inet", addr, ..] => iface.inet.push((*addr).to_string()),
            ["inet6", addr, ..] => iface.inet6.push((*addr).to_string()),
            ["status:", rest @ ..] => iface.status = Some(rest.join(" ")),
            _ => {}
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// `Internet` or `Internet6`
    pub family: String,
    pub destination: String,
    pub gateway: String,
    pub flags: String,
    pub interface: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire: Option<String>,
}

/// Parse `netstat -rn`, tracking the address-family section headers.
pub fn parse_routes(output: &str) -> Vec<RouteEntry> {
    let mut family = String::from("Internet");
    let rows = output.lines().map(|line| {
        let trimmed = line.trim();
        if let Some(section) = trimmed.strip_suffix(':') {
            if section.starts_with("Internet") {
                family = section.to_string();
            }
            return ParsedLine::Skip;
        }
        let cols = columns(trimmed);
        match cols.first() {
            None | Some(&"Destination") | Some(&"Routing") => ParsedLine::Skip,
            Some(_) if cols.len() < 4 => {
                ParsedLine::Malformed(format!("expected 4 columns, got {}", cols.len()))
            }
            Some(_) => ParsedLine::Record(RouteEntry {
                family: family.clone(),
                destination: cols[0].to_string(),
                gateway: cols[1].to_string(),
                flags: cols[2].to_string(),
                interface: cols[3].to_string(),
                expire: cols.get(4).map(|e| (*e).to_string()),
            }),
        }
    });
    collect_records("netstat -rn", rows)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpEntry {
    pub hostname: String,
    pub ip: String,
    /// `None` for incomplete entries
    pub mac: Option<String>,
    pub interface: String,
    pub permanent: bool,
}

/// `? (192.168.1.1) at 0:11:22:33:44:55 on en0 ifscope [ethernet]`
pub fn parse_arp_line(line: &str) -> ParsedLine<ArpEntry> {
    let cols = columns(line);
    if cols.is_empty() {
        return ParsedLine::Skip;
    }
    if cols.len() < 6 || cols[2] != "at" || cols[4] != "on" {
        return ParsedLine::Malformed(format!("unexpected arp row {line:?}"));
    }
    let ip = cols[1].trim_start_matches('(').trim_end_matches(')');
    let mac = match cols[3] {
        "(incomplete)" => None,
        m => Some(m.to_string()),
    };
    ParsedLine::Record(ArpEntry {
        hostname: cols[0].to_string(),
        ip: ip.to_string(),
        mac,
        interface: cols[5].to_string(),
        permanent: cols[6..].contains(&"permanent"),
    })
}

pub fn parse_arp(output: &str) -> Vec<ArpEntry> {
    collect_records("arp -a", output.lines().map(parse_arp_line))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsResolver {
    pub index: u32,
    /// From the "for scoped queries" section
    pub scoped: bool,
    pub domain: Option<String>,
    pub search_domains: Vec<String>,
    pub nameservers: Vec<String>,
    pub interface: Option<String>,
    pub options: Option<String>,
}

/// Parse `scutil --dns` resolver blocks.
pub fn parse_scutil_dns(output: &str) -> Vec<DnsResolver> {
    let mut out: Vec<DnsResolver> = Vec::new();
    let mut scoped = false;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("DNS configuration") {
            scoped = trimmed.contains("scoped");
            continue;
        }
        if let Some(n) = trimmed.strip_prefix("resolver #") {
            out.push(DnsResolver {
                index: n.trim().parse().unwrap_or(0),
                scoped,
                ..DnsResolver::default()
            });
            continue;
        }
        let (Some(resolver), Some((key, value))) = (out.last_mut(), trimmed.split_once(':')) else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().to_string();
        if key.starts_with("nameserver") {
            resolver.nameservers.push(value);
        } else if key.starts_with("search domain") {
            resolver.search_domains.push(value);
        } else if key == "domain" {
            resolver.domain = Some(value);
        } else if key == "options" {
            resolver.options = Some(value);
        } else if key == "if_index" {
            resolver.interface = value
                .split_once('(')
                .map(|(_, i)| i.trim_end_matches(')').to_string());
        }
    }
    out
}
