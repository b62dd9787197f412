//! Installed applications, security-relevant configuration files and the
//! system-wide open file descriptor inventory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use super::SecurityAuditEngine;
use crate::collectors::{parse_open_file_line, OpenFileEntry};
use crate::config::expand_home;
use crate::error::{MonitorError, Result};
use crate::parse::ParsedLine;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub path: String,
    pub is_system: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    System,
    User,
    Suspicious,
    Network,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFileRef {
    pub path: String,
    pub process: String,
    pub pid: u32,
    pub category: FileCategory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptorInventory {
    pub total_descriptors: usize,
    pub open_files: usize,
    pub network_sockets: usize,
    pub entries: Vec<OpenFileRef>,
    /// Set when `entries` hit the configured cap
    pub truncated: bool,
    pub files_per_process: BTreeMap<String, usize>,
}

/// Temporary, private and hidden locations are suspicious before anything else.
pub fn categorize_path(path: &str) -> FileCategory {
    if path.contains("/tmp/")
        || path.contains("/var/tmp/")
        || path.contains("/private/")
        || path.contains("/.")
    {
        FileCategory::Suspicious
    } else if path.starts_with("/System/") {
        FileCategory::System
    } else if path.starts_with("/Users/") {
        FileCategory::User
    } else {
        FileCategory::Other
    }
}

impl FileDescriptorInventory {
    fn push(&mut self, entry: OpenFileRef, max: usize) {
        if self.entries.len() < max {
            self.entries.push(entry);
        } else {
            self.truncated = true;
        }
    }

    fn record(&mut self, row: OpenFileEntry, max: usize) {
        self.total_descriptors += 1;
        match row.file_type.as_str() {
            "REG" => {
                self.open_files += 1;
                if !row.name.starts_with('/') {
                    return;
                }
                *self.files_per_process.entry(row.command.clone()).or_default() += 1;
                let category = categorize_path(&row.name);
                self.push(
                    OpenFileRef {
                        path: row.name,
                        process: row.command,
                        pid: row.pid,
                        category,
                    },
                    max,
                );
            }
            "IPv4" | "IPv6" => {
                self.network_sockets += 1;
                self.push(
                    OpenFileRef {
                        path: row.name,
                        process: row.command,
                        pid: row.pid,
                        category: FileCategory::Network,
                    },
                    max,
                );
            }
            _ => {}
        }
    }
}

/// Build the inventory from `lsof -n` output, keeping at most `max` entries.
pub fn build_fd_inventory(output: &str, max: usize) -> FileDescriptorInventory {
    let mut inv = FileDescriptorInventory::default();
    for line in output.lines() {
        match parse_open_file_line(line) {
            ParsedLine::Record(row) => inv.record(row, max),
            ParsedLine::Skip => {}
            ParsedLine::Malformed(reason) => debug!(%reason, "dropping lsof row"),
        }
    }
    inv
}

/// `.app` bundles up to two levels below `dir`, without descending into bundles.
fn scan_applications(dir: &Path, is_system: bool) -> std::io::Result<Vec<Application>> {
    let mut apps = Vec::new();
    let mut walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                debug!(error = %e, "skipping unreadable application entry");
                continue;
            }
        };
        let is_bundle = entry.file_type().is_dir()
            && entry.path().extension().and_then(|e| e.to_str()) == Some("app");
        if !is_bundle {
            continue;
        }
        apps.push(Application {
            name: entry
                .path()
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: entry.path().display().to_string(),
            is_system,
        });
        walker.skip_current_dir();
    }
    Ok(apps)
}

fn collect_applications(dirs: &[PathBuf]) -> Vec<Application> {
    let mut apps = Vec::new();
    for dir in dirs {
        let is_system = dir.starts_with("/System");
        match scan_applications(dir, is_system) {
            Ok(found) => apps.extend(found),
            Err(e) => debug!(dir = %dir.display(), error = %e, "application directory unavailable"),
        }
    }
    apps
}

impl SecurityAuditEngine {
    pub(super) async fn installed_applications(&self) -> Result<Vec<Application>> {
        let dirs: Vec<PathBuf> = self.config.application_dirs.iter().map(|d| expand_home(d)).collect();
        tokio::task::spawn_blocking(move || collect_applications(&dirs))
            .await
            .map_err(|e| MonitorError::probe("applications", e.to_string()))
    }

    /// Metadata for each configured file that exists
    pub(super) async fn security_configurations(&self) -> Result<Vec<ConfigFile>> {
        let mut files = Vec::new();
        for path in &self.config.configuration_files {
            let path = expand_home(path);
            match tokio::fs::metadata(&path).await {
                Ok(meta) => files.push(ConfigFile {
                    path: path.display().to_string(),
                    size: meta.len(),
                    modified: meta.modified().ok().map(DateTime::<Utc>::from),
                }),
                Err(e) => debug!(path = %path.display(), error = %e, "configuration file skipped"),
            }
        }
        Ok(files)
    }

    /// `lsof` exits non-zero when some processes are unreadable; partial output is kept.
    pub(super) async fn file_descriptor_inventory(&self) -> Result<FileDescriptorInventory> {
        let out = self.runner.run("lsof", &["-n"], self.timeout).await?;
        if out.stdout.trim().is_empty() {
            return Err(MonitorError::CommandFailed {
                program: "lsof".into(),
                code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(build_fd_inventory(&out.stdout, self.config.max_file_list))
    }
}
