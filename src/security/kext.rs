//! Loaded kernel extensions, optionally enriched with on-disk location and
//! code signature.

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use super::{ProbeOutcome, SecurityAuditEngine};
use crate::error::{MonitorError, Result};
use crate::exec::CommandOutput;
use crate::parse::{collect_records, columns, ParsedLine};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelExtension {
    pub index: u32,
    pub refs: u32,
    pub address: String,
    pub size: String,
    pub wired: String,
    pub bundle_id: String,
    pub version: String,
    /// Estimated from the bundle id until resolved
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<KextDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KextDetail {
    pub resolved_paths: ProbeOutcome<Vec<String>>,
    /// `kextutil -print-diagnostics` text for the resolved bundle
    pub diagnostics: ProbeOutcome<String>,
    pub signature: ProbeOutcome<CodeSignature>,
    pub flags: Vec<KextFlag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KextFlag {
    Apple,
    ThirdParty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSignature {
    pub signed: bool,
    pub identifier: Option<String>,
    pub team_identifier: Option<String>,
    pub authorities: Vec<String>,
}

pub fn kext_path_for_bundle(bundle_id: &str) -> String {
    if bundle_id.starts_with("com.apple.") {
        format!("/System/Library/Extensions/{bundle_id}.kext")
    } else {
        format!("/Library/Extensions/{bundle_id}.kext")
    }
}

/// `Index Refs Address Size Wired Name (Version) UUID <Linked Against>`
fn parse_kextstat_line(line: &str) -> ParsedLine<KernelExtension> {
    let cols = columns(line);
    if cols.is_empty() || cols[0] == "Index" || line.starts_with("Executing:") {
        return ParsedLine::Skip;
    }
    if cols.len() < 6 {
        return ParsedLine::Malformed(format!("expected 6 columns, got {}", cols.len()));
    }
    let (Ok(index), Ok(refs)) = (cols[0].parse::<u32>(), cols[1].parse::<u32>()) else {
        return ParsedLine::Malformed(format!("bad index/refs in {line:?}"));
    };
    let bundle_id = cols[5].to_string();
    let version = cols
        .get(6)
        .filter(|v| v.starts_with('('))
        .map(|v| v.trim_start_matches('(').trim_end_matches(')').to_string())
        .unwrap_or_default();
    ParsedLine::Record(KernelExtension {
        index,
        refs,
        address: cols[2].to_string(),
        size: cols[3].to_string(),
        wired: cols[4].to_string(),
        path: kext_path_for_bundle(&bundle_id),
        bundle_id,
        version,
        detail: None,
    })
}

pub fn parse_kextstat(output: &str) -> Vec<KernelExtension> {
    collect_records("kextstat", output.lines().map(parse_kextstat_line))
}

/// `codesign -dv` describes the signature on stderr.
pub fn parse_codesign(out: &CommandOutput) -> Result<CodeSignature> {
    if !out.success() {
        if out.stderr.contains("not signed") {
            return Ok(CodeSignature::default());
        }
        return Err(MonitorError::CommandFailed {
            program: "codesign".into(),
            code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        });
    }
    let mut sig = CodeSignature {
        signed: true,
        ..CodeSignature::default()
    };
    for line in out.stderr.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "Identifier" => sig.identifier = Some(value.to_string()),
            "TeamIdentifier" if value != "not set" => sig.team_identifier = Some(value.to_string()),
            "Authority" => sig.authorities.push(value.to_string()),
            _ => {}
        }
    }
    Ok(sig)
}

fn kext_flags(bundle_id: &str) -> Vec<KextFlag> {
    if bundle_id.starts_with("com.apple.") {
        vec![KextFlag::Apple]
    } else {
        vec![KextFlag::ThirdParty]
    }
}

impl SecurityAuditEngine {
    pub(super) async fn kernel_extensions(&self) -> Result<Vec<KernelExtension>> {
        let out = self.runner.run("kextstat", &[], self.timeout).await?;
        if out.success() {
            return Ok(parse_kextstat(&out.stdout));
        }
        if !self.privilege.is_granted() {
            return Err(MonitorError::PrivilegeRequired {
                command: "kextstat".into(),
                reason: out.stderr.trim().to_string(),
            });
        }
        let out = self.privilege.run_privileged("kextstat", &[]).await?;
        Ok(parse_kextstat(&out.stdout))
    }

    pub(super) async fn kernel_extensions_detailed(&self) -> Result<Vec<KernelExtension>> {
        let kexts = self.kernel_extensions().await?;
        let details: Vec<_> = stream::iter(&kexts)
            .map(|k| self.describe_kext(k))
            .buffered(self.enrichment_limit())
            .collect()
            .await;
        Ok(kexts
            .into_iter()
            .zip(details)
            .map(|(mut kext, (resolved, detail))| {
                if let Some(path) = resolved {
                    kext.path = path;
                }
                kext.detail = Some(detail);
                kext
            })
            .collect())
    }

    /// Resolution, diagnostics and signature lookups are independent; any may fail alone.
    async fn describe_kext(&self, kext: &KernelExtension) -> (Option<String>, KextDetail) {
        let resolved_paths = ProbeOutcome::from_result(self.resolve_kext_paths(&kext.bundle_id).await);
        let path = resolved_paths.data().and_then(|p| p.first()).cloned();
        let target = path.as_deref().unwrap_or(kext.path.as_str());
        let diagnostics = ProbeOutcome::from_result(
            self.run_checked("kextutil", &["-print-diagnostics", "-no-load", target])
                .await
                .map(|out| out.trim().to_string()),
        );
        let signature = ProbeOutcome::from_result(
            self.runner
                .run("codesign", &["-dv", target], self.timeout)
                .await
                .and_then(|out| parse_codesign(&out)),
        );
        (
            path,
            KextDetail {
                resolved_paths,
                diagnostics,
                signature,
                flags: kext_flags(&kext.bundle_id),
            },
        )
    }

    async fn resolve_kext_paths(&self, bundle_id: &str) -> Result<Vec<String>> {
        let stdout = self.run_checked("kextfind", &["-bundle-id", bundle_id]).await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}
