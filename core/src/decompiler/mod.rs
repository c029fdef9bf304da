//! Decompiler adapter: one session per job, producing a normalized
//! [`DecompilationArtifact`].
//!
//! The adapter probes the disassembler, runs the depth-selected analysis
//! (downgrading once on soft-timeout), extracts functions, imports and
//! strings through JSON commands, and cross-checks the file hash and
//! format signature independently of the disassembler output.

mod session;

pub use session::{DecompilerError, DecompilerSession, SessionState};

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::config::{DecompilerSettings, LimitSettings};
use crate::model::{
    format_address, AnalysisDepth, BinaryFormat, DecompilationArtifact, FunctionInfo, ImportInfo,
    StringEncoding, StringInfo,
};
use crate::sniff::{parse_reported_format, sniff_format};

/// How many functions get their disassembly listing attached.
const MAX_ASSEMBLY_LISTINGS: usize = 200;

pub struct Decompiler {
    settings: DecompilerSettings,
    limits: LimitSettings,
}

impl Decompiler {
    pub fn new(settings: DecompilerSettings, limits: LimitSettings) -> Self {
        Self { settings, limits }
    }

    /// Run the full extraction for one job. Cancellation is observed
    /// between stages; an error here is fatal for the job.
    pub async fn analyze(
        &self,
        blob_path: &Path,
        depth: AnalysisDepth,
        include_assembly: bool,
        cancel: &CancelToken,
    ) -> Result<DecompilationArtifact, DecompilerError> {
        let started = Instant::now();
        let mut warnings = Vec::new();

        // Hash and signature come straight from the file so they stay
        // trustworthy even when the disassembler misreports.
        let bytes = tokio::fs::read(blob_path)
            .await
            .map_err(|err| DecompilerError::Unavailable(format!("blob unreadable: {err}")))?;
        let sha256 = hex::encode(Sha256::digest(&bytes));
        let size_bytes = bytes.len() as u64;
        let (sniffed_format, sniffed_platform) = sniff_format(&bytes[..bytes.len().min(16)]);
        drop(bytes);

        if cancel.is_cancelled() {
            return Err(DecompilerError::Analysis("cancelled before open".into()));
        }

        // A soft-timeout during analysis poisons the pipe, so the downgrade
        // runs on a fresh session at the next-lower depth, at most once.
        let extraction = match self
            .run_extraction(blob_path, depth, include_assembly, cancel, &mut warnings)
            .await
        {
            Ok(extraction) => extraction,
            Err(DecompilerError::AnalysisTimeout { .. }) => {
                let Some(lower) = depth.downgraded() else {
                    return Err(DecompilerError::Analysis(format!(
                        "analysis timed out at depth {}",
                        depth.as_str()
                    )));
                };
                warnings.push(format!(
                    "analysis downgraded from {} to {} after soft timeout",
                    depth.as_str(),
                    lower.as_str()
                ));
                self.run_extraction(blob_path, lower, include_assembly, cancel, &mut warnings)
                    .await
                    .map_err(|err| match err {
                        DecompilerError::AnalysisTimeout { depth } => DecompilerError::Analysis(
                            format!("analysis timed out at downgraded depth {}", depth.as_str()),
                        ),
                        other => other,
                    })?
            }
            Err(err) => return Err(err),
        };
        let (info, functions, imports, strings) = extraction;

        let reported_format = info
            .reported_format
            .as_deref()
            .map(parse_reported_format)
            .unwrap_or(BinaryFormat::Unknown);
        let format = if sniffed_format != BinaryFormat::Unknown {
            if reported_format != BinaryFormat::Unknown && reported_format != sniffed_format {
                warnings.push(format!(
                    "format mismatch: signature says {} but disassembler says {}",
                    sniffed_format.as_str(),
                    reported_format.as_str()
                ));
            }
            sniffed_format
        } else {
            reported_format
        };

        Ok(DecompilationArtifact {
            sha256,
            size_bytes,
            format,
            platform: if sniffed_platform != crate::model::Platform::Unknown {
                sniffed_platform
            } else {
                format.default_platform()
            },
            architecture: info.architecture,
            entry_point: info.entry_point,
            sections: info.sections,
            functions,
            imports,
            strings,
            duration_seconds: started.elapsed().as_secs_f64(),
            success: true,
            errors: Vec::new(),
            warnings,
        })
    }

    /// One session: probes, analysis at exactly `depth`, then extraction.
    /// The session is closed on every exit path; an analysis soft-timeout
    /// surfaces as [`DecompilerError::AnalysisTimeout`] for the caller's
    /// downgrade decision.
    async fn run_extraction(
        &self,
        blob_path: &Path,
        depth: AnalysisDepth,
        include_assembly: bool,
        cancel: &CancelToken,
        warnings: &mut Vec<String>,
    ) -> Result<(BinaryInfo, Vec<FunctionInfo>, Vec<ImportInfo>, Vec<StringInfo>), DecompilerError>
    {
        let session = DecompilerSession::open(&self.settings, blob_path).await?;
        let command_timeout = Duration::from_secs(self.settings.command_timeout_secs);
        let result = self
            .extract_with_session(&session, depth, include_assembly, cancel, command_timeout, warnings)
            .await;
        session.close().await;
        result
    }

    async fn extract_with_session(
        &self,
        session: &DecompilerSession,
        depth: AnalysisDepth,
        include_assembly: bool,
        cancel: &CancelToken,
        command_timeout: Duration,
        warnings: &mut Vec<String>,
    ) -> Result<(BinaryInfo, Vec<FunctionInfo>, Vec<ImportInfo>, Vec<StringInfo>), DecompilerError>
    {
        // Version and info probes; failure here means the disassembler is
        // not usable at all.
        session
            .run("?V", command_timeout)
            .await
            .map_err(|err| DecompilerError::Unavailable(format!("version probe failed: {err}")))?;
        let info_value = session.run_json_cached("ij", command_timeout).await?;
        let mut info = BinaryInfo::from_value(&info_value);

        if cancel.is_cancelled() {
            return Err(DecompilerError::Analysis("cancelled before analysis".into()));
        }

        // Depth-selected analysis under its soft timeout.
        let soft = Duration::from_secs(depth.soft_timeout_secs());
        match session.run(depth.analysis_command(), soft).await {
            Ok(_) => {}
            Err(DecompilerError::CommandTimeout { .. }) => {
                return Err(DecompilerError::AnalysisTimeout { depth });
            }
            Err(err) => return Err(err),
        }

        if let Ok(entry_value) = session.run_json_cached("iej", command_timeout).await {
            if info.entry_point.is_none() {
                info.entry_point = entry_value
                    .as_array()
                    .and_then(|entries| entries.first())
                    .and_then(|entry| entry.get("vaddr"))
                    .and_then(Value::as_u64)
                    .map(format_address);
            }
        }
        if let Ok(section_value) = session.run_json_cached("iSj", command_timeout).await {
            info.sections = section_value
                .as_array()
                .map(|sections| {
                    sections
                        .iter()
                        .filter_map(|section| section.get("name").and_then(Value::as_str))
                        .filter(|name| !name.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
        }

        if cancel.is_cancelled() {
            return Err(DecompilerError::Analysis("cancelled during extraction".into()));
        }

        let functions_value = session.run_json("aflj", command_timeout).await?;
        let mut functions = parse_functions(&functions_value, self.limits.max_functions, warnings);

        if include_assembly {
            for function in functions.iter_mut().take(MAX_ASSEMBLY_LISTINGS) {
                if cancel.is_cancelled() {
                    break;
                }
                let command = format!("pdf @ {}", function.address);
                match session.run(&command, command_timeout).await {
                    Ok(listing) if !listing.trim().is_empty() => {
                        function.assembly = Some(listing);
                    }
                    _ => {}
                }
            }
        }

        let imports_value = session.run_json("iij", command_timeout).await?;
        let imports = parse_imports(&imports_value, self.limits.max_imports, warnings);

        let strings_value = session.run_json("izj", command_timeout).await?;
        let strings = parse_strings(&strings_value, self.limits.max_strings, warnings);

        // Tie functions to the imports they reference by callee name.
        let import_names: Vec<String> = imports
            .iter()
            .filter_map(|import| import.function.clone())
            .collect();
        for function in &mut functions {
            function.imports_used = function
                .calls_to
                .iter()
                .filter(|callee| {
                    import_names
                        .iter()
                        .any(|import| callee.contains(import.as_str()))
                })
                .cloned()
                .collect();
        }

        Ok((info, functions, imports, strings))
    }
}

struct BinaryInfo {
    architecture: String,
    entry_point: Option<String>,
    sections: Vec<String>,
    reported_format: Option<String>,
}

impl BinaryInfo {
    fn from_value(value: &Value) -> Self {
        let bin = value.get("bin");
        let architecture = bin
            .and_then(|bin| bin.get("arch"))
            .and_then(Value::as_str)
            .map(|arch| {
                let bits = bin
                    .and_then(|bin| bin.get("bits"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                if bits > 0 {
                    format!("{arch}_{bits}")
                } else {
                    arch.to_string()
                }
            })
            .unwrap_or_else(|| "unknown".into());

        let reported_format = value
            .get("core")
            .and_then(|core| core.get("format"))
            .or_else(|| bin.and_then(|bin| bin.get("bintype")))
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            architecture,
            entry_point: None,
            sections: Vec::new(),
            reported_format,
        }
    }
}

fn parse_functions(value: &Value, cap: usize, warnings: &mut Vec<String>) -> Vec<FunctionInfo> {
    let Some(entries) = value.as_array() else {
        return Vec::new();
    };
    if entries.len() > cap {
        warnings.push(format!(
            "function_list_truncated: {} extracted, keeping {cap}",
            entries.len()
        ));
    }

    entries
        .iter()
        .take(cap)
        .filter_map(|entry| {
            let name = entry.get("name").and_then(Value::as_str)?.to_string();
            let offset = entry.get("offset").and_then(Value::as_u64)?;
            // A function smaller than one byte is not a function.
            let size = entry.get("size").and_then(Value::as_u64).unwrap_or(1).max(1);

            let calls_to = ref_addresses(entry.get("callrefs"));
            let called_by = ref_addresses(entry.get("codexrefs"));
            let string_refs = entry
                .get("datarefs")
                .and_then(Value::as_array)
                .map(|refs| {
                    refs.iter()
                        .filter_map(data_ref_address)
                        .map(format_address)
                        .collect()
                })
                .unwrap_or_default();

            Some(FunctionInfo {
                name,
                address: format_address(offset),
                size,
                assembly: None,
                calls_to,
                called_by,
                imports_used: Vec::new(),
                string_refs,
            })
        })
        .collect()
}

// callrefs entries are objects with addr/type; datarefs are sometimes bare
// numbers depending on the disassembler version.
fn ref_addresses(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|refs| {
            refs.iter()
                .filter_map(|entry| {
                    entry
                        .get("name")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| {
                            entry
                                .get("addr")
                                .and_then(Value::as_u64)
                                .map(format_address)
                        })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn data_ref_address(entry: &Value) -> Option<u64> {
    entry
        .as_u64()
        .or_else(|| entry.get("addr").and_then(Value::as_u64))
}

fn parse_imports(value: &Value, cap: usize, warnings: &mut Vec<String>) -> Vec<ImportInfo> {
    let Some(entries) = value.as_array() else {
        return Vec::new();
    };
    if entries.len() > cap {
        warnings.push(format!(
            "import_list_truncated: {} extracted, keeping {cap}",
            entries.len()
        ));
    }

    entries
        .iter()
        .take(cap)
        .map(|entry| {
            let function = entry
                .get("name")
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .map(str::to_string);
            ImportInfo {
                library: entry
                    .get("libname")
                    .and_then(Value::as_str)
                    .filter(|lib| !lib.is_empty())
                    .unwrap_or("unknown")
                    .to_string(),
                function,
                ordinal: entry
                    .get("ordinal")
                    .and_then(Value::as_u64)
                    .and_then(|ordinal| u32::try_from(ordinal).ok()),
                address: entry.get("plt").and_then(Value::as_u64).map(format_address),
            }
        })
        .collect()
}

fn parse_strings(value: &Value, cap: usize, warnings: &mut Vec<String>) -> Vec<StringInfo> {
    let Some(entries) = value.as_array() else {
        return Vec::new();
    };
    if entries.len() > cap {
        warnings.push(format!(
            "string_list_truncated: {} extracted, keeping {cap}",
            entries.len()
        ));
    }

    entries
        .iter()
        .take(cap)
        .filter_map(|entry| {
            let text = entry.get("string").and_then(Value::as_str)?.to_string();
            let vaddr = entry.get("vaddr").and_then(Value::as_u64)?;
            let encoding = match entry.get("type").and_then(Value::as_str).unwrap_or("ascii") {
                t if t.starts_with("utf32") => StringEncoding::Utf32,
                t if t.starts_with("utf16") || t == "wide" => StringEncoding::Utf16,
                _ => StringEncoding::Ascii,
            };
            Some(StringInfo {
                value: text,
                address: format_address(vaddr),
                size: entry.get("size").and_then(Value::as_u64).unwrap_or(0),
                encoding,
                section: entry
                    .get("section")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn functions_parse_with_refs_and_cap() {
        let mut warnings = Vec::new();
        let value = json!([
            {
                "name": "main",
                "offset": 0x401000u64,
                "size": 120,
                "callrefs": [{"addr": 0x401200u64, "type": "CALL", "name": "sym.imp.printf"}],
                "codexrefs": [{"addr": 0x400f00u64, "type": "CALL"}],
                "datarefs": [0x402000u64]
            },
            {"name": "sub_401200", "offset": 0x401200u64, "size": 0}
        ]);

        let functions = parse_functions(&value, 10, &mut warnings);
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].address, "0x401000");
        assert_eq!(functions[0].calls_to, vec!["sym.imp.printf"]);
        assert_eq!(functions[0].called_by, vec!["0x400f00"]);
        assert_eq!(functions[0].string_refs, vec!["0x402000"]);
        // size is clamped to at least one byte
        assert_eq!(functions[1].size, 1);
        assert!(warnings.is_empty());
    }

    #[test]
    fn function_cap_truncates_with_warning() {
        let mut warnings = Vec::new();
        let entries: Vec<_> = (0..5)
            .map(|i| json!({"name": format!("f{i}"), "offset": 0x1000u64 + i, "size": 8}))
            .collect();
        let functions = parse_functions(&Value::Array(entries), 3, &mut warnings);
        assert_eq!(functions.len(), 3);
        assert!(warnings[0].starts_with("function_list_truncated"));
    }

    #[test]
    fn imports_default_library_and_map_ordinals() {
        let mut warnings = Vec::new();
        let value = json!([
            {"name": "printf", "libname": "libc.so.6", "plt": 0x4010a0u64},
            {"name": "", "ordinal": 12, "libname": "KERNEL32.dll"}
        ]);
        let imports = parse_imports(&value, 10, &mut warnings);
        assert_eq!(imports[0].library, "libc.so.6");
        assert_eq!(imports[0].function.as_deref(), Some("printf"));
        assert_eq!(imports[0].address.as_deref(), Some("0x4010a0"));
        assert!(imports[1].function.is_none());
        assert_eq!(imports[1].ordinal, Some(12));
    }

    #[test]
    fn strings_map_encodings() {
        let mut warnings = Vec::new();
        let value = json!([
            {"string": "hello", "vaddr": 0x402000u64, "size": 6, "type": "ascii", "section": ".rodata"},
            {"string": "wide", "vaddr": 0x402010u64, "size": 10, "type": "utf16le"},
            {"string": "wider", "vaddr": 0x402020u64, "size": 20, "type": "utf32le"}
        ]);
        let strings = parse_strings(&value, 10, &mut warnings);
        assert_eq!(strings[0].encoding, StringEncoding::Ascii);
        assert_eq!(strings[0].section.as_deref(), Some(".rodata"));
        assert_eq!(strings[1].encoding, StringEncoding::Utf16);
        assert_eq!(strings[2].encoding, StringEncoding::Utf32);
        assert_eq!(strings[0].address, "0x402000");
    }

    #[test]
    fn binary_info_reads_arch_and_format() {
        let info = BinaryInfo::from_value(&json!({
            "core": {"format": "elf64"},
            "bin": {"arch": "x86", "bits": 64}
        }));
        assert_eq!(info.architecture, "x86_64");
        assert_eq!(info.reported_format.as_deref(), Some("elf64"));
    }
}
