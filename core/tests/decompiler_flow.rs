//! Decompiler adapter against a scripted disassembler that speaks the
//! NUL-framed pipe protocol: full artifact assembly, cross-checking and
//! cleanup.

use std::path::{Path, PathBuf};

use binsight_core::cancel::CancelToken;
use binsight_core::config::{DecompilerSettings, LimitSettings};
use binsight_core::decompiler::Decompiler;
use binsight_core::model::{AnalysisDepth, BinaryFormat, Platform, StringEncoding};

const FAKE_DISASSEMBLER: &str = r#"#!/bin/sh
printf '\0'
while IFS= read -r line; do
  case "$line" in
    '?V') printf '5.9.8\0' ;;
    'ij') printf '{"core":{"format":"elf64"},"bin":{"arch":"x86","bits":64,"os":"linux"}}\0' ;;
    'aa'|'aaa'|'aaaa') printf '\0' ;;
    'iej') printf '[{"vaddr":4198400}]\0' ;;
    'iSj') printf '[{"name":".text"},{"name":".rodata"}]\0' ;;
    'aflj') printf '[{"name":"main","offset":4198400,"size":64,"callrefs":[{"addr":4198500,"type":"CALL","name":"sym.imp.puts"}],"datarefs":[4202496]},{"name":"sub_401100","offset":4198656,"size":32}]\0' ;;
    'iij') printf '[{"name":"puts","libname":"libc.so.6","plt":4198600},{"ordinal":12,"libname":"libm.so.6","name":""}]\0' ;;
    'izj') printf '[{"string":"hello world","vaddr":4202496,"size":12,"type":"ascii","section":".rodata"},{"string":"wide","vaddr":4202520,"size":10,"type":"utf16le","section":".rodata"}]\0' ;;
    pdf*) printf 'push rbp\nmov rbp, rsp\nret\0' ;;
    *) printf '\0' ;;
  esac
done
"#;

fn install_fake(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-disassembler.sh");
    std::fs::write(&path, FAKE_DISASSEMBLER).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn settings(binary: &Path) -> DecompilerSettings {
    DecompilerSettings {
        binary: binary.to_string_lossy().into_owned(),
        command_timeout_secs: 5,
        max_retries: 2,
    }
}

fn elf_blob() -> Vec<u8> {
    let mut bytes = vec![0x7f, b'E', b'L', b'F', 2, 1, 1, 0];
    bytes.extend_from_slice(&[0u8; 56]);
    bytes.extend_from_slice(b"hello world\0");
    bytes
}

#[tokio::test]
async fn builds_a_complete_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let fake = install_fake(dir.path());
    let blob_path = dir.path().join("target.elf");
    let blob = elf_blob();
    std::fs::write(&blob_path, &blob).unwrap();

    let decompiler = Decompiler::new(settings(&fake), LimitSettings::default());
    let artifact = decompiler
        .analyze(
            &blob_path,
            AnalysisDepth::Standard,
            true,
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert!(artifact.success);
    assert_eq!(artifact.format, BinaryFormat::Elf);
    assert_eq!(artifact.platform, Platform::Linux);
    assert_eq!(artifact.architecture, "x86_64");
    assert_eq!(artifact.entry_point.as_deref(), Some("0x401000"));
    assert_eq!(artifact.sections, vec![".text", ".rodata"]);
    assert_eq!(artifact.size_bytes, blob.len() as u64);

    // sha256 is computed from the file, not taken from the disassembler.
    use sha2::{Digest, Sha256};
    assert_eq!(artifact.sha256, hex::encode(Sha256::digest(&blob)));

    assert_eq!(artifact.functions.len(), 2);
    let main = &artifact.functions[0];
    assert_eq!(main.name, "main");
    assert_eq!(main.address, "0x401000");
    assert_eq!(main.calls_to, vec!["sym.imp.puts"]);
    assert_eq!(main.string_refs, vec!["0x402000"]);
    assert_eq!(main.imports_used, vec!["sym.imp.puts"]);
    assert!(main.assembly.as_deref().unwrap().contains("push rbp"));
    assert_eq!(artifact.functions[1].size, 32);

    assert_eq!(artifact.imports.len(), 2);
    assert_eq!(artifact.imports[0].library, "libc.so.6");
    assert_eq!(artifact.imports[0].function.as_deref(), Some("puts"));
    assert_eq!(artifact.imports[0].address.as_deref(), Some("0x4010c8"));
    assert!(artifact.imports[1].function.is_none());
    assert_eq!(artifact.imports[1].ordinal, Some(12));

    assert_eq!(artifact.strings.len(), 2);
    assert_eq!(artifact.strings[0].value, "hello world");
    assert_eq!(artifact.strings[0].encoding, StringEncoding::Ascii);
    assert_eq!(artifact.strings[1].encoding, StringEncoding::Utf16);

    assert!(artifact.duration_seconds > 0.0);
    assert!(artifact.warnings.is_empty(), "{:?}", artifact.warnings);
    // The input blob is not the session's temp file; it stays put for the
    // worker to clean up.
    assert!(blob_path.exists());
}

#[tokio::test]
async fn signature_mismatch_is_cross_checked() {
    let dir = tempfile::tempdir().unwrap();
    let fake = install_fake(dir.path());
    let blob_path = dir.path().join("target.exe");
    // PE signature while the scripted disassembler reports elf64.
    std::fs::write(&blob_path, b"MZ\x90\x00\x03\x00\x00\x00rest-of-file").unwrap();

    let decompiler = Decompiler::new(settings(&fake), LimitSettings::default());
    let artifact = decompiler
        .analyze(&blob_path, AnalysisDepth::Basic, false, &CancelToken::new())
        .await
        .unwrap();

    // The file signature wins; the disagreement is surfaced.
    assert_eq!(artifact.format, BinaryFormat::Pe);
    assert_eq!(artifact.platform, Platform::Windows);
    assert!(artifact
        .warnings
        .iter()
        .any(|w| w.starts_with("format mismatch")));
    // No assembly was requested.
    assert!(artifact.functions[0].assembly.is_none());
}

#[tokio::test]
async fn caps_bound_each_extraction_list() {
    let dir = tempfile::tempdir().unwrap();
    let fake = install_fake(dir.path());
    let blob_path = dir.path().join("target.elf");
    std::fs::write(&blob_path, elf_blob()).unwrap();

    let limits = LimitSettings {
        max_functions: 1,
        max_strings: 1,
        max_imports: 1,
        ..LimitSettings::default()
    };
    let decompiler = Decompiler::new(settings(&fake), limits);
    let artifact = decompiler
        .analyze(&blob_path, AnalysisDepth::Basic, false, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(artifact.functions.len(), 1);
    assert_eq!(artifact.imports.len(), 1);
    assert_eq!(artifact.strings.len(), 1);
    assert!(artifact
        .warnings
        .iter()
        .any(|w| w.starts_with("function_list_truncated")));
    assert!(artifact
        .warnings
        .iter()
        .any(|w| w.starts_with("string_list_truncated")));
    assert!(artifact
        .warnings
        .iter()
        .any(|w| w.starts_with("import_list_truncated")));
}

#[tokio::test]
async fn cancellation_aborts_before_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let fake = install_fake(dir.path());
    let blob_path = dir.path().join("target.elf");
    std::fs::write(&blob_path, elf_blob()).unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();

    let decompiler = Decompiler::new(settings(&fake), LimitSettings::default());
    let result = decompiler
        .analyze(&blob_path, AnalysisDepth::Standard, false, &cancel)
        .await;
    assert!(result.is_err());
}
