//! Tar handling: single-file upload archives, import validation and
//! export command assembly

use std::io::Read;

use bytes::Bytes;
use chrono::Utc;
use flate2::read::GzDecoder;
use tar::{Archive, Builder, EntryType, Header};
use tracing::warn;

use super::path::WORKSPACE_ROOT;
use crate::error::{DaemonError, Result};

/// Outcome of a tar import.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ImportReport {
    pub bytes_written: usize,
    pub files_created: i64,
    pub dest_path: String,
}

/// Build an in-memory tar holding one file, for the engine's put-archive
/// endpoint. The archive is extracted at the file's parent directory.
pub fn single_file_tar(file_name: &str, content: &[u8], uid: u64, gid: u64) -> Result<Bytes> {
    let mut builder = Builder::new(Vec::new());

    let mut header = Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_uid(uid);
    header.set_gid(gid);
    header.set_mtime(Utc::now().timestamp() as u64);
    header.set_entry_type(EntryType::Regular);

    builder
        .append_data(&mut header, file_name, content)
        .map_err(|e| DaemonError::Internal(format!("failed to build upload archive: {e}")))?;

    let raw = builder
        .into_inner()
        .map_err(|e| DaemonError::Internal(format!("failed to finish upload archive: {e}")))?;

    Ok(Bytes::from(raw))
}

/// Inspect every member of a tar (optionally gzipped) and reject anything
/// that would land outside the workspace once extracted at `dest`.
///
/// Symlinks and hardlinks are logged and accepted; the container mount
/// layout bounds what they can reach.
pub fn validate_tar_members(data: &[u8], dest: &str) -> Result<()> {
    if is_gzip(data) {
        let decoder = GzDecoder::new(data);
        validate_entries(Archive::new(decoder), dest)
    } else {
        validate_entries(Archive::new(data), dest)
    }
}

fn validate_entries<R: Read>(mut archive: Archive<R>, dest: &str) -> Result<()> {
    let entries = archive
        .entries()
        .map_err(|e| DaemonError::Validation(format!("invalid tar archive: {e}")))?;

    for entry in entries {
        let entry =
            entry.map_err(|e| DaemonError::Validation(format!("invalid tar archive: {e}")))?;
        let header = entry.header();

        let raw_path = entry
            .path_bytes()
            .iter()
            .map(|b| *b as char)
            .collect::<String>();

        if raw_path.starts_with('/') {
            return Err(member_error(&raw_path, "tar contains absolute paths"));
        }

        if raw_path.split('/').any(|segment| segment == "..") {
            return Err(member_error(
                &raw_path,
                "tar contains parent directory references",
            ));
        }

        // The joined path must still normalize into the workspace.
        let joined = format!("{}/{}", dest.trim_end_matches('/'), raw_path);
        let normalized = normalize_lexically(&joined);
        if normalized != WORKSPACE_ROOT && !normalized.starts_with(&format!("{WORKSPACE_ROOT}/"))
        {
            return Err(member_error(
                &raw_path,
                &format!("tar would extract outside workspace: {normalized}"),
            ));
        }

        match header.entry_type() {
            EntryType::Symlink | EntryType::Link => {
                warn!(member = %raw_path, "tar contains a link entry, extracting anyway");
            }
            _ => {}
        }
    }

    Ok(())
}

/// Shell command producing a tar stream of `path`, honoring include and
/// exclude globs. Runs inside the container via `sh -c`.
pub fn export_command(
    path: &str,
    include_globs: &[String],
    exclude_globs: &[String],
    compress: bool,
) -> String {
    let z = if compress { "z" } else { "" };

    if include_globs.is_empty() && exclude_globs.is_empty() {
        return format!("tar -c{z}f - -C {} .", shell_quote(path));
    }

    let mut find = String::from("find .");
    if !include_globs.is_empty() {
        find.push_str(" -type f \\(");
        for (i, pattern) in include_globs.iter().enumerate() {
            if i > 0 {
                find.push_str(" -o");
            }
            find.push_str(&format!(" -path {}", shell_quote(pattern)));
        }
        find.push_str(" \\)");
    }
    for pattern in exclude_globs {
        find.push_str(&format!(" ! -path {}", shell_quote(pattern)));
    }

    format!("cd {} && {} | tar -c{z} -T -", shell_quote(path), find)
}

/// Single-quote a string for `sh -c`.
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r#"'\''"#))
}

fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

fn member_error(member: &str, reason: &str) -> DaemonError {
    DaemonError::PathSecurity {
        path: member.to_string(),
        reason: reason.to_string(),
    }
}

/// Collapse `.` and `..` lexically without consulting a filesystem.
fn normalize_lexically(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn tar_with_member(name: &str) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        let content = b"data";
        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        // Bypass `set_path`'s `..` rejection to construct a deliberately malicious
        // member name for validate_tar_members to reject.
        let name_bytes = name.as_bytes();
        header.as_old_mut().name[..name_bytes.len()].copy_from_slice(name_bytes);
        header.set_cksum();
        builder.append(&header, &content[..]).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_valid_members_pass() {
        let data = tar_with_member("src/lib.rs");
        assert!(validate_tar_members(&data, "/workspace").is_ok());
        assert!(validate_tar_members(&data, "/workspace/project").is_ok());
    }

    #[test]
    fn test_parent_references_rejected() {
        let data = tar_with_member("../escape.txt");
        let err = validate_tar_members(&data, "/workspace").unwrap_err();
        assert_eq!(err.category(), "path_security_error");
    }

    #[test]
    fn test_nested_parent_reference_rejected() {
        let data = tar_with_member("ok/../../escape.txt");
        assert!(validate_tar_members(&data, "/workspace").is_err());
    }

    #[test]
    fn test_gzipped_archives_are_inspected() {
        let raw = tar_with_member("../escape.txt");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).unwrap();
        let gz = encoder.finish().unwrap();

        assert!(validate_tar_members(&gz, "/workspace").is_err());
    }

    #[test]
    fn test_garbage_is_invalid() {
        let err = validate_tar_members(b"not a tar at all", "/workspace").unwrap_err();
        assert_eq!(err.category(), "validation_error");
    }

    #[test]
    fn test_single_file_tar_roundtrip() {
        let data = single_file_tar("hello.txt", b"hi there", 1000, 1000).unwrap();

        let mut archive = Archive::new(&data[..]);
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str().unwrap(), "hello.txt");
        assert_eq!(entry.header().uid().unwrap(), 1000);
        assert_eq!(entry.header().mode().unwrap(), 0o644);

        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hi there");
    }

    #[test]
    fn test_export_command_shapes() {
        assert_eq!(
            export_command("/workspace", &[], &[], true),
            "tar -czf - -C '/workspace' ."
        );

        let cmd = export_command(
            "/workspace",
            &["./src/*".to_string()],
            &["./target/*".to_string()],
            false,
        );
        assert!(cmd.starts_with("cd '/workspace' && find ."));
        assert!(cmd.contains("-path './src/*'"));
        assert!(cmd.contains("! -path './target/*'"));
        assert!(cmd.ends_with("| tar -c -T -"));
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
    }
}
