// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Queries against the host VCS: enumerating tracked paths and resolving
//! which key, if any, each path is bound to via its filter attribute.

use crate::error::HostVcsError;
use crate::process::ProcessChannel;

/// A single tracked regular-file entry from the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub path: String,
    pub object_id: String,
    pub stage: u8,
}

const REGULAR_FILE_MODE: &str = "100644";
const EXECUTABLE_FILE_MODE: &str = "100755";

/// Parse the output of an index-listing invocation (`ls-files --stage -z`
/// style: `<mode> <object> <stage>\t<name>`, NUL-terminated records),
/// rejecting entries whose mode is not a regular file.
pub fn parse_index_listing(raw: &[u8]) -> Result<Vec<IndexEntry>, HostVcsError> {
    let text = std::str::from_utf8(raw).map_err(|_| HostVcsError::BadOutput {
        command: "index listing".into(),
        detail: "output was not valid UTF-8".into(),
    })?;

    let mut entries = Vec::new();
    for record in text.split('\0').filter(|r| !r.is_empty()) {
        let (meta, name) = record.split_once('\t').ok_or_else(|| HostVcsError::ProtocolViolation {
            command: "index listing".into(),
            detail: format!("record missing tab separator: {record:?}"),
        })?;
        let mut fields = meta.split_whitespace();
        let mode = fields.next().ok_or_else(|| HostVcsError::ProtocolViolation {
            command: "index listing".into(),
            detail: "record missing mode".into(),
        })?;
        let object_id = fields.next().ok_or_else(|| HostVcsError::ProtocolViolation {
            command: "index listing".into(),
            detail: "record missing object id".into(),
        })?;
        let stage = fields.next().ok_or_else(|| HostVcsError::ProtocolViolation {
            command: "index listing".into(),
            detail: "record missing stage".into(),
        })?;
        let stage: u8 = stage.parse().map_err(|_| HostVcsError::BadOutput {
            command: "index listing".into(),
            detail: format!("stage was not numeric: {stage:?}"),
        })?;

        if mode != REGULAR_FILE_MODE && mode != EXECUTABLE_FILE_MODE {
            continue;
        }

        entries.push(IndexEntry { path: name.to_string(), object_id: object_id.to_string(), stage });
    }
    Ok(entries)
}

/// Values the host VCS reports for an unbound attribute; any of these, or
/// an empty value, means "no binding".
fn is_unbound_value(value: &str) -> bool {
    matches!(value, "" | "unspecified" | "unset" | "set")
}

/// The key a path is bound to, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyBinding {
    None,
    Default,
    Named(String),
}

fn classify_filter_value(value: &str) -> KeyBinding {
    if is_unbound_value(value) {
        return KeyBinding::None;
    }
    if value == "git-crypt" {
        return KeyBinding::Default;
    }
    if let Some(name) = value.strip_prefix("git-crypt-") {
        return KeyBinding::Named(name.to_string());
    }
    KeyBinding::None
}

/// Parse a batch check-attr response: NUL-framed triples of
/// `path\0attribute\0value` repeated for each queried path, in the order
/// requested.
pub fn parse_batch_attribute_response(raw: &[u8], expected_paths: &[String]) -> Result<Vec<KeyBinding>, HostVcsError> {
    let text = std::str::from_utf8(raw).map_err(|_| HostVcsError::BadOutput {
        command: "check-attr".into(),
        detail: "output was not valid UTF-8".into(),
    })?;
    let fields: Vec<&str> = text.split('\0').filter(|f| !f.is_empty()).collect();
    if fields.len() != expected_paths.len() * 3 {
        return Err(HostVcsError::ProtocolViolation {
            command: "check-attr".into(),
            detail: format!(
                "expected {} fields for {} paths, got {}",
                expected_paths.len() * 3,
                expected_paths.len(),
                fields.len()
            ),
        });
    }
    Ok(fields.chunks(3).map(|chunk| classify_filter_value(chunk[2])).collect())
}

/// Resolve the key binding for every regular-file index entry, using batch
/// attribute queries when `supports_batch` is true and falling back to one
/// query per path otherwise (for host VCS versions older than 1.8.5).
pub async fn resolve_bindings(
    git_path: &str,
    entries: &[IndexEntry],
    supports_batch: bool,
) -> Result<Vec<(IndexEntry, KeyBinding)>, HostVcsError> {
    let paths: Vec<String> = entries.iter().map(|e| e.path.clone()).collect();

    let bindings = if supports_batch {
        let channel = ProcessChannel::spawn_capturing_stderr(
            git_path,
            &["check-attr", "--stdin", "-z", "filter"],
        )?;
        let mut input = Vec::new();
        for path in &paths {
            input.extend_from_slice(path.as_bytes());
            input.push(0);
        }
        let output = channel.exchange(input).await?;
        parse_batch_attribute_response(&output, &paths)?
    } else {
        let mut bindings = Vec::with_capacity(paths.len());
        for path in &paths {
            let channel = ProcessChannel::spawn_capturing_stderr(git_path, &["check-attr", "filter", "--", path])?;
            let output = channel.exchange(Vec::new()).await?;
            let single = parse_batch_attribute_response(
                &reframe_individual_response(&output),
                std::slice::from_ref(path),
            )?;
            bindings.push(single.into_iter().next().unwrap_or(KeyBinding::None));
        }
        bindings
    };

    Ok(entries.iter().cloned().zip(bindings).collect())
}

/// `git check-attr` without `-z` prints `path: attribute: value\n`; rewrite
/// that into the same NUL-framed triple shape the batch parser expects.
fn reframe_individual_response(raw: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(raw);
    let mut out = Vec::new();
    if let Some(line) = text.lines().next() {
        for part in line.splitn(3, ':').map(|s| s.trim()) {
            out.extend_from_slice(part.as_bytes());
            out.push(0);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_regular_file_entries_and_skips_others() {
        let raw = b"100644 abc123 0\tsrc/main.rs\0120000 def456 0\tsrc/link\0100755 fff000 0\tscripts/run.sh\0";
        let entries = parse_index_listing(raw).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "src/main.rs");
        assert_eq!(entries[1].path, "scripts/run.sh");
    }

    #[test]
    fn classifies_filter_values() {
        assert_eq!(classify_filter_value(""), KeyBinding::None);
        assert_eq!(classify_filter_value("unspecified"), KeyBinding::None);
        assert_eq!(classify_filter_value("unset"), KeyBinding::None);
        assert_eq!(classify_filter_value("set"), KeyBinding::None);
        assert_eq!(classify_filter_value("git-crypt"), KeyBinding::Default);
        assert_eq!(classify_filter_value("git-crypt-team-A"), KeyBinding::Named("team-A".to_string()));
        assert_eq!(classify_filter_value("text"), KeyBinding::None);
    }

    #[test]
    fn parses_batch_attribute_response() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"secrets.txt\0filter\0git-crypt\0");
        raw.extend_from_slice(b"readme.md\0filter\0unspecified\0");
        let paths = vec!["secrets.txt".to_string(), "readme.md".to_string()];
        let bindings = parse_batch_attribute_response(&raw, &paths).unwrap();
        assert_eq!(bindings, vec![KeyBinding::Default, KeyBinding::None]);
    }

    #[test]
    fn batch_response_field_count_mismatch_is_protocol_violation() {
        let raw = b"secrets.txt\0filter\0git-crypt\0";
        let paths = vec!["secrets.txt".to_string(), "readme.md".to_string()];
        let err = parse_batch_attribute_response(raw, &paths).unwrap_err();
        assert!(matches!(err, HostVcsError::ProtocolViolation { .. }));
    }

    #[test]
    fn reframes_individual_response_line() {
        let raw = b"secrets.txt: filter: git-crypt-team-A\n";
        let reframed = reframe_individual_response(raw);
        let bindings = parse_batch_attribute_response(&reframed, &["secrets.txt".to_string()]).unwrap();
        assert_eq!(bindings, vec![KeyBinding::Named("team-A".to_string())]);
    }
}
