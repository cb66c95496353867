//! Reader/writer for the `live_streams.sii` unit file.
//!
//! Only the `stream_data[i]` entries are meaningful; everything else in the
//! file is fixed boilerplate that [`serialize`] regenerates.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::StreamError;
use crate::record::{default_extra, StreamRecord};

const ENTRY_MARKER: &str = "stream_data[";
const UNIT_NAME: &str = "_nameless.23f.d60f.8a20";

/// Fields every entry must carry: url, name, genre, language, bitrate.
const REQUIRED_FIELDS: usize = 5;

/// Parse every stream entry in `content`.
///
/// Malformed entries are skipped with a warning; they never abort the load.
pub fn parse(content: &str) -> Vec<StreamRecord> {
    let mut records = Vec::new();

    for (line_no, line) in content.lines().enumerate() {
        if !line.contains(ENTRY_MARKER) {
            continue;
        }

        let Some(quoted) = quoted_value(line) else {
            warn!("sii: line {} has no quoted value, skipping: {}", line_no + 1, line);
            continue;
        };

        let parts: Vec<&str> = quoted.split('|').collect();
        if parts.len() < REQUIRED_FIELDS {
            warn!(
                "sii: line {} has {} fields (need {}), skipping: {}",
                line_no + 1,
                parts.len(),
                REQUIRED_FIELDS,
                line
            );
            continue;
        }

        records.push(StreamRecord {
            url: parts[0].to_string(),
            name: parts[1].to_string(),
            genre: parts[2].to_string(),
            language: parts[3].to_string(),
            bitrate: parts[4].to_string(),
            extra: parts
                .get(5)
                .map(|s| s.to_string())
                .unwrap_or_else(default_extra),
        });
    }

    records
}

/// Text after the first `"` up to the next one, or to end of line when the
/// closing quote is missing.
fn quoted_value(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once('"')?;
    Some(rest.split('"').next().unwrap_or(rest))
}

pub fn serialize(records: &[StreamRecord]) -> String {
    let mut out = String::with_capacity(128 + records.len() * 96);
    out.push_str("SiiNunit\n{\n");
    out.push_str(&format!("live_stream_def : {} {{\n", UNIT_NAME));
    out.push_str(&format!(" stream_data: {}\n", records.len()));
    for (i, r) in records.iter().enumerate() {
        out.push_str(&format!(
            "stream_data[{}]: \"{}|{}|{}|{}|{}|{}\"\n",
            i, r.url, r.name, r.genre, r.language, r.bitrate, r.extra
        ));
    }
    out.push_str("}\n}\n");
    out
}

/// Read and parse a list file. The caller's state is untouched on failure
/// because nothing is returned until the whole file has been read.
pub async fn read_file(path: &Path) -> Result<Vec<StreamRecord>, StreamError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| StreamError::persistence(path, e))?;
    let records = parse(&content);
    info!("sii: loaded {} streams from {:?}", records.len(), path);
    Ok(records)
}

/// How [`write_file`] treats a file that already exists at the target path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub overwrite: bool,
    pub backup: bool,
}

/// Write `records` to `path`. Returns the backup path when one was made.
pub async fn write_file(
    path: &Path,
    records: &[StreamRecord],
    opts: WriteOptions,
) -> Result<Option<PathBuf>, StreamError> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| StreamError::persistence(path, e))?;

    let mut backup_path = None;
    if exists {
        if !opts.overwrite {
            return Err(StreamError::FileExists(path.to_path_buf()));
        }
        if opts.backup {
            let backup = backup_path_for(path, chrono::Local::now());
            tokio::fs::copy(path, &backup)
                .await
                .map_err(|e| StreamError::persistence(&backup, e))?;
            info!("sii: backed up {:?} to {:?}", path, backup);
            backup_path = Some(backup);
        }
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StreamError::persistence(parent, e))?;
    }
    tokio::fs::write(path, serialize(records))
        .await
        .map_err(|e| StreamError::persistence(path, e))?;
    info!("sii: saved {} streams to {:?}", records.len(), path);
    Ok(backup_path)
}

/// `<path>.<YYYYmmdd_HHMMSS>.bak`
pub fn backup_path_for(path: &Path, at: chrono::DateTime<chrono::Local>) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}.bak", at.format("%Y%m%d_%H%M%S")));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"SiiNunit
{
live_stream_def : _nameless.23f.d60f.8a20 {
 stream_data: 3
stream_data[0]: "http://a.example.com/live|Alpha FM|Rock|EN|128|1"
stream_data[1]: "http://b.example.com/live|Beta|Jazz|DE|64"
stream_data[2]: "http://c.example.com/live|Gamma|Pop"
}
}
"#;

    fn records() -> Vec<StreamRecord> {
        vec![
            StreamRecord::new("http://a.example.com/live", "Alpha FM", "Rock", "EN", "128")
                .with_extra("1"),
            StreamRecord::new("https://b.example.com/x", "Beta", "", "", "64"),
        ]
    }

    #[test]
    fn parses_entries_and_defaults_extra() {
        let parsed = parse(SAMPLE);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "Alpha FM");
        assert_eq!(parsed[0].extra, "1");
        assert_eq!(parsed[1].bitrate, "64");
        assert_eq!(parsed[1].extra, "0");
    }

    #[test]
    fn short_and_unquoted_lines_are_skipped_not_fatal() {
        let content = "stream_data[0]: \"a|b\"\nstream_data[1]: no quotes here\nstream_data[2]: \"http://x.example.com|X|G|L|96|0\"\n";
        let parsed = parse(content);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "X");
    }

    #[test]
    fn missing_closing_quote_reads_to_end_of_line() {
        let parsed = parse("stream_data[0]: \"http://x.example.com|X|G|L|96");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].bitrate, "96");
    }

    #[test]
    fn round_trip_is_lossless() {
        let original = records();
        assert_eq!(parse(&serialize(&original)), original);
    }

    #[test]
    fn empty_collection_round_trips() {
        let text = serialize(&[]);
        assert!(text.contains(" stream_data: 0\n"));
        assert!(!text.contains(ENTRY_MARKER));
        assert!(parse(&text).is_empty());
    }

    #[test]
    fn serialize_matches_unit_layout() {
        let text = serialize(&records()[..1]);
        assert_eq!(
            text,
            "SiiNunit\n{\nlive_stream_def : _nameless.23f.d60f.8a20 {\n stream_data: 1\nstream_data[0]: \"http://a.example.com/live|Alpha FM|Rock|EN|128|1\"\n}\n}\n"
        );
    }

    #[test]
    fn backup_name_is_timestamped() {
        use chrono::TimeZone;
        let at = chrono::Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let p = backup_path_for(Path::new("/tmp/live_streams.sii"), at);
        assert_eq!(p, PathBuf::from("/tmp/live_streams.sii.20240309_140507.bak"));
    }

    #[tokio::test]
    async fn write_refuses_to_clobber_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_streams.sii");
        write_file(&path, &records(), WriteOptions::default())
            .await
            .unwrap();

        let err = write_file(&path, &[], WriteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::FileExists(_)));
        assert_eq!(read_file(&path).await.unwrap(), records());
    }

    #[tokio::test]
    async fn overwrite_with_backup_keeps_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_streams.sii");
        write_file(&path, &records(), WriteOptions::default())
            .await
            .unwrap();

        let backup = write_file(
            &path,
            &records()[..1],
            WriteOptions {
                overwrite: true,
                backup: true,
            },
        )
        .await
        .unwrap()
        .expect("backup path");

        assert_eq!(read_file(&backup).await.unwrap(), records());
        assert_eq!(read_file(&path).await.unwrap(), records()[..1].to_vec());
    }

    #[tokio::test]
    async fn reading_a_missing_file_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_file(&dir.path().join("nope.sii")).await.unwrap_err();
        assert!(matches!(err, StreamError::Persistence { .. }));
    }
}
