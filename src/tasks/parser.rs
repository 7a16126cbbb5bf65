//! Tool output parsing.
//!
//! One [`OutputParser`] is created per task stream. Each line yields at most
//! one [`ParsedEvent`]; lines the parser does not recognise produce nothing and
//! stay in the raw output buffer. The only cross-line state is the stats table
//! accumulator, which pairs an archive row with the `(unique data)` row that
//! follows it.

use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Timestamp format of archive listings.
const LISTING_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `tarsnap: message` style diagnostics.
static DIAGNOSTIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w.-]+:\s+(.+)$").expect("valid diagnostic regex"));

/// `Processed 12 files, 3.4 MB` progress lines.
static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)processed\s+(\d+)\s+files?,\s+([\d.]+)\s*(bytes|b|kb|mb|gb|tb)\b")
        .expect("valid progress regex")
});

/// A stats table row: label followed by two byte counts.
static STATS_ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(.*\S)\s+(\d+)\s+(\d+)\s*$").expect("valid stats regex"));

/// `tarsnap 1.0.40` style version banner.
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\S+\s+v?(\d+\.\d+(?:\.\d+)?\S*)\s*$").expect("valid version regex")
});

/// Error marker patterns, checked in order. Lowercase substrings.
static ERROR_MARKERS: &[(&str, ErrorClass)] = &[
    ("account balance", ErrorClass::QuotaExceeded),
    ("connection lost", ErrorClass::Network),
    ("connection reset", ErrorClass::Network),
    ("error reading from server", ErrorClass::Network),
    ("error writing to server", ErrorClass::Network),
    ("error connecting to", ErrorClass::Network),
    ("could not connect", ErrorClass::Network),
    ("network is unreachable", ErrorClass::Network),
    ("temporary failure in name resolution", ErrorClass::Network),
    ("timed out", ErrorClass::Network),
    ("cannot obtain lock", ErrorClass::LockContention),
    ("is already running", ErrorClass::LockContention),
    ("resource temporarily unavailable", ErrorClass::LockContention),
    ("--fsck", ErrorClass::CacheOutOfSync),
    ("sequence number mismatch", ErrorClass::CacheOutOfSync),
    ("cache directory", ErrorClass::CacheOutOfSync),
    ("key file", ErrorClass::KeyFile),
    ("keyfile", ErrorClass::KeyFile),
    ("already exists", ErrorClass::ArchiveExists),
    ("archive does not exist", ErrorClass::ArchiveNotFound),
    ("no such archive", ErrorClass::ArchiveNotFound),
    ("error exit delayed from previous errors", ErrorClass::Generic),
    ("fatal", ErrorClass::Generic),
];

/// Classification of a tool-reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Connection dropped or server unreachable.
    Network,
    /// Another tool instance holds the shared lock.
    LockContention,
    /// The account has run out of credit.
    QuotaExceeded,
    /// The local cache no longer matches the server; needs a repair.
    CacheOutOfSync,
    /// Key file missing or unreadable.
    KeyFile,
    ArchiveExists,
    ArchiveNotFound,
    Generic,
}

impl ErrorClass {
    /// Whether the failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network | Self::LockContention)
    }
}

/// An error marker found in the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMarker {
    pub class: ErrorClass,
    pub message: String,
}

/// An archive as described by the tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    pub name: String,
    /// Creation time as printed by the tool (local wall-clock time).
    pub created_at: Option<NaiveDateTime>,
    /// Command line that created the archive, when listed verbosely.
    pub command: Option<String>,
    pub size_total: Option<u64>,
    pub size_compressed: Option<u64>,
    pub size_unique_total: Option<u64>,
    /// Compressed size of data stored only by this archive.
    pub size_unique: Option<u64>,
    pub contents: Option<Vec<String>>,
}

impl Archive {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Fill in sizes from a stats row about this archive.
    pub fn apply_stats(&mut self, stats: &ArchiveStats) {
        self.size_total = Some(stats.total);
        self.size_compressed = Some(stats.compressed);
        self.size_unique_total = stats.unique_total;
        self.size_unique = stats.unique_compressed;
    }
}

/// Which row of a stats table a record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "name", rename_all = "snake_case")]
pub enum StatsScope {
    /// Totals across every archive of the machine.
    AllArchives,
    /// The archive just written by a backup.
    ThisArchive,
    /// A named archive (`--print-stats -f name`).
    Archive(String),
}

/// Sizes reported in a stats table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub scope: StatsScope,
    pub total: u64,
    pub compressed: u64,
    pub unique_total: Option<u64>,
    pub unique_compressed: Option<u64>,
}

/// A structured record recognised in tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    ArchiveListed(Archive),
    StatsReported(ArchiveStats),
    ProgressTick { files: u64, bytes_done: u64 },
    ErrorMarker(ErrorMarker),
    /// One entry of an archive's contents listing.
    ContentEntry(String),
    ToolVersion(String),
}

/// Which record class the stream's ordinary lines belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Only diagnostics, progress and stats are recognised.
    Generic,
    /// Every ordinary line is an archive (`name<TAB>date[<TAB>command]`).
    Listing,
    /// Every ordinary line is a contents entry.
    Contents,
    /// The stream carries a version banner.
    Version,
}

/// Stateful per-stream parser.
#[derive(Debug)]
pub struct OutputParser {
    mode: ParseMode,
    in_stats_table: bool,
    pending_row: Option<ArchiveStats>,
}

impl OutputParser {
    pub fn new(mode: ParseMode) -> Self {
        Self {
            mode,
            in_stats_table: false,
            pending_row: None,
        }
    }

    /// Parse one raw line.
    pub fn parse_line(&mut self, raw: &str) -> Option<ParsedEvent> {
        let line = raw.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }

        if let Some(marker) = detect_error_marker(line) {
            return Some(ParsedEvent::ErrorMarker(marker));
        }

        if let Some(caps) = PROGRESS_RE.captures(line) {
            let files = caps[1].parse().unwrap_or(0);
            let bytes_done = scale_bytes(&caps[2], &caps[3]);
            return Some(ParsedEvent::ProgressTick { files, bytes_done });
        }

        if line.contains("Total size") && line.contains("Compressed size") {
            self.in_stats_table = true;
            return self.pending_row.take().map(ParsedEvent::StatsReported);
        }

        if self.in_stats_table {
            if let Some(event) = self.parse_stats_row(line) {
                return event;
            }
            // A non-row line ends the table.
            self.in_stats_table = false;
            if let Some(stats) = self.pending_row.take() {
                return Some(ParsedEvent::StatsReported(stats));
            }
        }

        match self.mode {
            ParseMode::Listing => parse_listing(line).map(ParsedEvent::ArchiveListed),
            ParseMode::Contents => Some(ParsedEvent::ContentEntry(line.to_string())),
            ParseMode::Version => VERSION_RE
                .captures(line.trim())
                .map(|caps| ParsedEvent::ToolVersion(caps[1].to_string())),
            ParseMode::Generic => None,
        }
    }

    /// Flush any half-read record at end of stream.
    pub fn finish(&mut self) -> Option<ParsedEvent> {
        self.in_stats_table = false;
        self.pending_row.take().map(ParsedEvent::StatsReported)
    }

    /// Returns `Some(event)` when the line is a table row (the inner option
    /// carries a completed record, if any).
    fn parse_stats_row(&mut self, line: &str) -> Option<Option<ParsedEvent>> {
        let caps = STATS_ROW_RE.captures(line)?;
        let label = caps[1].trim();
        let total: u64 = caps[2].parse().ok()?;
        let compressed: u64 = caps[3].parse().ok()?;

        if label == "(unique data)" || label == "New data" {
            return Some(self.pending_row.take().map(|mut row| {
                row.unique_total = Some(total);
                row.unique_compressed = Some(compressed);
                ParsedEvent::StatsReported(row)
            }));
        }

        let scope = match label {
            "All archives" => StatsScope::AllArchives,
            "This archive" => StatsScope::ThisArchive,
            name => StatsScope::Archive(name.to_string()),
        };
        let previous = self.pending_row.replace(ArchiveStats {
            scope,
            total,
            compressed,
            unique_total: None,
            unique_compressed: None,
        });
        Some(previous.map(ParsedEvent::StatsReported))
    }
}

/// Classify a diagnostic line.
pub fn detect_error_marker(line: &str) -> Option<ErrorMarker> {
    let caps = DIAGNOSTIC_RE.captures(line.trim())?;
    let message = caps[1].trim();
    let lower = message.to_lowercase();
    ERROR_MARKERS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, class)| ErrorMarker {
            class: *class,
            message: message.to_string(),
        })
}

fn parse_listing(line: &str) -> Option<Archive> {
    let mut fields = line.split('\t');
    let name = fields.next()?.trim();
    if name.is_empty() {
        return None;
    }
    let created_at = fields
        .next()
        .and_then(|s| NaiveDateTime::parse_from_str(s.trim(), LISTING_TIME_FORMAT).ok());
    let command = fields
        .next()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    Some(Archive {
        name: name.to_string(),
        created_at,
        command,
        ..Default::default()
    })
}

/// Convert a decimal size with SI unit to bytes.
fn scale_bytes(value: &str, unit: &str) -> u64 {
    let value: f64 = value.parse().unwrap_or(0.0);
    let multiplier = match unit.to_ascii_lowercase().as_str() {
        "kb" => 1e3,
        "mb" => 1e6,
        "gb" => 1e9,
        "tb" => 1e12,
        _ => 1.0,
    };
    (value * multiplier).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRINT_STATS: &str = "\
                                       Total size  Compressed size
All archives                               104857             52428
  (unique data)                             10485              5242
Job_docs_2024-03-09_14-05-07                 2048              1024
  (unique data)                               512               256
";

    fn parse_all(mode: ParseMode, text: &str) -> Vec<ParsedEvent> {
        let mut parser = OutputParser::new(mode);
        let mut events: Vec<ParsedEvent> =
            text.lines().filter_map(|l| parser.parse_line(l)).collect();
        events.extend(parser.finish());
        events
    }

    #[test]
    fn stats_table_pairs_unique_rows() {
        let events = parse_all(ParseMode::Generic, PRINT_STATS);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            ParsedEvent::StatsReported(ArchiveStats {
                scope: StatsScope::AllArchives,
                total: 104857,
                compressed: 52428,
                unique_total: Some(10485),
                unique_compressed: Some(5242),
            })
        );
        match &events[1] {
            ParsedEvent::StatsReported(stats) => {
                assert_eq!(
                    stats.scope,
                    StatsScope::Archive("Job_docs_2024-03-09_14-05-07".into())
                );
                assert_eq!(stats.unique_compressed, Some(256));
            }
            other => panic!("expected stats, got {other:?}"),
        }
    }

    #[test]
    fn backup_stats_use_new_data_row() {
        let text = "\
                                       Total size  Compressed size
All archives                                 5000             2500
  (unique data)                              3000             1500
This archive                                 1000              500
New data                                      100               50
";
        let events = parse_all(ParseMode::Generic, text);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            ParsedEvent::StatsReported(ArchiveStats { scope: StatsScope::ThisArchive, unique_total: Some(100), .. })
        ));
    }

    #[test]
    fn dangling_row_flushed_on_finish() {
        let text = "\
                                       Total size  Compressed size
All archives                                 5000             2500
";
        let events = parse_all(ParseMode::Generic, text);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ParsedEvent::StatsReported(ArchiveStats { unique_total: None, .. })
        ));
    }

    #[test]
    fn listing_lines_become_archives() {
        let text = "Job_docs_2024-03-09_14-05-07\t2024-03-09 14:05:07\ttarsnap -c -f Job_docs /home\nmanual\t2023-12-31 23:59:59\n";
        let events = parse_all(ParseMode::Listing, text);
        assert_eq!(events.len(), 2);
        match &events[0] {
            ParsedEvent::ArchiveListed(a) => {
                assert_eq!(a.name, "Job_docs_2024-03-09_14-05-07");
                assert_eq!(
                    a.created_at.unwrap().to_string(),
                    "2024-03-09 14:05:07"
                );
                assert_eq!(a.command.as_deref(), Some("tarsnap -c -f Job_docs /home"));
            }
            other => panic!("expected archive, got {other:?}"),
        }
    }

    #[test]
    fn progress_is_scaled() {
        let mut parser = OutputParser::new(ParseMode::Generic);
        assert_eq!(
            parser.parse_line("  Processed 12 files, 3.5 MB"),
            Some(ParsedEvent::ProgressTick {
                files: 12,
                bytes_done: 3_500_000
            })
        );
        assert_eq!(
            parser.parse_line("Processed 1 file, 512 bytes"),
            Some(ParsedEvent::ProgressTick {
                files: 1,
                bytes_done: 512
            })
        );
    }

    #[test]
    fn error_markers_classified() {
        let cases = [
            ("tarsnap: Connection lost, waiting 5 seconds before reconnecting", ErrorClass::Network),
            ("tarsnap: Cannot obtain lock on cache directory", ErrorClass::LockContention),
            ("tarsnap: Account balance is not positive", ErrorClass::QuotaExceeded),
            ("tarsnap: Directory is not consistent with archive; run --fsck", ErrorClass::CacheOutOfSync),
            ("tarsnap: Cannot read key file: /root/key", ErrorClass::KeyFile),
            ("tarsnap: An archive already exists with the name \"x\"", ErrorClass::ArchiveExists),
            ("tarsnap: Archive does not exist", ErrorClass::ArchiveNotFound),
            ("tarsnap: Error exit delayed from previous errors.", ErrorClass::Generic),
        ];
        let mut parser = OutputParser::new(ParseMode::Generic);
        for (line, class) in cases {
            match parser.parse_line(line) {
                Some(ParsedEvent::ErrorMarker(marker)) => assert_eq!(marker.class, class, "{line}"),
                other => panic!("{line}: expected marker, got {other:?}"),
            }
        }
    }

    #[test]
    fn warnings_are_not_markers() {
        assert!(detect_error_marker("tarsnap: Removing leading '/' from member names").is_none());
        assert!(detect_error_marker("Connection lost without a prefix").is_none());
    }

    #[test]
    fn contents_mode_keeps_entries() {
        let text = "-rw-r--r--  0 me  staff  1234 Mar  9 14:05 home/me/notes.txt\ndrwxr-xr-x  0 me  staff     0 Mar  9 14:05 home/me/\n";
        let events = parse_all(ParseMode::Contents, text);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ParsedEvent::ContentEntry(e) if e.ends_with("notes.txt")));
    }

    #[test]
    fn version_banner() {
        let mut parser = OutputParser::new(ParseMode::Version);
        assert_eq!(
            parser.parse_line("tarsnap 1.0.40"),
            Some(ParsedEvent::ToolVersion("1.0.40".into()))
        );
    }

    #[test]
    fn unknown_lines_pass_through() {
        let mut parser = OutputParser::new(ParseMode::Generic);
        for line in ["", "   ", "something new in a future version", "\u{1b}[0m", "⚠ weird ✓ bytes"] {
            assert_eq!(parser.parse_line(line), None);
        }
    }

    #[test]
    fn repeated_runs_are_deterministic() {
        let capture = format!(
            "Processed 3 files, 1.2 kB\ntarsnap: Connection lost\n{PRINT_STATS}garbage line\ntarsnap: Error exit delayed from previous errors.\n"
        );
        let first = parse_all(ParseMode::Generic, &capture);
        for _ in 0..5 {
            assert_eq!(parse_all(ParseMode::Generic, &capture), first);
        }
        assert_eq!(first.len(), 5);
        assert!(matches!(first.last(), Some(ParsedEvent::ErrorMarker(_))));
    }
}
