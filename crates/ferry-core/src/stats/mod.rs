//! Stats block parsing.
//!
//! The transfer tool prints a progress block every stats interval:
//!
//! ```text
//! Transferred:   	   15.031 MiB / 233.367 MiB, 6%, 817.606 KiB/s, ETA 4m33s
//! Errors:                 1 (retrying may help)
//! Transferred:            0 / 1, 0%
//! Elapsed time:        19.0s
//! Transferring:
//!  *                   filename.mp4:  6% /233.367Mi, 817.618Ki/s, 4m33s
//! ```
//!
//! Detection and interpretation are split: [`classify_line`] turns one line into
//! a [`LineKind`], and [`StatsParser`] assembles line kinds into records. A
//! block's global lines become one [`GlobalStatsRecord`], emitted before any of
//! the block's [`FileStatsRecord`]s, so consumers can treat a global record as
//! the boundary between blocks.

pub mod units;

use std::time::Duration;

use units::{is_unknown, parse_duration, parse_percent, parse_size, parse_speed};

/// Cumulative totals for the whole operation, as of one stats block.
///
/// Fields the block did not contain are `None`; consumers carry the previous
/// value forward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalStatsRecord {
    pub bytes_transferred: Option<u64>,
    pub bytes_total: Option<u64>,
    pub percent: Option<u8>,
    pub speed: Option<u64>,
    pub eta: Option<Duration>,
    pub elapsed: Option<Duration>,
    pub files_completed: Option<u64>,
    pub files_total: Option<u64>,
    pub errors: Option<u64>,
}

/// One file the tool reports as in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatsRecord {
    pub name: String,
    pub percent: Option<u8>,
    pub bytes_total: Option<u64>,
    pub bytes_done: Option<u64>,
    pub speed: Option<u64>,
    pub eta: Option<Duration>,
}

impl FileStatsRecord {
    fn pending(name: String) -> Self {
        Self {
            name,
            percent: None,
            bytes_total: None,
            bytes_done: None,
            speed: None,
            eta: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsRecord {
    Global(GlobalStatsRecord),
    File(FileStatsRecord),
}

/// Fields of the byte-count `Transferred:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesLine {
    pub transferred: u64,
    pub total: Option<u64>,
    pub percent: Option<u8>,
    pub speed: u64,
    pub eta: Option<Duration>,
}

/// What a single output line is, independent of where it appears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Bytes(BytesLine),
    Files { done: u64, total: u64 },
    Checks { done: u64, total: u64 },
    Errors(u64),
    Elapsed(Duration),
    /// Another line of the global section we do not track (`Deleted:`, `Renamed:` ...).
    OtherStat,
    TransferringHeader,
    CheckingHeader,
    PerFile(FileStatsRecord),
    Blank,
    Noise,
    /// Looks like a progress line but a field would not parse.
    Malformed(&'static str),
}

impl LineKind {
    /// True for lines that belong to a stats block.
    pub fn is_progress(&self) -> bool {
        !matches!(self, LineKind::Blank | LineKind::Noise)
    }
}

const OTHER_STAT_PREFIXES: &[&str] = &[
    "Deleted:",
    "Renamed:",
    "Server Side Copies:",
    "Server Side Moves:",
    "Server-side copies:",
    "Server-side moves:",
];

/// Classify one line of tool output.
pub fn classify_line(line: &str) -> LineKind {
    let line = line.trim();
    if line.is_empty() {
        return LineKind::Blank;
    }

    if let Some(rest) = line.strip_prefix("Transferred:") {
        return classify_transferred(rest);
    }
    if let Some(rest) = line.strip_prefix("Checks:") {
        return match parse_count_pair(rest) {
            Some((done, total)) => LineKind::Checks { done, total },
            None => LineKind::Malformed("checks count"),
        };
    }
    if let Some(rest) = line.strip_prefix("Errors:") {
        let count = rest.split_whitespace().next().and_then(|n| n.parse().ok());
        return match count {
            Some(count) => LineKind::Errors(count),
            None => LineKind::Malformed("error count"),
        };
    }
    if let Some(rest) = line.strip_prefix("Elapsed time:") {
        return match parse_duration(rest) {
            Some(elapsed) => LineKind::Elapsed(elapsed),
            None => LineKind::Malformed("elapsed time"),
        };
    }
    if line == "Transferring:" {
        return LineKind::TransferringHeader;
    }
    if line == "Checking:" {
        return LineKind::CheckingHeader;
    }
    if OTHER_STAT_PREFIXES.iter().any(|p| line.starts_with(p)) {
        return LineKind::OtherStat;
    }
    if let Some(rest) = line.strip_prefix('*') {
        return classify_file_line(rest);
    }

    LineKind::Noise
}

fn classify_transferred(rest: &str) -> LineKind {
    let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
    let is_bytes_line = parts.len() >= 4
        && parts
            .last()
            .is_some_and(|last| last.starts_with("ETA"));

    if is_bytes_line {
        return match parse_bytes_line(&parts) {
            Some(bytes) => LineKind::Bytes(bytes),
            None => LineKind::Malformed("transferred bytes"),
        };
    }

    match parse_count_pair(rest) {
        Some((done, total)) => LineKind::Files { done, total },
        None => LineKind::Malformed("transferred files"),
    }
}

fn parse_bytes_line(parts: &[&str]) -> Option<BytesLine> {
    let (done, total) = parts[0].split_once('/')?;
    let transferred = parse_size(done)?;
    let total = parse_size(total)?;
    let percent = if is_unknown(parts[1]) {
        None
    } else {
        Some(parse_percent(parts[1])?)
    };
    let speed = parse_speed(parts[2])?;
    let eta_text = parts[parts.len() - 1].strip_prefix("ETA")?.trim();
    let eta = if is_unknown(eta_text) {
        None
    } else {
        Some(parse_duration(eta_text)?)
    };

    Some(BytesLine {
        transferred,
        // A zero total while nothing is known yet means the size is still being counted.
        total: (total > 0 || transferred > 0).then_some(total),
        percent,
        speed,
        eta,
    })
}

fn parse_count_pair(rest: &str) -> Option<(u64, u64)> {
    let counts = rest.split(',').next()?;
    let (done, total) = counts.split_once('/')?;
    Some((done.trim().parse().ok()?, total.trim().parse().ok()?))
}

fn classify_file_line(rest: &str) -> LineKind {
    let rest = rest.trim();

    // The name may itself contain colons, so look for the right-most colon whose
    // tail reads as a percentage.
    for (idx, _) in rest.rmatch_indices(':') {
        let stats = rest[idx + 1..].trim();
        let Some((pct, tail)) = stats.split_once('%') else {
            continue;
        };
        if pct.is_empty() || !pct.trim().chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let name = rest[..idx].trim();
        if name.is_empty() {
            return LineKind::Malformed("file name");
        }
        return match parse_file_stats(name, pct, tail) {
            Some(record) => LineKind::PerFile(record),
            None => LineKind::Malformed("file stats"),
        };
    }

    if let Some(name) = rest.strip_suffix(": transferring") {
        let name = name.trim();
        if !name.is_empty() {
            return LineKind::PerFile(FileStatsRecord::pending(name.to_string()));
        }
    }

    LineKind::Malformed("file line")
}

fn parse_file_stats(name: &str, pct: &str, tail: &str) -> Option<FileStatsRecord> {
    let percent = parse_percent(&format!("{}%", pct.trim()))?;
    let fields: Vec<&str> = tail.split(',').map(str::trim).collect();
    let [size, speed, eta] = fields.as_slice() else {
        return None;
    };
    let bytes_total = parse_size(size.strip_prefix('/')?)?;
    let speed = parse_speed(speed)?;
    let eta = if is_unknown(eta) {
        None
    } else {
        Some(parse_duration(eta)?)
    };
    let bytes_done = (u128::from(bytes_total) * u128::from(percent) / 100) as u64;

    Some(FileStatsRecord {
        name: name.to_string(),
        percent: Some(percent),
        bytes_total: Some(bytes_total),
        bytes_done: Some(bytes_done),
        speed: Some(speed),
        eta,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Outside,
    Global,
    Checking,
    Transferring,
}

/// Incremental parser over the raw output stream of one origin.
///
/// Chunks may split lines anywhere; the incomplete tail is kept until the next
/// chunk completes it.
#[derive(Debug)]
pub struct StatsParser {
    buffer: String,
    pending: Option<GlobalStatsRecord>,
    section: Section,
    anomalies: u64,
}

impl Default for StatsParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            pending: None,
            section: Section::Outside,
            anomalies: 0,
        }
    }

    /// Number of recognisable progress lines that failed to parse.
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    pub fn parse(&mut self, chunk: &str) -> Vec<StatsRecord> {
        let mut out = Vec::new();
        self.buffer.push_str(chunk);
        let Some(last_newline) = self.buffer.rfind('\n') else {
            return out;
        };
        let complete: String = self.buffer.drain(..=last_newline).collect();
        for line in complete.lines() {
            self.feed_line(line, &mut out);
        }
        out
    }

    /// End of stream: parse whatever is buffered and close the open block.
    pub fn finish(&mut self) -> Vec<StatsRecord> {
        let mut out = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() {
            self.feed_line(&rest, &mut out);
        }
        self.flush(&mut out);
        self.section = Section::Outside;
        out
    }

    fn feed_line(&mut self, line: &str, out: &mut Vec<StatsRecord>) {
        match classify_line(line) {
            LineKind::Bytes(bytes) => {
                // The byte line opens a block.
                self.flush(out);
                self.section = Section::Global;
                self.pending = Some(GlobalStatsRecord {
                    bytes_transferred: Some(bytes.transferred),
                    bytes_total: bytes.total,
                    percent: bytes.percent,
                    speed: Some(bytes.speed),
                    eta: bytes.eta,
                    ..GlobalStatsRecord::default()
                });
            }
            LineKind::Files { done, total } => {
                let pending = self.global_section(out);
                pending.files_completed = Some(done);
                pending.files_total = Some(total);
            }
            LineKind::Errors(count) => {
                self.global_section(out).errors = Some(count);
            }
            LineKind::Elapsed(elapsed) => {
                self.global_section(out).elapsed = Some(elapsed);
            }
            LineKind::Checks { .. } | LineKind::OtherStat => {
                self.global_section(out);
            }
            LineKind::TransferringHeader => {
                self.flush(out);
                self.section = Section::Transferring;
            }
            LineKind::CheckingHeader => {
                self.flush(out);
                self.section = Section::Checking;
            }
            LineKind::PerFile(record) => match self.section {
                Section::Transferring => out.push(StatsRecord::File(record)),
                Section::Checking => {}
                Section::Outside | Section::Global => self.end_block(out),
            },
            LineKind::Malformed(what) => match self.section {
                Section::Checking => {}
                Section::Outside if !line.trim_start().starts_with(['T', 'E', 'C']) => {
                    self.end_block(out)
                }
                _ => {
                    self.anomalies += 1;
                    log::debug!("unparsable {what} in stats line: {:?}", line.trim());
                }
            },
            LineKind::Blank | LineKind::Noise => self.end_block(out),
        }
    }

    /// Enter the global section of a block and return its pending record. A
    /// global line after the file list means a new block started without a
    /// byte line, so the previous one is closed first.
    fn global_section(&mut self, out: &mut Vec<StatsRecord>) -> &mut GlobalStatsRecord {
        if matches!(self.section, Section::Transferring | Section::Checking) {
            self.flush(out);
        }
        self.section = Section::Global;
        self.pending.get_or_insert_with(GlobalStatsRecord::default)
    }

    fn end_block(&mut self, out: &mut Vec<StatsRecord>) {
        self.flush(out);
        self.section = Section::Outside;
    }

    fn flush(&mut self, out: &mut Vec<StatsRecord>) {
        if let Some(record) = self.pending.take() {
            out.push(StatsRecord::Global(record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: &str = "2024/05/01 10:00:00 NOTICE: \n\
Transferred:   \t   15.031 MiB / 233.367 MiB, 6%, 817.606 KiB/s, ETA 4m33s\n\
Errors:                 1 (retrying may help)\n\
Checks:                 2 / 2, 100%\n\
Transferred:            0 / 3, 0%\n\
Elapsed time:        19.0s\n\
Transferring:\n\
 *                                  movie.mp4:  6% /233.367Mi, 817.618Ki/s, 4m33s\n\
 *                             notes: draft.txt: 50% /2Ki, 1Ki/s, 1s\n\
 *                                  other.bin: transferring\n\
\n";

    #[test]
    fn global_line_round_trip() {
        let kind = classify_line("Transferred: 512MiB / 1GiB, 50%, 10MiB/s, ETA 51s");
        assert_eq!(
            kind,
            LineKind::Bytes(BytesLine {
                transferred: 536_870_912,
                total: Some(1_073_741_824),
                percent: Some(50),
                speed: 10_485_760,
                eta: Some(Duration::from_secs(51)),
            })
        );

        let mut parser = StatsParser::new();
        let mut records =
            parser.parse("Transferred: 512MiB / 1GiB, 50%, 10MiB/s, ETA 51s\n");
        records.extend(parser.finish());
        let [StatsRecord::Global(global)] = records.as_slice() else {
            panic!("expected one global record, got {records:?}");
        };
        assert_eq!(global.bytes_transferred, Some(536_870_912));
        assert_eq!(global.bytes_total, Some(1_073_741_824));
        assert_eq!(global.speed, Some(10_485_760));
        assert_eq!(global.eta, Some(Duration::from_secs(51)));
    }

    #[test]
    fn full_block_emits_global_before_files() {
        let mut parser = StatsParser::new();
        let records = parser.parse(BLOCK);
        assert_eq!(records.len(), 4, "{records:?}");

        let StatsRecord::Global(global) = &records[0] else {
            panic!("first record must be global");
        };
        assert_eq!(global.files_completed, Some(0));
        assert_eq!(global.files_total, Some(3));
        assert_eq!(global.errors, Some(1));
        assert_eq!(global.elapsed, Some(Duration::from_secs(19)));
        assert_eq!(global.percent, Some(6));

        let names: Vec<&str> = records[1..]
            .iter()
            .map(|r| match r {
                StatsRecord::File(f) => f.name.as_str(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["movie.mp4", "notes: draft.txt", "other.bin"]);
        assert_eq!(parser.anomalies(), 0);
    }

    #[test]
    fn per_file_fields() {
        let LineKind::PerFile(file) =
            classify_line(" *   report.pdf: 25% /4Mi, 1Mi/s, 3s")
        else {
            panic!("expected per-file line");
        };
        assert_eq!(file.percent, Some(25));
        assert_eq!(file.bytes_total, Some(4 * 1024 * 1024));
        assert_eq!(file.bytes_done, Some(1024 * 1024));
        assert_eq!(file.speed, Some(1024 * 1024));
        assert_eq!(file.eta, Some(Duration::from_secs(3)));
    }

    #[test]
    fn unknown_eta_is_indeterminate() {
        let LineKind::Bytes(bytes) =
            classify_line("Transferred:   0 B / 0 B, -, 0 B/s, ETA -")
        else {
            panic!("expected byte line");
        };
        assert_eq!(bytes.total, None);
        assert_eq!(bytes.percent, None);
        assert_eq!(bytes.eta, None);
    }

    #[test]
    fn chunk_boundary_mid_token() {
        let mut parser = StatsParser::new();
        let mut records = parser.parse("Transferring:\n * a.bin: 5");
        assert!(records.is_empty());
        records.extend(parser.parse("0% /1Mi, 1Mi/s, 1s\n"));
        assert_eq!(records.len(), 1);
        let StatsRecord::File(file) = &records[0] else {
            panic!("expected file record");
        };
        assert_eq!(file.name, "a.bin");
        assert_eq!(file.percent, Some(50));
        assert_eq!(file.bytes_done, Some(512 * 1024));
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn noise_is_ignored_without_counting() {
        let mut parser = StatsParser::new();
        let records = parser.parse(
            "2024/05/01 10:00:00 INFO  : a.txt: Copied (new)\nsome other chatter\n",
        );
        assert!(records.is_empty());
        assert_eq!(parser.anomalies(), 0);
    }

    #[test]
    fn malformed_progress_line_is_counted() {
        let mut parser = StatsParser::new();
        let records = parser.parse(
            "Transferred: lots / 1GiB, 50%, 10MiB/s, ETA 51s\nTransferring:\n * x.bin: 10% /?, 1Ki/s, 1s\n",
        );
        assert!(records.is_empty());
        assert_eq!(parser.anomalies(), 2);
    }

    #[test]
    fn overflowing_elapsed_time_is_an_anomaly() {
        let mut parser = StatsParser::new();
        parser.parse("Elapsed time:   9999999999999999:00:00\n");
        assert_eq!(parser.anomalies(), 1);
        assert_eq!(
            classify_line("Elapsed time:   9999999999999999:00:00"),
            LineKind::Malformed("elapsed time")
        );
    }

    #[test]
    fn files_under_checking_are_not_transfers() {
        let mut parser = StatsParser::new();
        let records = parser.parse(
            "Transferred: 1MiB / 2MiB, 50%, 1MiB/s, ETA 1s\nChecking:\n * a.txt: 40% /1Mi, 1Mi/s, 1s\n\n",
        );
        assert_eq!(records.len(), 1);
        assert!(matches!(records[0], StatsRecord::Global(_)));
    }

    #[test]
    fn consecutive_blocks_without_blank_separator() {
        let mut parser = StatsParser::new();
        let records = parser.parse(
            "Transferred: 1MiB / 4MiB, 25%, 1MiB/s, ETA 3s\nTransferring:\n * a: 25% /4Mi, 1Mi/s, 3s\n\
             Transferred: 2MiB / 4MiB, 50%, 1MiB/s, ETA 2s\nTransferring:\n * a: 50% /4Mi, 1Mi/s, 2s\n",
        );
        let kinds: Vec<&str> = records
            .iter()
            .map(|r| match r {
                StatsRecord::Global(_) => "global",
                StatsRecord::File(_) => "file",
            })
            .collect();
        assert_eq!(kinds, vec!["global", "file", "global", "file"]);
    }
}
