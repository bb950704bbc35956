use crate::message::{CanMessage, MessageError, clamp_delay, parse_hex_payload};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Lines starting with this prefix are ignored by the log parsers.
pub const FILE_LINE_COMMENT_PREFIX: &str = "#";

/// Errors that can arise while loading a corpus from a traffic log.
///
/// A parse error always rejects the whole file: a partially parsed corpus would
/// silently change the replay order the search depends on.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The log file could not be read.
    #[error("Corpus I/O error: {0}")]
    Io(String),

    /// The first entry of the file matched neither supported log format.
    #[error("Unrecognized file type - could not parse file (first entry: '{0}')")]
    UnrecognizedFormat(String),

    /// A line of an otherwise recognized file did not match its format.
    #[error("Could not parse line {line_no}:\n  '{line}'\n  Reason: {reason}")]
    InvalidLine {
        line_no: usize,
        line: String,
        reason: String,
    },
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}

/// An ordered sequence of frames. Order is replay order and is preserved by every
/// operation that derives a new corpus or slice from this one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Corpus {
    messages: Vec<CanMessage>,
}

impl Corpus {
    pub fn new(messages: Vec<CanMessage>) -> Self {
        Self { messages }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn as_slice(&self) -> &[CanMessage] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CanMessage> {
        self.messages.iter()
    }

    /// Splits at `len / 2`: the first half gets the floor, the second half the remainder.
    pub fn split_mid(&self) -> (&[CanMessage], &[CanMessage]) {
        self.messages.split_at(self.messages.len() / 2)
    }

    /// Distinct arbitration ids in order of first appearance.
    pub fn distinct_ids(&self) -> Vec<u32> {
        let mut seen = HashSet::new();
        self.messages
            .iter()
            .map(CanMessage::arb_id)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// A copy of this corpus with every frame carrying `arb_id` removed.
    pub fn without_id(&self, arb_id: u32) -> Corpus {
        self.messages
            .iter()
            .filter(|msg| msg.arb_id() != arb_id)
            .cloned()
            .collect()
    }

    pub fn into_messages(self) -> Vec<CanMessage> {
        self.messages
    }
}

impl From<Vec<CanMessage>> for Corpus {
    fn from(messages: Vec<CanMessage>) -> Self {
        Self::new(messages)
    }
}

impl FromIterator<CanMessage> for Corpus {
    fn from_iter<T: IntoIterator<Item = CanMessage>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Corpus {
    type Item = &'a CanMessage;
    type IntoIter = std::slice::Iter<'a, CanMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

/// Bounded FIFO of the most recently sent frames.
///
/// Scanners size it to cover the physical response latency so that, when an
/// edge is seen, the frame that caused it is still inside the window.
#[derive(Debug, Clone)]
pub struct RollingHistory {
    capacity: usize,
    entries: VecDeque<CanMessage>,
}

impl RollingHistory {
    /// A zero capacity is bumped to one: the frame just sent must always be kept.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, message: CanMessage) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&CanMessage> {
        self.entries.back()
    }

    /// The retained frames, oldest first, as a corpus ready for localization.
    pub fn to_corpus(&self) -> Corpus {
        self.entries.iter().cloned().collect()
    }
}

/// The two supported textual traffic log formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// `(1499197954.029156) can0 123#c0ffee`
    Candump,
    /// `Timestamp: 1499197954.029156    ID: 0123    S    DLC: 3    c0 ff ee    Channel: can0`
    PythonCan,
}

impl LogFormat {
    /// Identifies the format from the first non-blank, non-comment line.
    pub fn detect(line: &str) -> Option<Self> {
        if line.starts_with('(') {
            Some(LogFormat::Candump)
        } else if line.starts_with("Timestamp") {
            Some(LogFormat::PythonCan)
        } else {
            None
        }
    }

    fn parse_line(self, line: &str) -> Result<ParsedLine, String> {
        match self {
            LogFormat::Candump => parse_candump_line(line),
            LogFormat::PythonCan => parse_pythoncan_line(line),
        }
    }
}

struct ParsedLine {
    timestamp: f64,
    arb_id: u32,
    data: Vec<u8>,
    is_extended: bool,
    is_error: bool,
    is_remote: bool,
}

/// Reads and parses a traffic log file. See [`parse_log`].
pub fn load_log(path: &Path, force_delay: Option<f64>) -> Result<Corpus, CorpusError> {
    let content = fs::read_to_string(path)
        .map_err(|e| CorpusError::Io(format!("Failed to read log file {:?}: {}", path, e)))?;
    parse_log(&content, force_delay)
}

/// Parses a candump or python-can traffic log into a corpus.
///
/// The first frame gets no delay. Every later frame waits either the timestamp
/// difference to its predecessor or, when `force_delay` is given, that value.
pub fn parse_log(content: &str, force_delay: Option<f64>) -> Result<Corpus, CorpusError> {
    let mut detected_format: Option<LogFormat> = None;
    let mut prev_timestamp: Option<f64> = None;
    let mut messages = Vec::new();

    for (index, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(FILE_LINE_COMMENT_PREFIX) {
            continue;
        }
        let format = match detected_format {
            Some(format) => format,
            None => {
                let format = LogFormat::detect(line)
                    .ok_or_else(|| CorpusError::UnrecognizedFormat(line.to_string()))?;
                detected_format = Some(format);
                format
            }
        };

        let invalid = |reason: String| CorpusError::InvalidLine {
            line_no: index + 1,
            line: raw_line.trim_end().to_string(),
            reason,
        };

        let parsed = format.parse_line(line).map_err(invalid)?;
        let delay = match (prev_timestamp, force_delay) {
            (None, _) => Duration::ZERO,
            (Some(_), Some(forced)) => clamp_delay(forced),
            (Some(prev), None) => clamp_delay(parsed.timestamp - prev),
        };
        prev_timestamp = Some(parsed.timestamp);

        let message = CanMessage::with_delay(parsed.arb_id, parsed.data, delay)
            .map_err(|e: MessageError| invalid(e.to_string()))?
            .with_extended(parsed.is_extended)
            .with_error_frame(parsed.is_error)
            .with_remote_request(parsed.is_remote);
        messages.push(message);
    }

    Ok(Corpus::new(messages))
}

fn parse_timestamp(text: &str) -> Result<f64, String> {
    text.parse::<f64>()
        .map_err(|e| format!("invalid timestamp '{}': {}", text, e))
}

fn parse_candump_line(line: &str) -> Result<ParsedLine, String> {
    let mut segments = line.split_whitespace();
    let stamp = segments.next().ok_or("missing timestamp")?;
    let _interface = segments.next().ok_or("missing interface name")?;
    let frame = segments.next().ok_or("missing ID#DATA frame")?;

    let stamp = stamp
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| format!("timestamp '{}' is not parenthesized", stamp))?;
    let timestamp = parse_timestamp(stamp)?;

    let (id_text, data_text) = frame
        .split_once('#')
        .ok_or_else(|| format!("frame '{}' has no '#' separator", frame))?;
    let arb_id = u32::from_str_radix(id_text, 16)
        .map_err(|e| format!("invalid arbitration id '{}': {}", id_text, e))?;
    let is_remote = data_text.eq_ignore_ascii_case("r");
    let data = if is_remote {
        Vec::new()
    } else {
        parse_hex_payload(data_text).map_err(|e| e.to_string())?
    };

    Ok(ParsedLine {
        timestamp,
        arb_id,
        data,
        is_extended: id_text.len() > 3,
        is_error: false,
        is_remote,
    })
}

fn parse_pythoncan_line(line: &str) -> Result<ParsedLine, String> {
    let rest = line
        .strip_prefix("Timestamp:")
        .ok_or("line does not start with 'Timestamp:'")?;
    let (stamp, rest) = rest.split_once("ID:").ok_or("missing 'ID:' field")?;
    let timestamp = parse_timestamp(stamp.trim())?;

    let (id_and_flags, rest) = rest.split_once("DLC:").ok_or("missing 'DLC:' field")?;
    let mut id_tokens = id_and_flags.split_whitespace();
    let id_text = id_tokens.next().ok_or("missing arbitration id")?;
    let arb_id = u32::from_str_radix(id_text, 16)
        .map_err(|e| format!("invalid arbitration id '{}': {}", id_text, e))?;

    let (mut is_extended, mut is_error, mut is_remote) = (false, false, false);
    let flags: Vec<&str> = id_tokens.collect();
    let legacy_numeric_column = flags.len() == 1 && flags[0].chars().all(|c| c.is_ascii_digit());
    if !legacy_numeric_column {
        for flag in &flags {
            match *flag {
                "X" => is_extended = true,
                "S" => {}
                "E" => is_error = true,
                "R" => is_remote = true,
                other => return Err(format!("unknown frame flag '{}'", other)),
            }
        }
    }

    let data_part = match rest.split_once("Channel:") {
        Some((data_part, _channel)) => data_part,
        None => rest,
    };
    let mut data_tokens = data_part.split_whitespace();
    let dlc_text = data_tokens.next().ok_or("missing DLC value")?;
    match dlc_text.parse::<u8>() {
        Ok(dlc) if dlc <= 8 => {}
        _ => return Err(format!("invalid DLC '{}'", dlc_text)),
    }
    let data = data_tokens
        .map(|byte| {
            if byte.len() != 2 {
                return Err(format!("invalid data byte '{}'", byte));
            }
            u8::from_str_radix(byte, 16).map_err(|e| format!("invalid data byte '{}': {}", byte, e))
        })
        .collect::<Result<Vec<u8>, String>>()?;
    if data.len() > 8 {
        return Err(format!("{} data bytes, at most 8 are allowed", data.len()));
    }

    Ok(ParsedLine {
        timestamp,
        arb_id,
        data,
        is_extended,
        is_error,
        is_remote,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn msg(id: u32) -> CanMessage {
        CanMessage::new(id, vec![id as u8], 0.0).unwrap()
    }

    #[test]
    fn split_mid_preserves_order_for_every_length() {
        for n in 1..=17u32 {
            let corpus: Corpus = (0..n).map(msg).collect();
            let (first, second) = corpus.split_mid();
            assert_eq!(first.len(), (n / 2) as usize);
            assert_eq!(first.len() + second.len(), n as usize);
            let rejoined: Vec<CanMessage> = first.iter().chain(second).cloned().collect();
            assert_eq!(rejoined, corpus.as_slice());
        }
    }

    #[test]
    fn distinct_ids_keep_first_appearance_order() {
        let corpus: Corpus = [3, 1, 3, 2, 1].into_iter().map(msg).collect();
        assert_eq!(corpus.distinct_ids(), vec![3, 1, 2]);
        let filtered = corpus.without_id(3);
        assert_eq!(
            filtered.iter().map(CanMessage::arb_id).collect::<Vec<_>>(),
            vec![1, 2, 1]
        );
    }

    #[test]
    fn rolling_history_drops_oldest_on_overflow() {
        let mut history = RollingHistory::new(3);
        for id in 0..5 {
            history.push(msg(id));
        }
        assert_eq!(history.len(), 3);
        let ids: Vec<u32> = history.to_corpus().iter().map(CanMessage::arb_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(RollingHistory::new(0).capacity(), 1);
    }

    #[test]
    fn candump_log_is_parsed_with_timestamp_delays() {
        let log = "# captured on bench\n\
                   (1499197954.000000) can0 123#c0ffee\n\
                   \n\
                   (1499197954.250000) can0 18EF1727#0102\n\
                   (1499197954.125000) can0 7DF#R\n";
        let corpus = parse_log(log, None).unwrap();
        assert_eq!(corpus.len(), 3);
        let msgs = corpus.as_slice();
        assert_eq!(msgs[0].arb_id(), 0x123);
        assert_eq!(msgs[0].data(), &[0xc0, 0xff, 0xee]);
        assert_eq!(msgs[0].delay(), Duration::ZERO);
        assert_eq!(msgs[1].delay(), Duration::from_millis(250));
        assert!(msgs[1].is_extended());
        // Going back in time clamps to zero.
        assert_eq!(msgs[2].delay(), Duration::ZERO);
        assert!(msgs[2].is_remote_request());
    }

    #[test]
    fn forced_delay_overrides_timestamps_after_first_frame() {
        let log = "(10.0) can0 100#00\n(20.0) can0 101#00\n(20.5) can0 102#00\n";
        let corpus = parse_log(log, Some(0.1)).unwrap();
        let delays: Vec<Duration> = corpus.iter().map(CanMessage::delay).collect();
        assert_eq!(
            delays,
            vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(100)
            ]
        );
    }

    #[test]
    fn pythoncan_log_is_parsed_with_flags_and_channel() {
        let log = "Timestamp: 1499197954.029156        ID: 0123    S                DLC: 3    c0 ff ee                    Channel: can0\n\
                   Timestamp: 1499197954.529156        ID: 18ef1727    X E R        DLC: 0\n\
                   Timestamp: 1499197955.029156        ID: 0456    000    DLC: 2    01 02\n";
        let corpus = parse_log(log, None).unwrap();
        let msgs = corpus.as_slice();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].arb_id(), 0x123);
        assert_eq!(msgs[0].data(), &[0xc0, 0xff, 0xee]);
        assert!(!msgs[0].is_extended());
        assert!(msgs[1].is_extended());
        assert!(msgs[1].is_error_frame());
        assert!(msgs[1].is_remote_request());
        assert!(msgs[1].data().is_empty());
        assert_eq!(msgs[2].data(), &[0x01, 0x02]);
        let delay_ms = msgs[1].delay().as_millis();
        assert!((499..=501).contains(&delay_ms), "delay was {delay_ms}ms");
    }

    #[test]
    fn unrecognized_format_rejects_file() {
        let err = parse_log("# header\nfoo bar baz\n", None).unwrap_err();
        assert!(matches!(err, CorpusError::UnrecognizedFormat(ref line) if line == "foo bar baz"));
    }

    #[test]
    fn bad_line_rejects_whole_file_and_reports_line_number() {
        let log = "(1.0) can0 123#00\n(2.0) can0 124#0\n(3.0) can0 125#00\n";
        match parse_log(log, None) {
            Err(CorpusError::InvalidLine { line_no, line, reason }) => {
                assert_eq!(line_no, 2);
                assert_eq!(line, "(2.0) can0 124#0");
                assert!(reason.contains("odd"), "unexpected reason: {reason}");
            }
            other => panic!("Expected InvalidLine, got {other:?}"),
        }
    }

    #[test]
    fn load_log_reads_from_disk() -> Result<(), CorpusError> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "(1.0) can0 321#aa")?;
        writeln!(file, "(1.5) can0 322#bb")?;
        let corpus = load_log(file.path(), None)?;
        assert_eq!(corpus.distinct_ids(), vec![0x321, 0x322]);

        let missing = load_log(Path::new("/nonexistent/canseek.log"), None);
        assert!(matches!(missing, Err(CorpusError::Io(_))));
        Ok(())
    }
}
