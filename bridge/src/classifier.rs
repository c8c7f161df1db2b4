//! Streaming classifier for the human-readable output of `codex exec`.
//!
//! The CLI prints a preamble (banner, metadata, echoed prompt), optional
//! reasoning blocks introduced by a bracketed `thinking` marker and closed by
//! a bracketed `codex` marker, and the answer itself, interleaved with
//! timestamps and token accounting. Only the answer is forwarded.
//!
//! Bytes are split into lines as they arrive; lines are classified
//! immediately while message text is batched and released by
//! [`OutputClassifier::flush_due`], which the turn driver calls on a fixed
//! interval.

use std::sync::Arc;

use regex_lite::Regex;
use tracing::debug;

use crate::error::BridgeError;
use crate::error::Result;
use crate::events::BridgeEvent;

/// How a header rule recognises a line.
#[derive(Debug, Clone, Copy)]
enum Pattern {
    Regex(&'static str),
    Prefix(&'static str),
    Contains(&'static str),
}

/// Preamble shapes discarded until the first content line, evaluated in
/// order.
const HEADER_PATTERNS: &[(&str, Pattern)] = &[
    ("timestamp", Pattern::Regex(r"^\[\d{4}-\d{2}-\d{2}")),
    ("stdin_banner", Pattern::Prefix("Reading prompt from stdin")),
    ("version_banner", Pattern::Contains("OpenAI Codex v")),
    ("separator", Pattern::Regex(r"^-{3,}$")),
    (
        "metadata",
        Pattern::Regex(
            r"^(workdir|model|provider|approval|sandbox|reasoning(?: effort| summaries)?):\s*",
        ),
    ),
    ("instructions", Pattern::Contains("User instructions:")),
    ("trust_warning", Pattern::Contains("Not inside a trusted directory")),
];

const THINKING_MARKER: &str = r"(?i)\[.*\]\s*thinking";
const ASSISTANT_MARKER: &str = r"(?i)\[.*\]\s*codex";
const TOKEN_USAGE: &str = r"(?i)tokens used:\s*\d+";
const TIMESTAMP: &str = r"^\[\d{4}-\d{2}-\d{2}";

const STDERR_NOISE: &[&str] = &[
    "[DEP0040]",
    "DeprecationWarning",
    "--trace-deprecation",
    "Reading prompt from stdin",
];

#[derive(Debug)]
enum Matcher {
    Regex(Regex),
    Prefix(&'static str),
    Contains(&'static str),
}

impl Matcher {
    fn compile(pattern: Pattern) -> Result<Self> {
        Ok(match pattern {
            Pattern::Regex(raw) => Self::Regex(compile(raw)?),
            Pattern::Prefix(prefix) => Self::Prefix(prefix),
            Pattern::Contains(needle) => Self::Contains(needle),
        })
    }

    fn is_match(&self, line: &str) -> bool {
        match self {
            Self::Regex(regex) => regex.is_match(line),
            Self::Prefix(prefix) => line.starts_with(prefix),
            Self::Contains(needle) => line.contains(needle),
        }
    }
}

#[derive(Debug)]
struct HeaderRule {
    name: &'static str,
    matcher: Matcher,
}

/// Compiled line predicates shared by every invocation.
#[derive(Debug)]
pub struct LineRules {
    header: Vec<HeaderRule>,
    thinking: Regex,
    assistant: Regex,
    token_usage: Regex,
    timestamp: Regex,
}

impl LineRules {
    pub fn new() -> Result<Self> {
        let header = HEADER_PATTERNS
            .iter()
            .map(|&(name, pattern)| {
                Ok(HeaderRule {
                    name,
                    matcher: Matcher::compile(pattern)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            header,
            thinking: compile(THINKING_MARKER)?,
            assistant: compile(ASSISTANT_MARKER)?,
            token_usage: compile(TOKEN_USAGE)?,
            timestamp: compile(TIMESTAMP)?,
        })
    }

    /// Name of the first preamble rule matching `line`.
    pub fn header_rule(&self, line: &str) -> Option<&'static str> {
        self.header
            .iter()
            .find(|rule| rule.matcher.is_match(line))
            .map(|rule| rule.name)
    }

    pub fn is_thinking_marker(&self, line: &str) -> bool {
        self.thinking.is_match(line)
    }

    pub fn is_assistant_marker(&self, line: &str) -> bool {
        self.assistant.is_match(line)
    }

    fn is_trailing_noise(&self, line: &str) -> bool {
        self.token_usage.is_match(line) || self.timestamp.is_match(line)
    }
}

fn compile(raw: &str) -> Result<Regex> {
    Regex::new(raw).map_err(|err| BridgeError::Config(format!("invalid line pattern {raw}: {err}")))
}

/// Per-invocation parser state. Never shared between turns.
#[derive(Debug, Default)]
struct ParserState {
    header_complete: bool,
    in_thinking: bool,
    thinking_announced: bool,
    message_buffer: String,
    full_response: String,
    partial_line: Vec<u8>,
    /// Prompt lines already seen echoed back in the header.
    echoed_lines: usize,
}

pub struct OutputClassifier {
    rules: Arc<LineRules>,
    prompt: String,
    prompt_lines: Vec<String>,
    flush_threshold: usize,
    state: ParserState,
}

impl OutputClassifier {
    pub fn new(rules: Arc<LineRules>, prompt: &str, flush_threshold: usize) -> Self {
        let prompt_lines = prompt
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            rules,
            prompt: prompt.trim().to_string(),
            prompt_lines,
            flush_threshold,
            state: ParserState::default(),
        }
    }

    /// Feeds raw stdout bytes. Returns events that must go out right away,
    /// which only happens when a thinking block is first entered.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        self.state.partial_line.extend_from_slice(chunk);
        let Some(last_newline) = self.state.partial_line.iter().rposition(|b| *b == b'\n') else {
            return events;
        };
        let rest = self.state.partial_line.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.state.partial_line, rest);
        for raw in complete[..last_newline].split(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(raw);
            self.process_line(line.strip_suffix('\r').unwrap_or(&line), &mut events);
        }
        events
    }

    /// Releases batched message text when the buffer is large or when no
    /// unterminated line is being held back.
    pub fn flush_due(&mut self) -> Option<BridgeEvent> {
        let holding_partial = !self.state.partial_line.is_empty();
        let buffer = &self.state.message_buffer;
        if buffer.len() > self.flush_threshold || (!holding_partial && !buffer.trim().is_empty()) {
            self.take_message()
        } else {
            None
        }
    }

    /// Drains everything left once the process has exited.
    pub fn finish(&mut self) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        if !self.state.partial_line.is_empty() {
            let raw = std::mem::take(&mut self.state.partial_line);
            let line = String::from_utf8_lossy(&raw);
            self.process_line(line.strip_suffix('\r').unwrap_or(&line), &mut events);
        }

        let remaining = std::mem::take(&mut self.state.message_buffer);
        let cleaned = remaining
            .lines()
            .filter(|line| !self.rules.is_trailing_noise(line))
            .filter(|line| !self.rules.is_thinking_marker(line))
            .collect::<Vec<_>>()
            .join("\n");
        let cleaned = cleaned.trim();
        if !cleaned.is_empty() {
            self.record_response(cleaned);
            events.push(BridgeEvent::message(cleaned));
        }
        events
    }

    /// Every message chunk emitted so far, newline separated.
    pub fn full_response(&self) -> &str {
        &self.state.full_response
    }

    pub fn into_full_response(self) -> String {
        self.state.full_response
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<BridgeEvent>) {
        if !self.state.header_complete {
            if let Some(rule) = self.rules.header_rule(line) {
                debug!(rule, "skipping header line");
                return;
            }
            if self.is_prompt_echo(line) || line.trim().is_empty() {
                return;
            }
            self.state.header_complete = true;
        }

        if self.rules.is_thinking_marker(line) {
            self.state.in_thinking = true;
            if !self.state.thinking_announced {
                if let Some(pending) = self.take_message() {
                    events.push(pending);
                }
                events.push(BridgeEvent::thinking());
                self.state.thinking_announced = true;
            }
            return;
        }

        if self.state.in_thinking {
            if self.rules.is_assistant_marker(line) {
                self.state.in_thinking = false;
            }
            return;
        }

        if self.rules.is_trailing_noise(line) {
            return;
        }
        if self.state.message_buffer.is_empty() && line.trim().is_empty() {
            return;
        }
        self.state.message_buffer.push_str(line);
        self.state.message_buffer.push('\n');
    }

    /// The echo is matched in order: each call accepts only the next prompt
    /// line, so answer text repeating an earlier prompt line is kept.
    fn is_prompt_echo(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() || self.prompt.is_empty() {
            return false;
        }
        if self.state.echoed_lines == 0 && line == self.prompt {
            self.state.echoed_lines = self.prompt_lines.len();
            return true;
        }
        match self.prompt_lines.get(self.state.echoed_lines) {
            Some(expected) if expected == line => {
                self.state.echoed_lines += 1;
                true
            }
            _ => false,
        }
    }

    fn take_message(&mut self) -> Option<BridgeEvent> {
        let content = self.state.message_buffer.trim().to_string();
        if content.is_empty() {
            return None;
        }
        self.state.message_buffer.clear();
        self.record_response(&content);
        Some(BridgeEvent::message(content))
    }

    fn record_response(&mut self, content: &str) {
        if !self.state.full_response.is_empty() {
            self.state.full_response.push('\n');
        }
        self.state.full_response.push_str(content);
    }
}

/// Filters diagnostic output: benign noise is logged and dropped, anything
/// else becomes an error event.
pub fn classify_stderr(text: &str) -> Option<BridgeEvent> {
    if STDERR_NOISE.iter().any(|marker| text.contains(marker)) {
        debug!("[stderr noise] {}", text.trim_end());
        return None;
    }
    if text.trim().is_empty() {
        return None;
    }
    debug!("[stderr] {}", text.trim_end());
    Some(BridgeEvent::error(text))
}

/// Decodes stderr reads, holding back a multi-byte character split across
/// two reads until the rest of it arrives.
#[derive(Debug, Default)]
pub struct StderrDecoder {
    pending: Vec<u8>,
}

impl StderrDecoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let keep = incomplete_tail_len(&self.pending);
        let tail = self.pending.split_off(self.pending.len() - keep);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    /// Whatever is still held back once the pipe has closed.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a truncated UTF-8 sequence at the end of `bytes`, or 0.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TurnStatus;
    use pretty_assertions::assert_eq;

    fn classifier(prompt: &str) -> OutputClassifier {
        OutputClassifier::new(Arc::new(LineRules::new().expect("rules")), prompt, 100)
    }

    /// Feeds `chunks`, flushing after each one the way the interval would.
    fn run(classifier: &mut OutputClassifier, chunks: &[&[u8]]) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(classifier.push_chunk(chunk));
            events.extend(classifier.flush_due());
        }
        events.extend(classifier.finish());
        events
    }

    fn message_text(events: &[BridgeEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                BridgeEvent::Message { content } => Some(content.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn header_table_recognises_preamble_shapes() {
        let rules = LineRules::new().expect("rules");
        let cases = [
            ("[2025-08-30T12:00:00] OpenAI Codex v0.23.0", Some("timestamp")),
            ("Reading prompt from stdin...", Some("stdin_banner")),
            ("OpenAI Codex v0.23.0 (research preview)", Some("version_banner")),
            ("--------", Some("separator")),
            ("workdir: /tmp/project", Some("metadata")),
            ("model: gpt-5", Some("metadata")),
            ("provider: openai", Some("metadata")),
            ("approval: never", Some("metadata")),
            ("sandbox: read-only", Some("metadata")),
            ("reasoning effort: medium", Some("metadata")),
            ("reasoning summaries: auto", Some("metadata")),
            ("User instructions:", Some("instructions")),
            ("Not inside a trusted directory and --skip-git-repo-check was not specified.", Some("trust_warning")),
            ("Hello there", None),
            ("a --- b", None),
        ];
        for (line, expected) in cases {
            assert_eq!(rules.header_rule(line), expected, "line: {line}");
        }
    }

    #[test]
    fn markers_are_case_insensitive() {
        let rules = LineRules::new().expect("rules");
        assert!(rules.is_thinking_marker("[2025-08-30T12:00:01] THINKING"));
        assert!(rules.is_assistant_marker("[12:00] Codex"));
        assert!(!rules.is_thinking_marker("I was thinking about it"));
    }

    #[test]
    fn thinking_block_is_hidden_and_announced_after_pending_text() {
        let mut classifier = classifier("say hello");
        let input = "workdir: /x\nmodel: gpt-5\n\nHello\n[12:00] thinking\nignored\n[12:00] codex\nWorld\n";
        let events = classifier.push_chunk(input.as_bytes());
        assert_eq!(
            events,
            vec![BridgeEvent::message("Hello"), BridgeEvent::thinking()]
        );
        assert_eq!(classifier.flush_due(), Some(BridgeEvent::message("World")));
        assert!(classifier.finish().is_empty());
        assert_eq!(classifier.full_response(), "Hello\nWorld");
    }

    #[test]
    fn thinking_is_announced_once_per_invocation() {
        let mut classifier = classifier("");
        let events = run(
            &mut classifier,
            &[b"answer\n[t] thinking\nx\n[t] codex\nmore\n[t] thinking\ny\n[t] codex\nend\n"],
        );
        let statuses = events
            .iter()
            .filter(|event| {
                matches!(
                    event,
                    BridgeEvent::Status {
                        status: TurnStatus::Thinking
                    }
                )
            })
            .count();
        assert_eq!(statuses, 1);
        assert_eq!(message_text(&events), "answer\nmore\nend");
    }

    #[test]
    fn prompt_echo_and_blank_lines_are_skipped_in_header() {
        let mut classifier = classifier("What is 2+2?");
        let events = run(
            &mut classifier,
            &[b"OpenAI Codex v0.23.0\n--------\n\nWhat is 2+2?\n\n\n4\n"],
        );
        assert_eq!(events, vec![BridgeEvent::message("4")]);
    }

    #[test]
    fn answer_repeating_a_prompt_line_is_kept() {
        let mut multi_line = classifier("Reply with a single word.\nOK");
        let events = run(
            &mut multi_line,
            &[b"OpenAI Codex v0.23.0\n--------\nReply with a single word.\nOK\n\nOK\n"],
        );
        assert_eq!(events, vec![BridgeEvent::message("OK")]);

        let mut single_line = classifier("OK");
        let events = run(&mut single_line, &[b"workdir: /x\nOK\nOK\n"]);
        assert_eq!(events, vec![BridgeEvent::message("OK")]);
    }

    #[test]
    fn token_usage_and_timestamps_are_dropped_after_header() {
        let mut classifier = classifier("");
        let events = run(
            &mut classifier,
            &[b"first\n[2025-08-30T12:00:02] tokens used: 42\ntokens used: 42\nsecond\n"],
        );
        assert_eq!(message_text(&events), "first\nsecond");
    }

    #[test]
    fn partial_line_holds_back_flush_until_threshold() {
        let mut classifier = classifier("");
        assert!(classifier.push_chunk(b"line one\nline t").is_empty());
        assert_eq!(classifier.flush_due(), None);
        assert!(classifier.push_chunk(b"wo\n").is_empty());
        assert_eq!(
            classifier.flush_due(),
            Some(BridgeEvent::message("line one\nline two"))
        );

        let long_line = format!("{}\n", "x".repeat(150));
        classifier.push_chunk(long_line.as_bytes());
        classifier.push_chunk(b"unterminated");
        assert_eq!(
            classifier.flush_due(),
            Some(BridgeEvent::message("x".repeat(150)))
        );
        assert_eq!(
            classifier.finish(),
            vec![BridgeEvent::message("unterminated")]
        );
    }

    #[test]
    fn rechunking_preserves_emitted_content() {
        let stream = "[2025-08-30T12:00:00] OpenAI Codex v0.23.0\nworkdir: /x\n\nprompt\nIntro line\n[2025-08-30T12:00:01] thinking\nsecret\n[2025-08-30T12:00:02] codex\nBody with ünïcode\nmore body\ntokens used: 12\ntail";
        let whole = {
            let mut classifier = classifier("prompt");
            message_text(&run(&mut classifier, &[stream.as_bytes()]))
        };
        for split in 1..stream.len() {
            let (a, b) = stream.as_bytes().split_at(split);
            let mut classifier = classifier("prompt");
            let rechunked = message_text(&run(&mut classifier, &[a, b]));
            assert_eq!(rechunked, whole, "split at {split}");
        }
        assert_eq!(whole, "Intro line\nBody with ünïcode\nmore body\ntail");
    }

    #[test]
    fn crlf_line_endings_are_normalised() {
        let mut classifier = classifier("");
        let events = run(&mut classifier, &[b"model: gpt-5\r\n\r\nHi\r\n"]);
        assert_eq!(events, vec![BridgeEvent::message("Hi")]);
    }

    #[test]
    fn stderr_noise_is_not_forwarded() {
        assert_eq!(
            classify_stderr("(node:1) [DEP0040] DeprecationWarning: punycode"),
            None
        );
        assert_eq!(classify_stderr("Reading prompt from stdin...\n"), None);
        assert_eq!(classify_stderr("  \n"), None);
        assert_eq!(
            classify_stderr("error: unauthorized\n"),
            Some(BridgeEvent::error("error: unauthorized\n"))
        );
    }

    #[test]
    fn stderr_decoder_joins_characters_split_across_reads() {
        let bytes = "échec: ошибка €\n".as_bytes();
        let mut decoder = StderrDecoder::default();
        let mut text = String::new();
        for chunk in bytes.chunks(3) {
            text.push_str(&decoder.decode(chunk));
        }
        text.push_str(&decoder.finish());
        assert_eq!(text, "échec: ошибка €\n");

        let mut decoder = StderrDecoder::default();
        assert_eq!(decoder.decode(&[b'a', 0xE2, 0x82]), "a");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
