//! Script marker grammar and segment extraction.
//!
//! Scripts are plain text with inline markers that route each span to a
//! downstream stage:
//!
//! ```text
//! segment := "[" kind (":" text)? "]"
//! kind    := "AVATAR" | "VO" | "BROLL"
//! text    := any characters except "]"
//! ```
//!
//! Anything outside a marker is implicit voiceover narration. Markers are
//! case-sensitive; a bracketed span that is not a recognised marker is
//! treated as narration text. Extraction is a deterministic left-to-right
//! scan and every segment keeps its exact source slice, so re-concatenating
//! segments reproduces the original script byte for byte.

use serde::{Deserialize, Serialize};

/// Speaking rate used for duration estimates.
pub const WORDS_PER_MINUTE: f64 = 150.0;
/// Character-based estimate used where no audio duration is known yet.
pub const MS_PER_CHARACTER: u64 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Avatar,
    Voiceover,
    Broll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Marker payload (or the narration text itself for unmarked spans).
    pub text: String,
    /// Exact slice of the original script, markers included.
    pub source: String,
}

/// Scan a script left to right into ordered segments.
pub fn parse_script(script: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut narration = String::new();
    let bytes = script.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'[' {
            if let Some((segment, consumed)) = try_parse_marker(&script[i..]) {
                if !narration.is_empty() {
                    segments.push(narration_segment(std::mem::take(&mut narration)));
                }
                segments.push(segment);
                i += consumed;
                continue;
            }
        }
        // Advance one UTF-8 character.
        let ch_len = utf8_len(bytes[i]);
        narration.push_str(&script[i..i + ch_len]);
        i += ch_len;
    }

    if !narration.is_empty() {
        segments.push(narration_segment(narration));
    }
    segments
}

fn narration_segment(source: String) -> Segment {
    Segment {
        kind: SegmentKind::Voiceover,
        text: source.clone(),
        source,
    }
}

/// Try to read a marker at the start of `rest` (which begins with '[').
/// Returns the segment and the number of bytes consumed.
fn try_parse_marker(rest: &str) -> Option<(Segment, usize)> {
    let close = rest.find(']')?;
    let inner = &rest[1..close];
    let (kind_str, text) = match inner.find(':') {
        Some(colon) => (&inner[..colon], inner[colon + 1..].to_string()),
        None => (inner, String::new()),
    };
    let kind = match kind_str {
        "AVATAR" => SegmentKind::Avatar,
        "VO" => SegmentKind::Voiceover,
        "BROLL" => SegmentKind::Broll,
        _ => return None,
    };
    let source = rest[..=close].to_string();
    Some((Segment { kind, text, source }, close + 1))
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

/// Re-concatenate segments back into the original script.
pub fn reassemble(segments: &[Segment]) -> String {
    segments.iter().map(|s| s.source.as_str()).collect()
}

fn collect_text(script: &str, kind: SegmentKind) -> Vec<String> {
    parse_script(script)
        .into_iter()
        .filter(|s| s.kind == kind)
        .map(|s| s.text.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Voiceover narration: explicit `[VO: …]` segments plus unmarked text, in
/// script order.
pub fn extract_voiceover(script: &str) -> String {
    collect_text(script, SegmentKind::Voiceover).join("\n")
}

/// On-camera avatar lines, in script order.
pub fn extract_avatar_lines(script: &str) -> String {
    collect_text(script, SegmentKind::Avatar).join("\n")
}

/// B-roll cues, one entry per `[BROLL: …]` marker.
pub fn extract_broll_cues(script: &str) -> Vec<String> {
    collect_text(script, SegmentKind::Broll)
}

/// Everything that gets spoken (avatar + voiceover), in script order.
pub fn extract_spoken_text(script: &str) -> String {
    parse_script(script)
        .into_iter()
        .filter(|s| matches!(s.kind, SegmentKind::Avatar | SegmentKind::Voiceover))
        .map(|s| s.text.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Duration estimate from word count at 150 words/minute.
pub fn estimated_duration_s(text: &str) -> f64 {
    word_count(text) as f64 / WORDS_PER_MINUTE * 60.0
}

/// Duration estimate from character count at 80 ms/character.
pub fn estimated_duration_ms(character_count: usize) -> u64 {
    character_count as u64 * MS_PER_CHARACTER
}
