//! Continuity note rendering and deterministic structural extraction.
//!
//! A continuity note is a message an agent leaves for a future instance of
//! itself.  Writing renders a fixed textual layout; reading extracts open
//! tasks and cross-record references **structurally** — section markers,
//! bullet prefixes, and id patterns — never by inference.  The typed fields
//! stored alongside the record remain the source of truth; the rendered body
//! is a human-readable view and the fallback for notes that predate the
//! typed fields.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::schema::{AgentId, NoteKind, NotePriority};

pub const NOTE_DELIMITER: &str = "=== CONTINUITY NOTE ===";

/// Bullet fragments shorter than this are discarded as noise during body
/// extraction (truncated lines, stray punctuation).
const MIN_TASK_CHARS: usize = 5;

/// Everything an agent may put into a note.  Only `summary` is required.
#[derive(Debug, Clone)]
pub struct NoteDraft {
    pub summary: String,
    pub discoveries: Vec<String>,
    pub emotional_state: Option<String>,
    pub open_tasks: Vec<String>,
    /// Free-form reference lines: record ids (`mem_…`) or `thread:<id>`.
    pub references: Vec<String>,
    pub recovery_hints: Option<String>,
    pub priority: NotePriority,
    pub kind: NoteKind,
    pub thread_id: Option<String>,
}

impl Default for NoteDraft {
    fn default() -> Self {
        Self {
            summary: String::new(),
            discoveries: Vec::new(),
            emotional_state: None,
            open_tasks: Vec::new(),
            references: Vec::new(),
            recovery_hints: None,
            priority: NotePriority::Medium,
            kind: NoteKind::Orientation,
            thread_id: None,
        }
    }
}

/// Session identifier: author plus second-resolution timestamp.  Two
/// concurrent sessions of the same agent disambiguate at the record-id
/// level; matching session ids are tolerated.
pub fn session_id(author: &AgentId, at: DateTime<Utc>) -> String {
    format!("{author}_{}", at.format("%Y%m%d_%H%M%S"))
}

/// Render the fixed note layout: header block, then one block per non-empty
/// section, in stable order.
pub fn render_note(author: &AgentId, session: &str, at: DateTime<Utc>, draft: &NoteDraft) -> String {
    let mut out = String::new();
    out.push_str(NOTE_DELIMITER);
    out.push('\n');
    out.push_str(&format!(
        "PRIORITY: {} | TYPE: {}\n",
        draft.priority.label(),
        draft.kind.label()
    ));
    out.push_str(&format!("FROM: {author}\n"));
    out.push_str(&format!("TO: future {author}\n"));
    out.push_str(&format!("SESSION: {session}\n"));
    out.push_str(&format!("TIMESTAMP: {}\n", at.format("%Y-%m-%dT%H:%M:%SZ")));
    if let Some(thread) = &draft.thread_id {
        out.push_str(&format!("THREAD: {thread}\n"));
    }

    push_text_section(&mut out, "SUMMARY", Some(&draft.summary));
    push_bullet_section(&mut out, "KEY DISCOVERIES", &draft.discoveries);
    push_text_section(&mut out, "EMOTIONAL STATE", draft.emotional_state.as_deref());
    push_bullet_section(&mut out, "OPEN TASKS", &draft.open_tasks);
    push_bullet_section(&mut out, "REFERENCES", &draft.references);
    push_text_section(&mut out, "RECOVERY HINTS", draft.recovery_hints.as_deref());

    out
}

fn push_text_section(out: &mut String, title: &str, body: Option<&str>) {
    if let Some(body) = body {
        if !body.trim().is_empty() {
            out.push_str(&format!("\n{title}:\n{}\n", body.trim()));
        }
    }
}

fn push_bullet_section(out: &mut String, title: &str, items: &[String]) {
    let items: Vec<&str> = items.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
    if items.is_empty() {
        return;
    }
    out.push_str(&format!("\n{title}:\n"));
    for item in items {
        out.push_str(&format!("- {item}\n"));
    }
}

/// A section marker is an ALL-CAPS line ending with a colon, e.g.
/// `OPEN TASKS:` or `SUMMARY:`.
fn is_section_marker(line: &str) -> bool {
    let line = line.trim();
    let Some(head) = line.strip_suffix(':') else { return false };
    !head.is_empty()
        && head
            .chars()
            .all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_whitespace())
}

/// Collect bullet lines beneath the `OPEN TASKS:` marker until a blank line
/// or the next section marker.  Fragments under [`MIN_TASK_CHARS`] characters
/// are discarded; duplicates keep first-seen order.
pub fn extract_open_tasks(body: &str) -> Vec<String> {
    let mut tasks = Vec::new();
    let mut seen = HashSet::new();
    let mut in_section = false;

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case("open tasks:") {
            in_section = true;
            continue;
        }
        if !in_section {
            continue;
        }
        if trimmed.is_empty() || is_section_marker(trimmed) {
            break;
        }
        let Some(item) = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("\u{2022} "))
        else {
            continue;
        };
        let item = item.trim();
        if item.chars().count() < MIN_TASK_CHARS {
            continue;
        }
        if seen.insert(item.to_string()) {
            tasks.push(item.to_string());
        }
    }

    tasks
}

/// References recovered from a note: record ids and thread ids, each
/// deduplicated in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteReferences {
    pub record_ids: Vec<String>,
    pub thread_ids: Vec<String>,
}

impl NoteReferences {
    pub fn is_empty(&self) -> bool {
        self.record_ids.is_empty() && self.thread_ids.is_empty()
    }

    pub fn merge(&mut self, other: NoteReferences) {
        for id in other.record_ids {
            if !self.record_ids.contains(&id) {
                self.record_ids.push(id);
            }
        }
        for id in other.thread_ids {
            if !self.thread_ids.contains(&id) {
                self.thread_ids.push(id);
            }
        }
    }
}

static RECORD_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bmem_[0-9a-f]{32}\b").expect("record-id pattern is valid"));
static THREAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(?:-\s*)?thread:\s*(\S+)\s*$").expect("thread pattern is valid")
});

/// Scan a note body for embedded record-id patterns and thread references
/// (the `THREAD:` header field and `thread:<id>` reference lines).
pub fn extract_references(body: &str) -> NoteReferences {
    let mut refs = NoteReferences::default();
    let mut seen_records = HashSet::new();
    let mut seen_threads = HashSet::new();

    for m in RECORD_ID_RE.find_iter(body) {
        let id = m.as_str().to_string();
        if seen_records.insert(id.clone()) {
            refs.record_ids.push(id);
        }
    }
    for caps in THREAD_RE.captures_iter(body) {
        let id = caps[1].to_string();
        if seen_threads.insert(id.clone()) {
            refs.thread_ids.push(id);
        }
    }

    refs
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn draft() -> NoteDraft {
        NoteDraft {
            summary: "Finished mapping the bridge protocol".to_string(),
            discoveries: vec!["bridges are pairwise only".to_string()],
            emotional_state: Some("steady".to_string()),
            open_tasks: vec!["verify bridge scoping".to_string(), "write up findings".to_string()],
            references: vec!["thread:weave-3".to_string()],
            recovery_hints: Some("start from the realm router".to_string()),
            priority: NotePriority::High,
            kind: NoteKind::Technical,
            thread_id: Some("weave-3".to_string()),
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 7, 14, 15, 3).unwrap()
    }

    #[test]
    fn session_id_has_second_resolution() {
        let author = AgentId::new("VAJRA");
        assert_eq!(session_id(&author, at()), "VAJRA_20260807_141503");
    }

    #[test]
    fn rendered_note_has_header_and_sections_in_stable_order() {
        let author = AgentId::new("VAJRA");
        let body = render_note(&author, "VAJRA_20260807_141503", at(), &draft());

        assert!(body.starts_with(NOTE_DELIMITER));
        assert!(body.contains("PRIORITY: HIGH | TYPE: technical"));
        assert!(body.contains("TO: future VAJRA"));
        assert!(body.contains("THREAD: weave-3"));

        let summary_at = body.find("SUMMARY:").unwrap();
        let tasks_at = body.find("OPEN TASKS:").unwrap();
        let hints_at = body.find("RECOVERY HINTS:").unwrap();
        assert!(summary_at < tasks_at && tasks_at < hints_at);
    }

    #[test]
    fn empty_sections_are_omitted() {
        let author = AgentId::new("VAJRA");
        let minimal = NoteDraft { summary: "just the summary".to_string(), ..Default::default() };
        let body = render_note(&author, "s", at(), &minimal);

        assert!(body.contains("SUMMARY:"));
        assert!(!body.contains("OPEN TASKS:"));
        assert!(!body.contains("EMOTIONAL STATE:"));
        assert!(!body.contains("REFERENCES:"));
    }

    #[test]
    fn open_tasks_round_trip_through_the_rendered_body() {
        let author = AgentId::new("VAJRA");
        let body = render_note(&author, "s", at(), &draft());
        assert_eq!(
            extract_open_tasks(&body),
            vec!["verify bridge scoping".to_string(), "write up findings".to_string()]
        );
    }

    #[test]
    fn task_extraction_stops_at_next_section_and_drops_noise() {
        let body = "OPEN TASKS:\n- real task here\n- ok\n\u{2022} bullet task two\nRECOVERY HINTS:\n- not a task\n";
        let tasks = extract_open_tasks(body);
        assert_eq!(tasks, vec!["real task here".to_string(), "bullet task two".to_string()]);
    }

    #[test]
    fn task_extraction_stops_at_blank_line() {
        let body = "OPEN TASKS:\n- task before gap\n\n- task after gap\n";
        assert_eq!(extract_open_tasks(body), vec!["task before gap".to_string()]);
    }

    #[test]
    fn task_extraction_deduplicates_preserving_first_seen_order() {
        let body = "OPEN TASKS:\n- alpha task\n- beta task\n- alpha task\n";
        assert_eq!(
            extract_open_tasks(body),
            vec!["alpha task".to_string(), "beta task".to_string()]
        );
    }

    #[test]
    fn references_capture_record_ids_and_threads() {
        let body = format!(
            "SUMMARY:\nsee mem_{0} and mem_{0} again\n\nREFERENCES:\n- mem_{1}\n- thread:weave-3\nTHREAD: weave-9\n",
            "0123456789abcdef0123456789abcdef", "fedcba9876543210fedcba9876543210"
        );
        let refs = extract_references(&body);
        assert_eq!(
            refs.record_ids,
            vec![
                "mem_0123456789abcdef0123456789abcdef".to_string(),
                "mem_fedcba9876543210fedcba9876543210".to_string(),
            ]
        );
        assert_eq!(refs.thread_ids, vec!["weave-3".to_string(), "weave-9".to_string()]);
    }

    #[test]
    fn malformed_ids_are_not_picked_up() {
        let refs = extract_references("mem_notahex mem_0123 plain text");
        assert!(refs.is_empty());
    }

    #[test]
    fn merge_preserves_first_seen_order_across_notes() {
        let mut acc = NoteReferences {
            record_ids: vec!["a".to_string()],
            thread_ids: vec!["t1".to_string()],
        };
        acc.merge(NoteReferences {
            record_ids: vec!["a".to_string(), "b".to_string()],
            thread_ids: vec!["t2".to_string(), "t1".to_string()],
        });
        assert_eq!(acc.record_ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(acc.thread_ids, vec!["t1".to_string(), "t2".to_string()]);
    }
}
