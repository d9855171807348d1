use daycare_core::HistoryRecord;

/// Text left in place of a redacted user message.
pub const REDACTED_TEXT: &str = "<deleted>";

/// Fold editing markers into the effective history.
///
/// A `history_truncate` marker drops everything after its target user message and
/// shows up as a note; a `message_redact` marker blanks its target's text. Every
/// other record passes through in order.
pub fn history_view(raw: &[HistoryRecord]) -> Vec<HistoryRecord> {
    let mut out: Vec<HistoryRecord> = Vec::with_capacity(raw.len());
    for record in raw {
        match record {
            HistoryRecord::HistoryTruncate {
                at,
                message_id,
                deleted_count,
                reason,
            } => {
                if let Some(pos) = find_user_message(&out, message_id) {
                    out.truncate(pos + 1);
                }
                out.push(HistoryRecord::Note {
                    at: *at,
                    text: truncate_note(*deleted_count, reason.as_deref()),
                });
            }
            HistoryRecord::MessageRedact { message_id, .. } => {
                if let Some(pos) = find_user_message(&out, message_id)
                    && let HistoryRecord::UserMessage { text, .. } = &mut out[pos]
                {
                    *text = REDACTED_TEXT.to_string();
                }
            }
            other => out.push(other.clone()),
        }
    }
    out
}

/// Position of the user message carrying `message_id`.
pub(crate) fn find_user_message(records: &[HistoryRecord], message_id: &str) -> Option<usize> {
    records.iter().position(|r| {
        matches!(r, HistoryRecord::UserMessage { message_id: Some(id), .. } if id == message_id)
    })
}

pub(crate) fn truncate_note(deleted_count: usize, reason: Option<&str>) -> String {
    match reason {
        Some(reason) if !reason.trim().is_empty() => {
            format!("{deleted_count} message(s) deleted: {reason}")
        }
        _ => format!("{deleted_count} message(s) deleted"),
    }
}
