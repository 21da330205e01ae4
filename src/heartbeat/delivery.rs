//! Deliver-or-suppress decision for heartbeat and task answers.
//!
//! An answer that is just the acknowledgement token, optionally with a
//! short remainder, means "nothing to report" and is suppressed. Anything
//! else is delivered to the user's mailbox.

/// Default acknowledgement token.
pub const DEFAULT_ACK_TOKEN: &str = "HEARTBEAT_OK";

/// Default remainder length (in characters) at which an acknowledgement
/// stops being bare. Shorter remainders are suppressed.
pub const DEFAULT_ACK_MAX_REMAINDER: usize = 300;

/// Longest summary line kept for mailbox entries.
const SUMMARY_MAX_CHARS: usize = 160;

/// Characters ignored around the token (markdown emphasis, quotes).
const DECORATION: &[char] = &['*', '_', '`', '"', '\''];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Suppress,
    Deliver { summary: String, detail: String },
}

impl Delivery {
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Deliver { .. })
    }
}

/// Text left after removing a leading or trailing `token`, if present.
fn ack_remainder<'a>(text: &'a str, token: &str) -> Option<&'a str> {
    let rest = text
        .trim_start_matches(DECORATION)
        .strip_prefix(token)
        .or_else(|| text.trim_end_matches(DECORATION).strip_suffix(token))?;
    Some(rest.trim_matches(|c: char| {
        c.is_whitespace() || DECORATION.contains(&c) || matches!(c, '.' | '!' | ':' | '-')
    }))
}

/// First meaningful line, without heading markers, bounded in length.
fn summary_line(text: &str) -> String {
    let line = text
        .lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    if line.chars().count() <= SUMMARY_MAX_CHARS {
        line.to_owned()
    } else {
        let mut cut: String = line.chars().take(SUMMARY_MAX_CHARS - 1).collect();
        cut.push('…');
        cut
    }
}

/// Decide whether `answer` should reach the user.
#[must_use]
pub fn decide(answer: &str, ack_token: &str, max_remainder_chars: usize) -> Delivery {
    let answer = answer.trim();
    if answer.is_empty() {
        return Delivery::Suppress;
    }
    if !ack_token.is_empty()
        && let Some(rest) = ack_remainder(answer, ack_token)
        && (rest.is_empty() || rest.chars().count() < max_remainder_chars)
    {
        return Delivery::Suppress;
    }
    Delivery::Deliver {
        summary: summary_line(answer),
        detail: answer.to_owned(),
    }
}
