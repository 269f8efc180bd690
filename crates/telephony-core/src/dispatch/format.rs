//! Message text for chat and SMS sinks

use crate::types::Money;

use super::NotificationEvent;

const MAX_TRANSCRIPT_CHARS: usize = 1500;
const MAX_SMS_CHARS: usize = 160;

pub fn format_money(amount: Money) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    match (secs / 60, secs % 60) {
        (0, s) => format!("{}s", s),
        (m, 0) => format!("{}m", m),
        (m, s) => format!("{}m {}s", m, s),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Multi-line message for chat bots
pub fn chat_message(event: &NotificationEvent) -> String {
    let mut lines = vec![
        format!("Call {} on {}", event.status.as_str(), event.line_number),
        format!("From: {}", event.caller),
        format!("To: {}", event.callee),
        format!("Direction: {}", event.direction.as_str()),
        format!("Duration: {}", format_duration(event.duration_secs)),
        format!(
            "Billed: {} min, cost {}",
            event.billed_minutes,
            format_money(event.cost)
        ),
        format!("Started: {}", event.started_at.format("%Y-%m-%d %H:%M:%S UTC")),
    ];
    if let Some(transcript) = event.transcript.as_deref().filter(|t| !t.trim().is_empty()) {
        lines.push(String::new());
        lines.push(truncate(transcript.trim(), MAX_TRANSCRIPT_CHARS));
    }
    lines.join("\n")
}

/// Single SMS-sized line
pub fn sms_message(event: &NotificationEvent) -> String {
    truncate(
        &format!(
            "Call {} {} -> {}, {}",
            event.status.as_str(),
            event.caller,
            event.callee,
            format_duration(event.duration_secs)
        ),
        MAX_SMS_CHARS,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_has_two_decimals() {
        assert_eq!(format_money(4000), "40.00");
        assert_eq!(format_money(5), "0.05");
        assert_eq!(format_money(-1250), "-12.50");
    }

    #[test]
    fn duration_is_compact() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(900), "15m");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "привет мир";
        assert_eq!(truncate(text, 7), "привет…");
        assert_eq!(truncate(text, 20), text);
    }
}
