//! Display grouping policy.
//!
//! Consecutive messages from one sender collapse into a single visual run as
//! long as each follows the previous one within [`GROUP_WINDOW_MS`]. The first
//! message of a run shows the avatar; every continuation shows a timestamp.

use crate::domain::Message;

pub const GROUP_WINDOW_MS: i64 = 300_000;

/// Whether `current` begins a new run when it directly follows `previous`.
pub fn starts_run(previous: Option<&Message>, current: &Message) -> bool {
    match previous {
        None => true,
        Some(previous) => {
            previous.sender_id != current.sender_id
                || gap_millis(previous, current) > GROUP_WINDOW_MS
        }
    }
}

/// Whether `a` and `b` are close enough in time to share a run.
pub fn within_window(a: &Message, b: &Message) -> bool {
    gap_millis(a, b).abs() <= GROUP_WINDOW_MS
}

pub fn set_run_flags(message: &mut Message, starts_run: bool) {
    message.show_avatar = Some(starts_run);
    message.show_timestamp = Some(!starts_run);
}

fn gap_millis(earlier: &Message, later: &Message) -> i64 {
    (later.timestamp - earlier.timestamp).num_milliseconds()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::domain::SenderId;

    fn message(sender: &str, offset_ms: i64) -> Message {
        Message {
            id: None,
            sender_id: SenderId::new(sender),
            display_name: sender.to_uppercase(),
            avatar_ref: None,
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
                + Duration::milliseconds(offset_ms),
            body: "hi".into(),
            show_avatar: None,
            show_timestamp: None,
        }
    }

    #[test]
    fn first_message_always_starts_a_run() {
        assert!(starts_run(None, &message("a", 0)));
    }

    #[test]
    fn same_sender_at_exact_window_continues_run() {
        let first = message("a", 0);
        let second = message("a", GROUP_WINDOW_MS);
        assert!(!starts_run(Some(&first), &second));
    }

    #[test]
    fn same_sender_past_window_starts_run() {
        let first = message("a", 0);
        let second = message("a", GROUP_WINDOW_MS + 1);
        assert!(starts_run(Some(&first), &second));
    }

    #[test]
    fn different_sender_starts_run() {
        let first = message("a", 0);
        let second = message("b", 1_000);
        assert!(starts_run(Some(&first), &second));
    }

    #[test]
    fn run_flags_are_mutually_exclusive() {
        let mut m = message("a", 0);
        set_run_flags(&mut m, false);
        assert_eq!(m.show_avatar, Some(false));
        assert_eq!(m.show_timestamp, Some(true));
    }
}
