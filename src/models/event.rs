//! The upload target as seen by the upload path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An event that guests upload media into.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Event {
    pub id: String,

    /// Identity that owns the event; may upload after the window closes.
    pub owner_id: String,

    pub name: String,

    /// End of the guest upload window; `None` keeps it open indefinitely.
    pub upload_window_end: Option<DateTime<Utc>>,

    /// When set, guest uploads start unapproved.
    pub requires_approval: bool,
}

impl Event {
    /// Whether the guest upload window has closed at `now`.
    pub fn window_closed_at(&self, now: DateTime<Utc>) -> bool {
        self.upload_window_end.is_some_and(|end| now > end)
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn event(window_end: Option<DateTime<Utc>>) -> Event {
        Event {
            id: "evt".into(),
            owner_id: "owner".into(),
            name: "Wedding".into(),
            upload_window_end: window_end,
            requires_approval: false,
        }
    }

    #[test]
    fn open_window_never_closes() {
        assert!(!event(None).window_closed_at(Utc::now()));
    }

    #[test]
    fn window_closes_after_end() {
        let now = Utc::now();
        let evt = event(Some(now - Duration::minutes(1)));
        assert!(evt.window_closed_at(now));
        assert!(!event(Some(now + Duration::minutes(1))).window_closed_at(now));
    }
}
