//! Admission policy for session manager (C9): do-not-disturb windows,
//! hourly call-rate limiting, and the combined outbound-call checklist
//! from spec.md §4.9. Inbound-INVITE admission (busy/allow-list) lives
//! on the user agent itself (spec.md §4.5), since it also needs
//! transaction-level state this module has no business holding.

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::collections::{HashMap, VecDeque};

/// A `[startHour, endHour)` window, hours in 0..24 local-to-`tz`.
pub type HourWindow = (u32, u32);

/// Do-not-disturb windows (spec.md §6 `CallPreferences.DoNotDisturb`).
/// The config surface stays a flat list of windows; `weekday_override`
/// is carried for parity with the original but always empty from the
/// current config loader (`original_source/Utils/doNotDisturb.py`
/// supports both; nothing in spec.md's config shape populates the
/// per-weekday map yet).
pub struct DoNotDisturb {
    pub windows: Vec<HourWindow>,
    pub weekday_override: HashMap<chrono::Weekday, Vec<HourWindow>>,
    /// Signed hours to add to UTC before reading the hour/weekday
    /// (spec.md §6 `Timezone.UtcOffset`).
    pub utc_offset_hours: i32,
}

impl DoNotDisturb {
    pub fn new(windows: Vec<HourWindow>, utc_offset_hours: i32) -> Self {
        DoNotDisturb {
            windows,
            weekday_override: HashMap::new(),
            utc_offset_hours,
        }
    }

    pub fn violated_at(&self, now: DateTime<Utc>) -> bool {
        let local = now + chrono::Duration::hours(self.utc_offset_hours as i64);
        let hour = local.hour();
        let weekday = local.weekday();
        let windows = self.weekday_override.get(&weekday).unwrap_or(&self.windows);
        windows.iter().any(|(start, end)| *start <= hour && hour < *end)
    }

    pub fn violated(&self) -> bool {
        self.violated_at(Utc::now())
    }
}

/// Bounded log of recent call timestamps (spec.md §4.9 "hourly-call-limit
/// check"): a deque capped at `hourlyLimit`; the limit is exceeded only
/// once the deque is full *and* its oldest entry is still within the
/// last hour.
pub struct CallLog {
    calls: VecDeque<DateTime<Utc>>,
    limit: usize,
}

impl CallLog {
    pub fn new(hourly_limit: usize) -> Self {
        CallLog {
            calls: VecDeque::with_capacity(hourly_limit),
            limit: hourly_limit,
        }
    }

    pub fn record_at(&mut self, now: DateTime<Utc>) {
        if self.calls.len() == self.limit {
            self.calls.pop_front();
        }
        self.calls.push_back(now);
    }

    pub fn record(&mut self) {
        self.record_at(Utc::now());
    }

    pub fn next_allowed_time_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.limit == 0 || self.calls.len() < self.limit {
            return None;
        }
        let next_allowed = *self.calls.front()? + chrono::Duration::hours(1);
        (next_allowed > now).then_some(next_allowed)
    }

    pub fn next_allowed_time(&self) -> Option<DateTime<Utc>> {
        self.next_allowed_time_at(Utc::now())
    }

    pub fn limit_exceeded(&self) -> bool {
        self.next_allowed_time().is_some()
    }
}

/// Why an outbound call request from a chat mention was denied, in the
/// evaluation order spec.md §4.9 specifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDenied {
    MentionedUserNotInVoice,
    DoNotDisturb,
    HourlyLimitExceeded,
    AlreadyInVoiceChannel,
}

/// Evaluate the full outbound-call checklist. Order matters: the
/// mentioned user must be in voice, then DND, then the hourly limit,
/// then "bot not already in a voice channel" (spec.md §4.9).
pub fn check_outbound_call(
    mentioned_user_in_voice: bool,
    dnd: &DoNotDisturb,
    call_log: &CallLog,
    bot_already_in_voice: bool,
) -> Result<(), AdmissionDenied> {
    if !mentioned_user_in_voice {
        return Err(AdmissionDenied::MentionedUserNotInVoice);
    }
    if dnd.violated() {
        return Err(AdmissionDenied::DoNotDisturb);
    }
    if call_log.limit_exceeded() {
        return Err(AdmissionDenied::HourlyLimitExceeded);
    }
    if bot_already_in_voice {
        return Err(AdmissionDenied::AlreadyInVoiceChannel);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 27, hour, 0, 0).unwrap()
    }

    #[test]
    fn dnd_flags_hours_inside_window() {
        let dnd = DoNotDisturb::new(vec![(22, 24), (0, 7)], 0);
        assert!(dnd.violated_at(at(23)));
        assert!(dnd.violated_at(at(3)));
        assert!(!dnd.violated_at(at(12)));
    }

    #[test]
    fn dnd_applies_utc_offset_before_checking_window() {
        // UTC 23:00 with a -5h offset is 18:00 local, outside a 22-7 window.
        let dnd = DoNotDisturb::new(vec![(22, 24), (0, 7)], -5);
        assert!(!dnd.violated_at(at(23)));
        // UTC 2:00 with a -5h offset is 21:00 the previous local day, outside the window.
        assert!(!dnd.violated_at(at(2)));
        // UTC 4:00 with a -5h offset is 23:00 local, inside the window.
        assert!(dnd.violated_at(at(4)));
    }

    #[test]
    fn call_log_exceeds_limit_only_when_full_and_recent() {
        let mut log = CallLog::new(2);
        assert!(!log.limit_exceeded());
        log.record_at(at(10));
        log.record_at(at(10));
        assert!(log.next_allowed_time_at(at(10)).is_some());
        assert!(log.next_allowed_time_at(at(11)).is_none());
    }

    #[test]
    fn call_log_evicts_oldest_on_overflow() {
        let mut log = CallLog::new(1);
        log.record_at(at(1));
        log.record_at(at(2));
        assert_eq!(log.calls.len(), 1);
        assert_eq!(*log.calls.front().unwrap(), at(2));
    }

    #[test]
    fn outbound_checklist_evaluates_in_order() {
        let dnd = DoNotDisturb::new(vec![], 0);
        let log = CallLog::new(5);
        assert_eq!(
            check_outbound_call(false, &dnd, &log, false),
            Err(AdmissionDenied::MentionedUserNotInVoice)
        );
        assert_eq!(check_outbound_call(true, &dnd, &log, false), Ok(()));
        assert_eq!(
            check_outbound_call(true, &dnd, &log, true),
            Err(AdmissionDenied::AlreadyInVoiceChannel)
        );
    }
}
