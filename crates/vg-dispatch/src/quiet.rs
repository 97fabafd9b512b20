use chrono::{DateTime, FixedOffset, Timelike, Utc};

use vg_core::types::QuietHours;

/// Is `now` inside the member's quiet-hours window?
///
/// The window is interpreted in the member's timezone (`"UTC"` or a fixed
/// `"+HH:MM"`/`"-HH:MM"` offset). An end before the start wraps past
/// midnight. Malformed settings fail open (no quiet hours) so alerts are
/// never silently swallowed by a typo.
pub fn in_quiet_hours(quiet: &QuietHours, now: DateTime<Utc>) -> bool {
    if !quiet.enabled {
        return false;
    }
    let (Some(start), Some(end)) = (parse_hhmm(&quiet.start), parse_hhmm(&quiet.end)) else {
        return false;
    };
    let Some(offset) = parse_offset(&quiet.timezone) else {
        return false;
    };

    let local = now.with_timezone(&offset);
    let minute_of_day = local.hour() * 60 + local.minute();

    if start == end {
        return false;
    }
    if start < end {
        minute_of_day >= start && minute_of_day < end
    } else {
        // Overnight window, e.g. 22:00 - 07:00.
        minute_of_day >= start || minute_of_day < end
    }
}

fn parse_hhmm(raw: &str) -> Option<u32> {
    let (hours, minutes) = raw.split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    (hours < 24 && minutes < 60).then_some(hours * 60 + minutes)
}

fn parse_offset(timezone: &str) -> Option<FixedOffset> {
    if timezone.eq_ignore_ascii_case("utc") || timezone.eq_ignore_ascii_case("z") {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match timezone.split_at_checked(1)? {
        ("+", rest) => (1i32, rest),
        ("-", rest) => (-1i32, rest),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn quiet(start: &str, end: &str, timezone: &str) -> QuietHours {
        QuietHours {
            enabled: true,
            start: start.to_string(),
            end: end.to_string(),
            timezone: timezone.to_string(),
        }
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn overnight_window_wraps_midnight() {
        let q = quiet("22:00", "07:00", "UTC");
        assert!(in_quiet_hours(&q, at(23, 30)));
        assert!(in_quiet_hours(&q, at(3, 0)));
        assert!(!in_quiet_hours(&q, at(12, 0)));
        assert!(!in_quiet_hours(&q, at(7, 0)));
        assert!(in_quiet_hours(&q, at(6, 59)));
    }

    #[test]
    fn same_day_window() {
        let q = quiet("09:00", "17:00", "UTC");
        assert!(in_quiet_hours(&q, at(9, 0)));
        assert!(in_quiet_hours(&q, at(12, 0)));
        assert!(!in_quiet_hours(&q, at(17, 0)));
        assert!(!in_quiet_hours(&q, at(8, 59)));
    }

    #[test]
    fn offset_timezone_shifts_the_window() {
        // 22:00-07:00 at +02:00; 21:00 UTC is 23:00 local.
        let q = quiet("22:00", "07:00", "+02:00");
        assert!(in_quiet_hours(&q, at(21, 0)));
        // 19:00 UTC is 21:00 local, outside.
        assert!(!in_quiet_hours(&q, at(19, 0)));
    }

    #[test]
    fn disabled_or_malformed_settings_fail_open() {
        let mut q = quiet("22:00", "07:00", "UTC");
        q.enabled = false;
        assert!(!in_quiet_hours(&q, at(23, 0)));

        let q = quiet("25:00", "07:00", "UTC");
        assert!(!in_quiet_hours(&q, at(23, 0)));

        let q = quiet("22:00", "07:00", "Mars/Olympus");
        assert!(!in_quiet_hours(&q, at(23, 0)));
    }

    #[test]
    fn zero_length_window_is_never_quiet() {
        let q = quiet("09:00", "09:00", "UTC");
        assert!(!in_quiet_hours(&q, at(9, 0)));
    }
}
