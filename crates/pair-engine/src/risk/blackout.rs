//! Scheduled trading blackout.
//!
//! The venue restarts daily; trading is suspended for a configured window
//! expressed in a local timezone so DST shifts track the venue, not UTC.

use chrono::{DateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::config::BlackoutSettings;

/// A daily blackout window in a fixed timezone.
#[derive(Debug, Clone)]
pub struct BlackoutWindow {
    enabled: bool,
    start_minutes: u32,
    end_minutes: u32,
    tz: Tz,
}

impl BlackoutWindow {
    pub fn new(settings: &BlackoutSettings) -> Result<Self, String> {
        let tz: Tz = settings
            .timezone
            .parse()
            .map_err(|_| format!("unknown timezone: {}", settings.timezone))?;
        Ok(Self {
            enabled: settings.enabled,
            start_minutes: settings.start_hour * 60 + settings.start_minute,
            end_minutes: settings.end_hour * 60 + settings.end_minute,
            tz,
        })
    }

    /// True if `now` falls inside the window (inclusive on both ends).
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        let local = self.tz.from_utc_datetime(&now.naive_utc());
        let minutes = local.hour() * 60 + local.minute();

        if self.start_minutes <= self.end_minutes {
            minutes >= self.start_minutes && minutes <= self.end_minutes
        } else {
            // Window wraps midnight.
            minutes >= self.start_minutes || minutes <= self.end_minutes
        }
    }
}
