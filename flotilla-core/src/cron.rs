//! Cron expression validation and the Windows Task Scheduler mapping.

use crate::error::{FlotillaError, FlotillaResult};
use tracing::warn;

/// Validate a cron string: 5 or 6 whitespace-separated fields drawn from the
/// charset `0-9 * / , -`. Raised at configuration time, before any side effect.
pub fn validate(schedule: &str) -> FlotillaResult<()> {
    let parts: Vec<&str> = schedule.split_whitespace().collect();
    if parts.len() != 5 && parts.len() != 6 {
        return Err(FlotillaError::Validation(format!(
            "cron expression must have 5 or 6 fields, got {}: '{}'",
            parts.len(),
            schedule
        )));
    }
    for part in &parts {
        if !part
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '*' | '/' | ',' | '-'))
        {
            return Err(FlotillaError::Validation(format!(
                "invalid cron field '{}' in '{}'",
                part, schedule
            )));
        }
    }
    Ok(())
}

/// Native Windows Task Scheduler cadences a cron subset maps onto.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowsSchedule {
    /// `*/N * * * *` → MINUTE /mo N
    EveryMinutes(u32),
    /// `M * * * *` → HOURLY at :M
    HourlyAt(u32),
    /// `M H * * *` → DAILY at H:M
    DailyAt(u32, u32),
}

impl WindowsSchedule {
    /// `schtasks /create` arguments for this cadence.
    pub fn schtasks_args(&self) -> Vec<String> {
        match self {
            WindowsSchedule::EveryMinutes(n) => {
                vec!["/sc".into(), "MINUTE".into(), "/mo".into(), n.to_string()]
            }
            WindowsSchedule::HourlyAt(m) => vec![
                "/sc".into(),
                "HOURLY".into(),
                "/mo".into(),
                "1".into(),
                "/st".into(),
                format!("00:{:02}", m),
            ],
            WindowsSchedule::DailyAt(h, m) => vec![
                "/sc".into(),
                "DAILY".into(),
                "/st".into(),
                format!("{:02}:{:02}", h, m),
            ],
        }
    }
}

/// Translate a cron subset to a Windows schedule.
///
/// Six-field forms drop the seconds field with a warning. Anything richer
/// than the enumerated shapes falls back to a fixed daily run at 02:00.
pub fn to_windows_schedule(schedule: &str) -> FlotillaResult<WindowsSchedule> {
    validate(schedule)?;

    let mut parts: Vec<&str> = schedule.split_whitespace().collect();
    if parts.len() == 6 {
        warn!(
            "Windows scheduler has no seconds field; '{}' reduced to minute granularity",
            schedule
        );
        parts.remove(0);
    }

    let (minute, hour) = (parts[0], parts[1]);

    if minute == "*" && hour == "*" {
        return Ok(WindowsSchedule::EveryMinutes(1));
    }

    if hour == "*" {
        if let Some(interval) = minute.strip_prefix("*/") {
            if let Ok(n) = interval.parse::<u32>() {
                return Ok(WindowsSchedule::EveryMinutes(n));
            }
        }
        if let Ok(m) = minute.parse::<u32>() {
            return Ok(WindowsSchedule::HourlyAt(m));
        }
    }

    if let (Ok(m), Ok(h)) = (minute.parse::<u32>(), hour.parse::<u32>()) {
        return Ok(WindowsSchedule::DailyAt(h, m));
    }

    warn!(
        "cron schedule '{}' is richer than the Windows mapping; falling back to daily at 02:00",
        schedule
    );
    Ok(WindowsSchedule::DailyAt(2, 0))
}
