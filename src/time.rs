use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

/// Immutable `[from, to]` instant pair. Derived ranges are always computed from
/// one input range; nothing mutates a range in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, String> {
        if to < from {
            return Err(format!(
                "range end {} must not precede range start {}",
                to.to_rfc3339(),
                from.to_rfc3339()
            ));
        }
        Ok(Self { from, to })
    }

    pub fn duration(&self) -> Duration {
        self.to - self.from
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} .. {}]", self.from.to_rfc3339(), self.to.to_rfc3339())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimeShiftUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
}

impl TimeShiftUnit {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "s" | "second" | "seconds" => Some(Self::Seconds),
            "m" | "minute" | "minutes" => Some(Self::Minutes),
            "h" | "hour" | "hours" => Some(Self::Hours),
            "d" | "day" | "days" => Some(Self::Days),
            "w" | "week" | "weeks" => Some(Self::Weeks),
            "month" | "months" => Some(Self::Months),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seconds => "seconds",
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
            Self::Weeks => "weeks",
            Self::Months => "months",
        }
    }

    fn fixed_seconds(&self) -> Option<i64> {
        match self {
            Self::Seconds => Some(1),
            Self::Minutes => Some(60),
            Self::Hours => Some(3_600),
            Self::Days => Some(86_400),
            Self::Weeks => Some(7 * 86_400),
            Self::Months => None,
        }
    }
}

fn shift_instant(
    instant: DateTime<Utc>,
    periods: u32,
    unit: TimeShiftUnit,
) -> Option<DateTime<Utc>> {
    match unit.fixed_seconds() {
        Some(unit_seconds) => {
            let seconds = i64::from(periods).checked_mul(unit_seconds)?;
            instant.checked_sub_signed(Duration::try_seconds(seconds)?)
        }
        // Calendar months: Mar 31 minus one month lands on the last day of February.
        None => instant.checked_sub_months(Months::new(periods)),
    }
}

/// Moves `range` `periods * unit` into the past.
///
/// The start is shifted with calendar semantics (months are real months, not 30 days) and the
/// end is re-derived from the original duration, so the shifted range always has exactly the
/// same length as the input.
pub fn shift(range: TimeRange, periods: u32, unit: TimeShiftUnit) -> Result<TimeRange, String> {
    let from = shift_instant(range.from, periods, unit).ok_or_else(|| {
        format!(
            "shifting {range} by {periods} {} leaves the representable time range",
            unit.as_str()
        )
    })?;
    let to = from
        .checked_add_signed(range.duration())
        .ok_or_else(|| format!("shifted range end for {range} is not representable"))?;
    Ok(TimeRange { from, to })
}

/// Produces `count` contiguous windows of the same duration as `range`, most recent first.
/// Window `0` is `range` itself; window `i` ends where window `i - 1` starts.
pub fn windows(range: TimeRange, count: u32) -> Result<Vec<TimeRange>, String> {
    let duration = range.duration();
    let mut out = Vec::new();
    for i in 0..count {
        let offset = i32::try_from(i)
            .ok()
            .and_then(|i| duration.checked_mul(i))
            .ok_or_else(|| format!("window {i} offset for {range} overflows"))?;
        let from = range
            .from
            .checked_sub_signed(offset)
            .ok_or_else(|| format!("window {i} for {range} is not representable"))?;
        let to = range
            .to
            .checked_sub_signed(offset)
            .ok_or_else(|| format!("window {i} for {range} is not representable"))?;
        out.push(TimeRange { from, to });
    }
    Ok(out)
}
