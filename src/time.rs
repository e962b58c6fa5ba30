//! Time windows used to filter entities by creation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A range of time (half-open interval: [from, to)).
///
/// Used by search to restrict candidates to entities created inside a window.
///
/// # Examples
///
/// ```
/// use kyromem::TimeRange;
/// use chrono::{Duration, Utc};
///
/// let now = Utc::now();
/// let range = TimeRange::new(now - Duration::hours(1), now).unwrap();
/// assert!(range.contains(now - Duration::minutes(5)));
/// assert!(!range.contains(now));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start of the range (inclusive).
    pub from: DateTime<Utc>,

    /// End of the range (exclusive). None means open-ended.
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// Creates a time range from two timestamps.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidTimeRange` if `from >= to`.
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, ValidationError> {
        if from >= to {
            return Err(ValidationError::InvalidTimeRange {
                reason: format!("from ({from}) must be before to ({to})"),
            });
        }
        Ok(Self { from, to: Some(to) })
    }

    /// Creates an open-ended time range starting at the given time.
    #[must_use]
    pub const fn starting_at(from: DateTime<Utc>) -> Self {
        Self { from, to: None }
    }

    /// Everything created strictly before `to`.
    #[must_use]
    pub const fn until(to: DateTime<Utc>) -> Self {
        Self {
            from: DateTime::<Utc>::MIN_UTC,
            to: Some(to),
        }
    }

    /// Creates a time range covering all time.
    #[must_use]
    pub const fn forever() -> Self {
        Self {
            from: DateTime::<Utc>::MIN_UTC,
            to: None,
        }
    }

    /// Returns true if the range has no end.
    #[must_use]
    pub const fn is_open_ended(&self) -> bool {
        self.to.is_none()
    }

    /// Check if a timestamp falls within this range [from, to).
    #[must_use]
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        time >= self.from && self.to.map_or(true, |to| time < to)
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to {
            Some(to) => write!(f, "[{}, {})", self.from.to_rfc3339(), to.to_rfc3339()),
            None => write!(f, "[{}, ∞)", self.from.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_time_range_new_invalid() {
        let now = Utc::now();
        assert!(TimeRange::new(now, now).is_err());
        assert!(TimeRange::new(now, now - Duration::seconds(1)).is_err());
    }

    #[test]
    fn test_time_range_contains() {
        let now = Utc::now();
        let range = TimeRange::new(now, now + Duration::hours(1)).unwrap();
        assert!(range.contains(now));
        assert!(range.contains(now + Duration::minutes(30)));
        assert!(!range.contains(now + Duration::hours(1)));
        assert!(!range.contains(now - Duration::seconds(1)));
    }

    #[test]
    fn test_time_range_open_ended() {
        let now = Utc::now();
        let range = TimeRange::starting_at(now);
        assert!(range.is_open_ended());
        assert!(range.contains(now + Duration::days(3650)));
        assert!(TimeRange::forever().contains(now));
        assert!(!TimeRange::until(now).contains(now));
    }

    #[test]
    fn test_time_range_serialization() {
        let range = TimeRange::starting_at(Utc::now());
        let json = serde_json::to_string(&range).unwrap();
        let back: TimeRange = serde_json::from_str(&json).unwrap();
        assert_eq!(range, back);
    }
}
