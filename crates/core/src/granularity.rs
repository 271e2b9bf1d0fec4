//! Sampling granularity of trend data.

use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// The sampling interval of a trend store. Two packages only merge when
/// their granularities are equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Granularity {
    seconds: i64,
}

impl Granularity {
    /// A granularity of the given number of seconds.
    pub fn from_seconds(seconds: i64) -> Granularity {
        Granularity { seconds }
    }

    /// A granularity of whole minutes.
    pub fn minutes(minutes: i64) -> Granularity {
        Granularity::from_seconds(minutes * 60)
    }

    /// A granularity of whole hours.
    pub fn hours(hours: i64) -> Granularity {
        Granularity::from_seconds(hours * 3600)
    }

    /// A granularity of whole days.
    pub fn days(days: i64) -> Granularity {
        Granularity::from_seconds(days * 86_400)
    }

    /// The interval length in seconds.
    pub fn as_seconds(self) -> i64 {
        self.seconds
    }

    /// The interval as a chrono duration.
    pub fn as_duration(self) -> Duration {
        Duration::seconds(self.seconds)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seconds % 86_400 == 0 {
            write!(f, "{}d", self.seconds / 86_400)
        } else if self.seconds % 3600 == 0 {
            write!(f, "{}h", self.seconds / 3600)
        } else if self.seconds % 60 == 0 {
            write!(f, "{}m", self.seconds / 60)
        } else {
            write!(f, "{}s", self.seconds)
        }
    }
}
