use std::{fmt::Formatter, time::Duration};

use chrono::Local;
use croner::Cron;
use serde::{de::{self, Visitor}, Deserialize};
use snafu::{ResultExt, Snafu};

/// When the queue gets polled next.
#[derive(Debug)]
pub enum TimeSchedule {
    Interval(Duration),
    Cron(Cron),
}

impl TimeSchedule {
    pub fn get_duration_till_next_occurrence(&self) -> Result<Duration, ScheduleError> {
        match self {
            TimeSchedule::Cron(cron) => {
                let now = Local::now();
                let next_occurrence = cron.find_next_occurrence(&now, false).whatever_context("Could not resolve next occurrence from cron schedule")?;
                (next_occurrence - now).to_std().whatever_context("Could not convert TimeDelta to Duration")
            },
            TimeSchedule::Interval(duration) => Ok(*duration),
        }
    }
}

impl<'de> Deserialize<'de> for TimeSchedule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error> where D: serde::Deserializer<'de> {
        struct TimeScheduleVisitor;

        impl<'de> Visitor<'de> for TimeScheduleVisitor {
            type Value = TimeSchedule;

            fn expecting(&self, formatter: &mut Formatter) -> Result<(), std::fmt::Error> {
                formatter.write_str("a cron expression or a duration string")
            }

            fn visit_str<E>(self, value: &str) -> Result<TimeSchedule, E>
            where
                E: de::Error,
            {
                // Humantime first, so "5s" never reaches the cron parser.
                if let Ok(duration) = humantime::parse_duration(value) {
                    if duration.is_zero() {
                        return Err(E::custom("Poll interval must be greater than zero"));
                    }
                    return Ok(TimeSchedule::Interval(duration));
                }

                Cron::new(value)
                    .parse()
                    .map(TimeSchedule::Cron)
                    .map_err(|e| E::custom(format!("Invalid time schedule string '{}': {}", value, e)))
            }
        }

        deserializer.deserialize_str(TimeScheduleVisitor)
    }
}

// ////// //
// Errors //
// ////// //

#[derive(Debug, Snafu)]
pub enum ScheduleError {
    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

#[cfg(test)]
mod tests {
    use serde::de::{value::{Error as ValueError, StrDeserializer}, IntoDeserializer};

    use super::*;

    fn parse(value: &str) -> Result<TimeSchedule, ValueError> {
        let deserializer: StrDeserializer<ValueError> = value.into_deserializer();
        TimeSchedule::deserialize(deserializer)
    }

    #[test]
    fn humantime_interval_is_returned_as_is() {
        let schedule = parse("1m 30s").unwrap();
        assert_eq!(schedule.get_duration_till_next_occurrence().unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn cron_expression_yields_a_future_occurrence() {
        let schedule = parse("* * * * *").unwrap();
        assert!(matches!(schedule, TimeSchedule::Cron(_)));
        let wait = schedule.get_duration_till_next_occurrence().unwrap();
        assert!(wait <= Duration::from_secs(60));
    }

    #[test]
    fn garbage_and_zero_are_rejected() {
        assert!(parse("every now and then").is_err());
        assert!(parse("0s").is_err());
        assert!(parse("61 * * * *").is_err());
    }

    #[test]
    fn cron_every_other_minute_waits_at_most_two_minutes() {
        let schedule = parse("*/2 * * * *").unwrap();
        let wait = schedule.get_duration_till_next_occurrence().unwrap();
        assert!(wait <= Duration::from_secs(120));
    }
}
