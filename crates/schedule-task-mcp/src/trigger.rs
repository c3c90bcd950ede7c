use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{SchedulerError, SchedulerResult};

/// The trigger families a task can be scheduled with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Interval,
    Cron,
    Date,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Interval => "interval",
            TriggerType::Cron => "cron",
            TriggerType::Date => "date",
        }
    }
}

impl FromStr for TriggerType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interval" => Ok(TriggerType::Interval),
            "cron" => Ok(TriggerType::Cron),
            "date" => Ok(TriggerType::Date),
            other => Err(SchedulerError::validation(format!(
                "unknown trigger_type {other:?}; expected interval, cron or date"
            ))),
        }
    }
}

/// Raw interval components. Any combination may be present; each must be a
/// positive number and the combined duration must round to at least 1 ms.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntervalSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minutes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hours: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CronSpec {
    pub expression: String,
}

/// Raw date trigger input: an absolute run date, a relative delay, or both.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DateSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_minutes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_hours: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_days: Option<f64>,
}

/// A validated trigger. Date triggers are materialized: the stored config
/// carries the absolute instant, never the relative delay it came from.
#[derive(Clone, Debug, PartialEq)]
pub enum Trigger {
    Interval(IntervalSpec),
    Cron(CronSpec),
    Date { run_date: DateTime<Utc> },
}

impl Trigger {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Trigger::Interval(_) => TriggerType::Interval,
            Trigger::Cron(_) => TriggerType::Cron,
            Trigger::Date { .. } => TriggerType::Date,
        }
    }

    /// Validates a registration-time `trigger_config`, materializing date
    /// triggers against `now`. Unknown keys fail the registration.
    pub fn from_config(
        trigger_type: TriggerType,
        config: &Value,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Trigger> {
        match trigger_type {
            TriggerType::Interval => {
                let spec: IntervalSpec = serde_json::from_value(config.clone()).map_err(|e| {
                    SchedulerError::validation(format!("invalid interval trigger_config: {e}"))
                })?;
                interval_duration(&spec)?;
                Ok(Trigger::Interval(spec))
            }
            TriggerType::Cron => {
                let spec: CronSpec = serde_json::from_value(config.clone()).map_err(|e| {
                    SchedulerError::validation(format!("invalid cron trigger_config: {e}"))
                })?;
                parse_cron(&spec.expression)?;
                Ok(Trigger::Cron(spec))
            }
            TriggerType::Date => {
                let spec: DateSpec = serde_json::from_value(config.clone()).map_err(|e| {
                    SchedulerError::validation(format!("invalid date trigger_config: {e}"))
                })?;
                let run_date = materialize_run_date(&spec, now)?;
                Ok(Trigger::Date { run_date })
            }
        }
    }

    /// Reads a previously persisted `trigger_config` without re-validating
    /// against the clock; date triggers must already be materialized.
    pub fn from_stored(trigger_type: TriggerType, config: &Value) -> SchedulerResult<Trigger> {
        match trigger_type {
            TriggerType::Interval => {
                let spec: IntervalSpec = serde_json::from_value(config.clone()).map_err(|e| {
                    SchedulerError::validation(format!("stored interval config unreadable: {e}"))
                })?;
                Ok(Trigger::Interval(spec))
            }
            TriggerType::Cron => {
                let spec: CronSpec = serde_json::from_value(config.clone()).map_err(|e| {
                    SchedulerError::validation(format!("stored cron config unreadable: {e}"))
                })?;
                Ok(Trigger::Cron(spec))
            }
            TriggerType::Date => {
                let run_date = config
                    .get("run_date")
                    .cloned()
                    .map(serde_json::from_value::<DateTime<Utc>>)
                    .transpose()
                    .map_err(|e| {
                        SchedulerError::validation(format!("stored date config unreadable: {e}"))
                    })?
                    .ok_or_else(|| {
                        SchedulerError::validation("stored date config is missing run_date")
                    })?;
                Ok(Trigger::Date { run_date })
            }
        }
    }

    /// The serialized form persisted as `trigger_config`.
    pub fn to_config(&self) -> SchedulerResult<Value> {
        let value = match self {
            Trigger::Interval(spec) => serde_json::to_value(spec)?,
            Trigger::Cron(spec) => serde_json::to_value(spec)?,
            Trigger::Date { run_date } => json!({ "run_date": run_date }),
        };
        Ok(value)
    }
}

/// The combined interval duration, rounded to whole milliseconds with a
/// 1 ms floor. Errors when no component is present, or any component is
/// not a positive finite number.
pub fn interval_duration(spec: &IntervalSpec) -> SchedulerResult<ChronoDuration> {
    let components = [
        (spec.seconds, 1_000.0, "seconds"),
        (spec.minutes, 60_000.0, "minutes"),
        (spec.hours, 3_600_000.0, "hours"),
        (spec.days, 86_400_000.0, "days"),
    ];

    let mut total_ms = 0.0_f64;
    let mut any = false;
    for (value, unit_ms, name) in components {
        if let Some(value) = value {
            if !value.is_finite() || value <= 0.0 {
                return Err(SchedulerError::validation(format!(
                    "interval {name} must be a positive number"
                )));
            }
            any = true;
            total_ms += value * unit_ms;
        }
    }

    if !any {
        return Err(SchedulerError::validation(
            "interval trigger requires at least one of seconds, minutes, hours, days",
        ));
    }

    Ok(ChronoDuration::milliseconds((total_ms.round() as i64).max(1)))
}

/// Validates a five-field cron expression and returns its parsed schedule.
/// The parser wants a seconds field, so one is prepended.
pub fn parse_cron(expression: &str) -> SchedulerResult<Schedule> {
    let fields = expression.split_whitespace().count();
    if fields != 5 {
        return Err(SchedulerError::validation(format!(
            "cron expression must have exactly five fields, got {fields}: {expression:?}"
        )));
    }
    Schedule::from_str(&format!("0 {expression}")).map_err(|e| {
        SchedulerError::validation(format!("invalid cron expression {expression:?}: {e}"))
    })
}

fn materialize_run_date(spec: &DateSpec, now: DateTime<Utc>) -> SchedulerResult<DateTime<Utc>> {
    let delay = date_delay(spec)?;

    let candidate = match (spec.run_date, delay) {
        (Some(run_date), _) => run_date,
        (None, Some(delay)) => now + delay,
        (None, None) => {
            return Err(SchedulerError::validation(
                "date trigger requires run_date or one of delay_seconds, delay_minutes, \
                 delay_hours, delay_days",
            ))
        }
    };

    if candidate <= now {
        // A past instant is re-anchored to the present: the given delay
        // when one was provided, one second otherwise.
        return Ok(match delay {
            Some(delay) => now + delay,
            None => now + ChronoDuration::seconds(1),
        });
    }
    Ok(candidate)
}

fn date_delay(spec: &DateSpec) -> SchedulerResult<Option<ChronoDuration>> {
    let components = [
        (spec.delay_seconds, 1_000.0, "delay_seconds"),
        (spec.delay_minutes, 60_000.0, "delay_minutes"),
        (spec.delay_hours, 3_600_000.0, "delay_hours"),
        (spec.delay_days, 86_400_000.0, "delay_days"),
    ];

    let mut total_ms = 0.0_f64;
    let mut any = false;
    for (value, unit_ms, name) in components {
        if let Some(value) = value {
            if !value.is_finite() || value < 0.0 {
                return Err(SchedulerError::validation(format!(
                    "{name} must be a non-negative number"
                )));
            }
            any = true;
            total_ms += value * unit_ms;
        }
    }

    Ok(any.then(|| ChronoDuration::milliseconds(total_ms.round() as i64)))
}

/// Computes the next fire instant for a trigger, or `None` when the trigger
/// cannot yield a future instant.
///
/// A `previously_planned` instant that is still in the future is returned
/// unchanged, preserving the tick schedule across restarts. The zone only
/// matters for cron evaluation.
pub fn next_fire(
    trigger: &Trigger,
    reference: DateTime<Utc>,
    tz: Tz,
    previously_planned: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match trigger {
        Trigger::Interval(spec) => {
            if let Some(planned) = previously_planned {
                if planned > reference {
                    return Some(planned);
                }
            }
            match interval_duration(spec) {
                Ok(delta) => Some(reference + delta),
                Err(error) => {
                    warn!("interval trigger is no longer computable: {error}");
                    None
                }
            }
        }
        Trigger::Cron(spec) => {
            if let Some(planned) = previously_planned {
                if planned > reference {
                    return Some(planned);
                }
            }
            match parse_cron(&spec.expression) {
                Ok(schedule) => schedule
                    .after(&reference.with_timezone(&tz))
                    .next()
                    .map(|occurrence| occurrence.with_timezone(&Utc)),
                Err(error) => {
                    warn!("cron trigger is no longer computable: {error}");
                    None
                }
            }
        }
        Trigger::Date { run_date } => {
            if *run_date <= reference {
                None
            } else {
                Some(*run_date)
            }
        }
    }
}
