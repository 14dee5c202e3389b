//! Evaluation context for conditions
//!
//! A flat attribute map. Built-in request attributes are derived once per
//! request; caller supplied attributes are applied last and win on key
//! collision.

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Attribute holding the first user name
pub const ATTR_USER: &str = "request_user";
/// Attribute holding every group name
pub const ATTR_GROUPS: &str = "request_groups";
/// Attribute holding the first entity name
pub const ATTR_ENTITY: &str = "request_entity";
/// Attribute holding the requested resource
pub const ATTR_RESOURCE: &str = "request_resource";
/// Attribute holding the requested action
pub const ATTR_ACTION: &str = "request_action";
/// Attribute holding the unix time of the request
pub const ATTR_TIME: &str = "request_time";
/// Attribute holding the year of the request
pub const ATTR_YEAR: &str = "request_year";
/// Attribute holding the month (1-12) of the request
pub const ATTR_MONTH: &str = "request_month";
/// Attribute holding the day of month of the request
pub const ATTR_DAY: &str = "request_day";
/// Attribute holding the English weekday name of the request
pub const ATTR_WEEKDAY: &str = "request_weekday";
/// Attribute holding the hour of the request
pub const ATTR_HOUR: &str = "request_hour";

/// Attributes visible to conditions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalContext {
    attributes: HashMap<String, Value>,
}

impl EvalContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request time attributes from the local clock
    pub fn with_time_now(self) -> Self {
        self.with_time(Local::now())
    }

    /// Set the request time attributes from `time`
    pub fn with_time<Tz: TimeZone>(mut self, time: DateTime<Tz>) -> Self {
        self.set(ATTR_TIME, Value::from(time.timestamp()));
        self.set(ATTR_YEAR, Value::from(time.year()));
        self.set(ATTR_MONTH, Value::from(time.month()));
        self.set(ATTR_DAY, Value::from(time.day()));
        self.set(ATTR_HOUR, Value::from(time.hour()));
        self.set(ATTR_WEEKDAY, Value::from(weekday_name(time.weekday())));
        self
    }

    /// Set one attribute
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    /// Apply caller attributes on top of the existing ones
    pub fn merge(&mut self, attributes: &HashMap<String, Value>) {
        for (key, value) in attributes {
            self.attributes.insert(key.clone(), value.clone());
        }
    }

    /// Attribute by name
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Every attribute
    pub fn attributes(&self) -> &HashMap<String, Value> {
        &self.attributes
    }

    /// Consume the context into its attribute map
    pub fn into_attributes(self) -> HashMap<String, Value> {
        self.attributes
    }
}

impl From<HashMap<String, Value>> for EvalContext {
    fn from(attributes: HashMap<String, Value>) -> Self {
        Self { attributes }
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}
