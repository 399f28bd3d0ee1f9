//! Message model for staged mail files.
//!
//! A [`Mail`] is the validated form of one per-message JSON file. Validation
//! happens once, at construction: every `Mail` value has a non-empty
//! `mail_id`, a resolvable `domain`, and a parseable `received_time`, so the
//! downstream property mapping is infallible.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{Datelike, NaiveDate};
use serde_json::{Map, Value};

use crate::error::{IngestError, IngestResult};

/// A single parsed mail message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    /// Globally unique id; doubles as the vector object id.
    pub mail_id: String,
    /// Email-like address of the owning user.
    pub user_id: String,
    /// Tenant domain; defaults to the host part of `user_id`.
    pub domain: String,
    /// Original timestamp string, preserved verbatim for the ledger.
    pub received_time: String,
    /// Calendar date derived from `received_time`.
    pub received_date: NaiveDate,
    /// Header text mapped to `search_mail_header`.
    pub subject: String,
    /// Body text mapped to `search_mail_content`.
    pub content: String,
    /// Additional `filter_*` properties carried through to the sink.
    pub extra_filters: BTreeMap<String, String>,
}

impl Mail {
    /// Build a `Mail` from a raw JSON record, applying field aliases and
    /// validating the required fields.
    ///
    /// Accepted aliases: `mail_header` for `subject`, `mail_content` for
    /// `content`. The domain comes from the record's own `domain` field,
    /// then the host part of `user_id`, then `resolved_domain`: the domain
    /// the file was already grouped under (typically recovered from the
    /// filename), so a record that is routable by name alone never fails
    /// here. Pass an empty `resolved_domain` to require the record to be
    /// self-contained.
    pub fn from_json_record(record: &Value, resolved_domain: &str) -> IngestResult<Self> {
        let obj = record.as_object().ok_or_else(|| IngestError::MalformedRecord {
            detail: "top-level JSON value is not an object".to_owned(),
        })?;

        let mail_id = required_str(obj, "mail_id")?.to_owned();
        let user_id = required_str(obj, "user_id")?.to_owned();
        let received_time = required_str(obj, "received_time")?.to_owned();
        let received_date = parse_received_time(&received_time)?;

        let domain = match optional_str(obj, "domain") {
            Some(value) => value.to_owned(),
            None => user_id
                .split_once('@')
                .map(|(_, host)| host.to_owned())
                .filter(|host| !host.is_empty())
                .or_else(|| (!resolved_domain.is_empty()).then(|| resolved_domain.to_owned()))
                .ok_or(IngestError::MissingField { field: "domain" })?,
        };

        let subject = optional_str(obj, "subject")
            .or_else(|| optional_str(obj, "mail_header"))
            .unwrap_or_default()
            .to_owned();
        let content = optional_str(obj, "content")
            .or_else(|| optional_str(obj, "mail_content"))
            .unwrap_or_default()
            .to_owned();

        let mut extra_filters = BTreeMap::new();
        for key in ["mailbox", "folder"] {
            if let Some(value) = optional_str(obj, key) {
                extra_filters.insert(format!("filter_{key}"), value.to_owned());
            }
        }
        // Schema-driven extras arrive already prefixed and pass through as-is.
        for (key, value) in obj {
            if key.starts_with("filter_") {
                if let Some(text) = value.as_str() {
                    extra_filters.insert(key.clone(), text.to_owned());
                }
            }
        }

        Ok(Self {
            mail_id,
            user_id,
            domain,
            received_time,
            received_date,
            subject,
            content,
            extra_filters,
        })
    }

    /// Year/month/day filter values, zero-padded.
    #[must_use]
    pub fn ymd_filters(&self) -> (String, String, String) {
        (
            format!("{:04}", self.received_date.year()),
            format!("{:02}", self.received_date.month()),
            format!("{:02}", self.received_date.day()),
        )
    }

    /// The fixed property mapping expected by the sink collection schema.
    #[must_use]
    pub fn to_properties(&self) -> Map<String, Value> {
        let (year, month, day) = self.ymd_filters();
        let mut props = Map::new();
        props.insert("filter_user_id".to_owned(), Value::String(self.user_id.clone()));
        props.insert("filter_year".to_owned(), Value::String(year));
        props.insert("filter_month".to_owned(), Value::String(month));
        props.insert("filter_day".to_owned(), Value::String(day));
        props.insert("mail_id".to_owned(), Value::String(self.mail_id.clone()));
        props.insert(
            "search_mail_content".to_owned(),
            Value::String(self.content.clone()),
        );
        props.insert(
            "search_mail_header".to_owned(),
            Value::String(self.subject.clone()),
        );
        for (key, value) in &self.extra_filters {
            props.insert(key.clone(), Value::String(value.clone()));
        }
        props
    }
}

/// One unit of work: files for a single tenant, handled atomically by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailBatch {
    /// Tenant domain every file in this batch belongs to.
    pub domain: String,
    /// Absolute paths of the staged files, all under `run/`.
    pub file_paths: Vec<PathBuf>,
}

fn required_str<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> IngestResult<&'a str> {
    optional_str(obj, field).ok_or(IngestError::MissingField { field })
}

fn optional_str<'a>(obj: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    obj.get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

fn parse_received_time(value: &str) -> IngestResult<NaiveDate> {
    if let Ok(zoned) = chrono::DateTime::parse_from_rfc3339(value) {
        return Ok(zoned.naive_local().date());
    }
    if let Ok(local) = value.parse::<chrono::NaiveDateTime>() {
        return Ok(local.date());
    }
    if let Ok(local) = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(local.date());
    }
    if let Ok(date) = value.parse::<NaiveDate>() {
        return Ok(date);
    }
    Err(IngestError::InvalidTimestamp {
        value: value.to_owned(),
    })
}
