//! Flat relation records as delivered by the relationship service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::fetch::paginated::parse_timestamp;

/// Status of a producer's relation to an agency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RelationStatus {
    Active,
    Inactive,
    Pending,
}

impl RelationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationStatus::Active => "active",
            RelationStatus::Inactive => "inactive",
            RelationStatus::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" | "a" => Some(RelationStatus::Active),
            "inactive" | "terminated" | "i" => Some(RelationStatus::Inactive),
            "pending" | "p" => Some(RelationStatus::Pending),
            _ => None,
        }
    }
}

impl fmt::Display for RelationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// Unrecognised statuses degrade to pending instead of failing the page
impl<'de> Deserialize<'de> for RelationStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw
            .as_deref()
            .and_then(RelationStatus::parse)
            .unwrap_or(RelationStatus::Pending))
    }
}

/// One producer ↔ agency relation row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationRecord {
    #[serde(deserialize_with = "de_id")]
    pub producer_id: String,
    /// Agency ("GA") id
    #[serde(default, deserialize_with = "de_id")]
    pub firm_id: String,
    #[serde(default)]
    pub branch_code: Option<String>,
    #[serde(default = "default_status")]
    pub status: RelationStatus,
    #[serde(default, deserialize_with = "de_timestamp")]
    pub added_on: Option<DateTime<Utc>>,
    /// Declared parent producer
    #[serde(default, deserialize_with = "de_opt_id")]
    pub upline: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub npn: Option<String>,
    #[serde(default)]
    pub producer_name: Option<String>,
    #[serde(default)]
    pub errors: Option<String>,
    #[serde(default)]
    pub warnings: Option<String>,
}

fn default_status() -> RelationStatus {
    RelationStatus::Pending
}

impl RelationRecord {
    pub fn new(producer_id: impl Into<String>, firm_id: impl Into<String>) -> Self {
        Self {
            producer_id: producer_id.into(),
            firm_id: firm_id.into(),
            branch_code: None,
            status: RelationStatus::Active,
            added_on: None,
            upline: None,
            npn: None,
            producer_name: None,
            errors: None,
            warnings: None,
        }
    }

    pub fn with_upline(mut self, upline: impl Into<String>) -> Self {
        self.upline = Some(upline.into());
        self
    }

    pub fn with_npn(mut self, npn: impl Into<String>) -> Self {
        self.npn = Some(npn.into());
        self
    }

    pub fn with_status(mut self, status: RelationStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.producer_name = Some(name.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch_code = Some(branch.into());
        self
    }

    pub fn added_on(mut self, at: DateTime<Utc>) -> Self {
        self.added_on = Some(at);
        self
    }

    /// Upline reference, `None` when absent or blank
    pub fn upline_ref(&self) -> Option<&str> {
        non_blank(self.upline.as_deref())
    }

    pub fn npn_ref(&self) -> Option<&str> {
        non_blank(self.npn.as_deref())
    }
}

pub(crate) fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Int(i64),
    Float(f64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(s) => s.trim().to_string(),
            RawId::Int(n) => n.to_string(),
            RawId::Float(f) if f.fract() == 0.0 => format!("{}", f as i64),
            RawId::Float(f) => f.to_string(),
        }
    }
}

fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<RawId>::deserialize(deserializer)?
        .map(RawId::into_string)
        .unwrap_or_default())
}

fn de_opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<RawId>::deserialize(deserializer)?
        .map(RawId::into_string)
        .filter(|s| !s.is_empty()))
}

fn de_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    Ok(Option::<RawId>::deserialize(deserializer)?
        .map(RawId::into_string)
        .and_then(|s| parse_timestamp(&s)))
}
