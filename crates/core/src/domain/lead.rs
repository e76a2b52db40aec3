use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Semantic keys a lead summary can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadField {
    Salutation,
    FirstName,
    LastName,
    Email,
    Phone,
    ZipCode,
    Quantity,
    Description,
    Subject,
    PlannedStart,
}

impl LeadField {
    /// Fields that must all be present before a lead may be submitted.
    pub const REQUIRED: [LeadField; 7] = [
        LeadField::FirstName,
        LeadField::LastName,
        LeadField::Email,
        LeadField::Phone,
        LeadField::ZipCode,
        LeadField::Quantity,
        LeadField::Description,
    ];

    pub fn as_key(&self) -> &'static str {
        match self {
            Self::Salutation => "salutation",
            Self::FirstName => "first_name",
            Self::LastName => "last_name",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::ZipCode => "zip_code",
            Self::Quantity => "quantity",
            Self::Description => "description",
            Self::Subject => "subject",
            Self::PlannedStart => "planned_start",
        }
    }

}

impl fmt::Display for LeadField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

/// Flat record of fields pulled out of a confirmed summary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeadRecord {
    fields: BTreeMap<LeadField, String>,
}

impl LeadRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value, replacing an earlier one for the same field.
    pub fn insert(&mut self, field: LeadField, value: impl Into<String>) {
        self.fields.insert(field, value.into());
    }

    pub fn get(&self, field: LeadField) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    pub fn contains(&self, field: LeadField) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn missing_required(&self) -> Vec<LeadField> {
        LeadField::REQUIRED.into_iter().filter(|field| !self.contains(*field)).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_required().is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LeadField, &str)> {
        self.fields.iter().map(|(field, value)| (*field, value.as_str()))
    }

    /// String-keyed view, as stored on the session.
    pub fn to_key_map(&self) -> BTreeMap<String, String> {
        self.iter().map(|(field, value)| (field.as_key().to_string(), value.to_string())).collect()
    }
}
