use std::collections::HashMap;

use thiserror::Error;

use leadline_core::domain::lead::{LeadField, LeadRecord};

/// Phrases marking a reply that presents the collected request back to the visitor.
pub const SUMMARY_TRIGGERS: [&str; 3] = ["zusammenfassung", "summary", "überblick"];

/// Sentences the assistants are instructed to use once the visitor confirmed the summary.
pub const CONFIRMATION_TRIGGERS: [&str; 4] = [
    "dann werde ich die anfrage so an meine kollegen weiterleiten",
    "ich werde ihre anfrage so an meine kollegen weiterleiten",
    "ihre anfrage wird nun an meine kollegen weitergeleitet",
    "i will forward your request to my colleagues",
];

/// Label spellings the assistants use in summaries. Matching is case-exact.
pub const LABELS: [(&str, LeadField); 14] = [
    ("Anrede", LeadField::Salutation),
    ("Vorname", LeadField::FirstName),
    ("Nachname", LeadField::LastName),
    ("Email", LeadField::Email),
    ("E-Mail", LeadField::Email),
    ("Telefon", LeadField::Phone),
    ("Telefonnummer", LeadField::Phone),
    ("Postleitzahl", LeadField::ZipCode),
    ("PLZ", LeadField::ZipCode),
    ("Menge", LeadField::Quantity),
    ("Beschreibung", LeadField::Description),
    ("Betreff", LeadField::Subject),
    ("Geplanter Start", LeadField::PlannedStart),
    ("Geplanter Projektstart", LeadField::PlannedStart),
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplyClassification {
    pub is_summary: bool,
    pub is_confirmation: bool,
}

#[derive(Clone, Debug)]
pub struct ReplyClassifier {
    summary_triggers: Vec<String>,
    confirmation_triggers: Vec<String>,
}

impl Default for ReplyClassifier {
    fn default() -> Self {
        Self::with_triggers(SUMMARY_TRIGGERS, CONFIRMATION_TRIGGERS)
    }
}

impl ReplyClassifier {
    pub fn with_triggers<S, C>(summary: S, confirmation: C) -> Self
    where
        S: IntoIterator,
        S::Item: AsRef<str>,
        C: IntoIterator,
        C::Item: AsRef<str>,
    {
        Self {
            summary_triggers: summary.into_iter().map(|t| t.as_ref().to_lowercase()).collect(),
            confirmation_triggers: confirmation
                .into_iter()
                .map(|t| t.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn classify(&self, reply: &str) -> ReplyClassification {
        let normalized = reply.to_lowercase();
        ReplyClassification {
            is_summary: self.summary_triggers.iter().any(|t| normalized.contains(t.as_str())),
            is_confirmation: self
                .confirmation_triggers
                .iter()
                .any(|t| normalized.contains(t.as_str())),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("summary is missing required fields: {}", format_fields(.missing))]
    MissingFields { missing: Vec<LeadField> },
}

fn format_fields(fields: &[LeadField]) -> String {
    fields.iter().map(LeadField::as_key).collect::<Vec<_>>().join(", ")
}

/// Line-oriented `Label: value` parser.
///
/// Bullets and `**` emphasis around the label are removed, including a closing
/// `**` that lands after the colon (`**Vorname:** Max`). A label spelled differently from [`LABELS`] is ignored, so phrasing drift in
/// the assistant instructions silently drops that field.
#[derive(Clone, Debug)]
pub struct FieldExtractor {
    labels: HashMap<String, LeadField>,
}

impl Default for FieldExtractor {
    fn default() -> Self {
        Self::with_labels(LABELS)
    }
}

impl FieldExtractor {
    pub fn with_labels<I, L>(labels: I) -> Self
    where
        I: IntoIterator<Item = (L, LeadField)>,
        L: Into<String>,
    {
        Self { labels: labels.into_iter().map(|(label, field)| (label.into(), field)).collect() }
    }

    /// Collects every recognised field; later lines win over earlier ones.
    pub fn parse(&self, text: &str) -> LeadRecord {
        let mut record = LeadRecord::new();

        for line in text.lines() {
            let Some((raw_label, raw_value)) = line.split_once(':') else {
                continue;
            };
            let label = strip_label_decoration(raw_label);
            let value = strip_value_decoration(raw_value);
            if value.is_empty() {
                continue;
            }
            if let Some(field) = self.labels.get(label) {
                record.insert(*field, value);
            }
        }

        record
    }

    pub fn extract(&self, text: &str) -> Result<LeadRecord, ExtractionError> {
        let record = self.parse(text);
        if record.is_complete() {
            Ok(record)
        } else {
            Err(ExtractionError::MissingFields { missing: record.missing_required() })
        }
    }
}

fn strip_label_decoration(raw: &str) -> &str {
    raw.trim().trim_start_matches('-').trim().trim_matches('*').trim()
}

fn strip_value_decoration(raw: &str) -> &str {
    raw.trim().trim_start_matches('*').trim()
}
