use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use ultradoc_core::{Field, StructuredFields};

/// Question phrases that route straight to a cached field, checked in order.
pub const FIELD_KEYWORDS: &[(Field, &[&str])] = &[
    (Field::ShipmentId, &["shipment id", "shipment number", "load id"]),
    (Field::Shipper, &["shipper"]),
    (Field::Consignee, &["consignee", "receiver"]),
    (Field::PickupDatetime, &["pickup date", "pickup time", "pick up"]),
    (Field::DeliveryDatetime, &["delivery date", "delivery time", "deliver"]),
    (Field::EquipmentType, &["equipment type", "equipment"]),
    (Field::Mode, &["mode of transport", "shipping mode"]),
    (Field::Rate, &["carrier rate", "rate", "charge", "amount"]),
    (Field::Currency, &["currency"]),
    (Field::Weight, &["weight"]),
    (Field::CarrierName, &["carrier name", "carrier"]),
];

// one whole-word matcher per FIELD_KEYWORDS entry, same order
static FIELD_MATCHERS: Lazy<Vec<(Field, Regex)>> = Lazy::new(|| {
    FIELD_KEYWORDS
        .iter()
        .map(|(field, phrases)| {
            let alternatives = phrases
                .iter()
                .map(|phrase| regex::escape(phrase).replace(' ', r"\s+"))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = format!(r"(?i)\b(?:{alternatives})s?\b");
            (*field, Regex::new(&pattern).expect("valid field phrase regex"))
        })
        .collect()
});

/// The first field, in table order, with a phrase standing as whole words in
/// `question`.
pub fn requested_field(question: &str) -> Option<Field> {
    FIELD_MATCHERS
        .iter()
        .find(|(_, matcher)| matcher.is_match(question))
        .map(|(field, _)| *field)
}

/// A cached value answering a question, with the document it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAnswer {
    pub field: Field,
    pub value: String,
    pub document_id: String,
}

/// Extracted fields per document id. Replacing an entry is how re-ingestion
/// invalidates stale values.
#[derive(Debug, Clone, Default)]
pub struct FieldCache {
    entries: HashMap<String, StructuredFields>,
}

impl FieldCache {
    pub fn insert(&mut self, document_id: &str, fields: StructuredFields) {
        self.entries.insert(document_id.to_string(), fields);
    }

    pub fn get(&self, document_id: &str) -> Option<&StructuredFields> {
        self.entries.get(document_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Merges documents in the given order; the first document holding a
    /// field keeps it.
    pub fn merged<'a, I>(&self, order: I) -> StructuredFields
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut merged = StructuredFields::default();
        for document_id in order {
            if let Some(fields) = self.entries.get(document_id) {
                merged.fill_missing_from(fields);
            }
        }
        merged
    }

    /// Answers `question` from the field it asks for, taking the first
    /// document in `order` that has a value. A requested field with no value
    /// anywhere yields `None`; later fields are never consulted.
    pub fn lookup<'a, I>(&self, question: &str, order: I) -> Option<FieldAnswer>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let field = requested_field(question)?;
        order.into_iter().find_map(|document_id| {
            let fields = self.entries.get(document_id)?;
            let value = fields.get(field)?;
            Some(FieldAnswer {
                field,
                value: render_value(field, value, fields),
                document_id: document_id.to_string(),
            })
        })
    }
}

// a rate reads as an amount with its unit when the same document names one
fn render_value(field: Field, value: &str, fields: &StructuredFields) -> String {
    match (field, fields.get(Field::Currency)) {
        (Field::Rate, Some(currency)) if !value.to_uppercase().contains(&currency.to_uppercase()) => {
            format!("{value} {currency}")
        }
        _ => value.to_string(),
    }
}
