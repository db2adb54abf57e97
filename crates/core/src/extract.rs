use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// The fixed shipment schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    ShipmentId,
    Shipper,
    Consignee,
    PickupDatetime,
    DeliveryDatetime,
    EquipmentType,
    Mode,
    Rate,
    Currency,
    Weight,
    CarrierName,
}

impl Field {
    pub const ALL: [Field; 11] = [
        Field::ShipmentId,
        Field::Shipper,
        Field::Consignee,
        Field::PickupDatetime,
        Field::DeliveryDatetime,
        Field::EquipmentType,
        Field::Mode,
        Field::Rate,
        Field::Currency,
        Field::Weight,
        Field::CarrierName,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::ShipmentId => "shipment_id",
            Field::Shipper => "shipper",
            Field::Consignee => "consignee",
            Field::PickupDatetime => "pickup_datetime",
            Field::DeliveryDatetime => "delivery_datetime",
            Field::EquipmentType => "equipment_type",
            Field::Mode => "mode",
            Field::Rate => "rate",
            Field::Currency => "currency",
            Field::Weight => "weight",
            Field::CarrierName => "carrier_name",
        }
    }
}

/// One slot per schema field. Absent values serialize as `null`, so the
/// output always carries all eleven keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredFields {
    pub shipment_id: Option<String>,
    pub shipper: Option<String>,
    pub consignee: Option<String>,
    pub pickup_datetime: Option<String>,
    pub delivery_datetime: Option<String>,
    pub equipment_type: Option<String>,
    pub mode: Option<String>,
    pub rate: Option<String>,
    pub currency: Option<String>,
    pub weight: Option<String>,
    pub carrier_name: Option<String>,
}

impl StructuredFields {
    pub fn get(&self, field: Field) -> Option<&str> {
        self.slot(field).as_deref()
    }

    pub fn set(&mut self, field: Field, value: Option<String>) {
        *self.slot_mut(field) = value;
    }

    /// Copies every field of `other` that is still absent here.
    pub fn fill_missing_from(&mut self, other: &StructuredFields) {
        for field in Field::ALL {
            if self.get(field).is_none() {
                if let Some(value) = other.get(field) {
                    self.set(field, Some(value.to_string()));
                }
            }
        }
    }

    pub fn found_count(&self) -> usize {
        Field::ALL
            .iter()
            .filter(|field| self.get(**field).is_some())
            .count()
    }

    fn slot(&self, field: Field) -> &Option<String> {
        match field {
            Field::ShipmentId => &self.shipment_id,
            Field::Shipper => &self.shipper,
            Field::Consignee => &self.consignee,
            Field::PickupDatetime => &self.pickup_datetime,
            Field::DeliveryDatetime => &self.delivery_datetime,
            Field::EquipmentType => &self.equipment_type,
            Field::Mode => &self.mode,
            Field::Rate => &self.rate,
            Field::Currency => &self.currency,
            Field::Weight => &self.weight,
            Field::CarrierName => &self.carrier_name,
        }
    }

    fn slot_mut(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::ShipmentId => &mut self.shipment_id,
            Field::Shipper => &mut self.shipper,
            Field::Consignee => &mut self.consignee,
            Field::PickupDatetime => &mut self.pickup_datetime,
            Field::DeliveryDatetime => &mut self.delivery_datetime,
            Field::EquipmentType => &mut self.equipment_type,
            Field::Mode => &mut self.mode,
            Field::Rate => &mut self.rate,
            Field::Currency => &mut self.currency,
            Field::Weight => &mut self.weight,
            Field::CarrierName => &mut self.carrier_name,
        }
    }
}

struct FieldRule {
    field: Field,
    patterns: Vec<Regex>,
    finish: fn(&str) -> String,
}

const DATE: &str = r"(\d{1,2}[/\-]\d{1,2}[/\-]\d{2,4}(?: \d{1,2}:\d{2})?)";
const AMOUNT: &str = r"(\d[\d,]*(?:\.\d+)?)";
const ID: &str = r"([A-Z0-9][A-Z0-9\-]*)";

static HORIZONTAL_SPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\S\n]+").expect("valid whitespace regex"));

static RULES: Lazy<Vec<FieldRule>> = Lazy::new(|| {
    vec![
        rule(
            Field::ShipmentId,
            &[
                &format!(r"\bshipment ?(?:id\b|#|no\b\.?|number\b) ?[:\-]? ?{ID}"),
                &format!(r"\bload ?(?:id\b|#|no\b\.?|number\b) ?[:\-]? ?{ID}"),
                &format!(r"\border ?(?:id\b|#|no\b\.?|number\b) ?[:\-]? ?{ID}"),
                &format!(r"\bpro ?(?:#|number\b) ?[:\-]? ?{ID}"),
                &format!(r"\bbol ?(?:#|number\b) ?[:\-]? ?{ID}"),
                r"\b(ld\d+)\b",
            ],
        ),
        rule(
            Field::Shipper,
            &[
                r"\bshipper ?[:\-] ?(.+?) ?(?:$|\b(?:consignee|receiver|delivery(?: date| time| location| address)?|deliver to) ?[:\-])",
                r"\bship from ?[:\-] ?(.+?) ?$",
                r"\borigin ?[:\-] ?(.+?) ?$",
                r"\bpickup (?:location|address|from) ?[:\-] ?(.+?) ?$",
            ],
        ),
        rule(
            Field::Consignee,
            &[
                r"\bconsignee ?[:\-] ?(.+?) ?(?:$|\b(?:shipper|delivery(?: date| time)?|pickup(?: date| time)?) ?[:\-])",
                r"\breceiver ?[:\-] ?(.+?) ?$",
                r"\bship to ?[:\-] ?(.+?) ?$",
                r"\bdestination ?[:\-] ?(.+?) ?$",
                r"\bdeliver(?:y)? (?:location|address|to) ?[:\-] ?(.+?) ?$",
            ],
        ),
        rule(
            Field::PickupDatetime,
            &[
                r"\bpick ?up ?(?:date|time|datetime)(?: ?/ ?time)? ?[:\-] ?(.+?) ?(?:$|\b(?:delivery|deliver|drop ?off)\b)",
                &format!(r"\bpick ?up ?[:\-] ?{DATE}"),
            ],
        ),
        rule(
            Field::DeliveryDatetime,
            &[
                r"\bdelivery ?(?:date|time|datetime)(?: ?/ ?time)? ?[:\-] ?(.+?) ?(?:$|\b(?:pick ?up)\b)",
                &format!(r"\bdeliver(?:y)? ?[:\-] ?{DATE}"),
                &format!(r"\bdrop ?off ?[:\-] ?{DATE}"),
            ],
        ),
        rule(
            Field::EquipmentType,
            &[
                r"\bequipment(?: type)? ?[:\-] ?(.+?) ?$",
                r"\b(flatbed|reefer|dry ?van|van|tanker|intermodal|container)\b",
            ],
        ),
        rule(
            Field::Mode,
            &[
                r"\b(?:shipping )?mode(?: of transport)? ?[:\-] ?(\w+)",
                r"\b(ftl|ltl|fcl|lcl|parcel|intermodal|drayage|truckload)\b",
            ],
        ),
        rule(
            Field::Rate,
            &[
                &format!(
                    r"\b(?:agreed ?amount|carrier ?rate|total ?(?:rate|charge|amount)|rate|charge) ?[:\-]? ?(?:\$|usd|inr|eur|gbp|cad)? ?{AMOUNT}"
                ),
                &format!(r"\$ ?{AMOUNT}"),
            ],
        ),
        FieldRule {
            field: Field::Currency,
            patterns: compile(&[r"\b(usd|inr|eur|gbp|cad)\b", r"(\$)"]),
            finish: currency_code,
        },
        rule(
            Field::Weight,
            &[
                &format!(r"\bweight ?[:\-] ?({AMOUNT_BARE}(?: ?(?:lbs?|kgs?|tons?)\b)?)"),
                &format!(r"({AMOUNT_BARE} ?(?:lbs?|kgs?|tons?))\b"),
            ],
        ),
        rule(
            Field::CarrierName,
            &[
                r"\bcarrier(?: name)? ?[:\-] ?(.+?) ?(?:$|\b(?:driver|dispatcher|rate)\b)",
                r"\btrucking company ?[:\-] ?(.+?) ?$",
            ],
        ),
    ]
});

const AMOUNT_BARE: &str = r"\d[\d,]*(?:\.\d+)?";

fn rule(field: Field, patterns: &[&str]) -> FieldRule {
    FieldRule {
        field,
        patterns: compile(patterns),
        finish: trim_value,
    }
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|pattern| Regex::new(&format!("(?im){pattern}")).expect("valid field regex"))
        .collect()
}

fn trim_value(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(|c: char| matches!(c, ',' | ';' | '|'))
        .trim()
        .to_string()
}

fn currency_code(raw: &str) -> String {
    match raw.trim() {
        "$" => "USD".to_string(),
        other => other.to_uppercase(),
    }
}

/// Regex-driven extraction of the shipment schema from raw document text.
///
/// Each field walks its patterns in order and keeps the first capture that is
/// non-empty after trimming. Fields never influence each other.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredExtractor;

impl StructuredExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, text: &str) -> StructuredFields {
        let normalized = HORIZONTAL_SPACE.replace_all(text, " ");
        let mut fields = StructuredFields::default();
        for rule in RULES.iter() {
            fields.set(rule.field, find_first(rule, &normalized));
        }
        fields
    }
}

fn find_first(rule: &FieldRule, text: &str) -> Option<String> {
    rule.patterns.iter().find_map(|pattern| {
        pattern
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .map(|m| (rule.finish)(m.as_str()))
            .find(|value| !value.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE_CONFIRMATION: &str = "RATE CONFIRMATION\n\
        Load ID: LD53657\n\
        Carrier Name: Swift Haulers LLC\n\
        Shipper: Acme Foods, 12 Dock Rd, Dallas TX\n\
        Consignee: Fresh Mart DC, Austin TX\n\
        Pickup Date: 02/08/2025 09:00\n\
        Delivery Date: 02/09/2025 14:00\n\
        Equipment: Reefer 53'\n\
        Mode: FTL\n\
        Agreed Amount: $1,850.00\n\
        Weight: 42,000 lbs\n";

    #[test]
    fn rate_and_shipment_only_document() {
        let fields =
            StructuredExtractor::new().extract("Carrier Rate: 2500 USD ... Shipment ID: SH-12345");
        assert_eq!(fields.rate.as_deref(), Some("2500"));
        assert_eq!(fields.currency.as_deref(), Some("USD"));
        assert_eq!(fields.shipment_id.as_deref(), Some("SH-12345"));
        assert_eq!(fields.found_count(), 3);
    }

    #[test]
    fn full_rate_confirmation_keeps_original_case() {
        let fields = StructuredExtractor::new().extract(RATE_CONFIRMATION);
        assert_eq!(fields.shipment_id.as_deref(), Some("LD53657"));
        assert_eq!(fields.carrier_name.as_deref(), Some("Swift Haulers LLC"));
        assert_eq!(fields.shipper.as_deref(), Some("Acme Foods, 12 Dock Rd, Dallas TX"));
        assert_eq!(fields.consignee.as_deref(), Some("Fresh Mart DC, Austin TX"));
        assert_eq!(fields.pickup_datetime.as_deref(), Some("02/08/2025 09:00"));
        assert_eq!(fields.delivery_datetime.as_deref(), Some("02/09/2025 14:00"));
        assert_eq!(fields.equipment_type.as_deref(), Some("Reefer 53'"));
        assert_eq!(fields.mode.as_deref(), Some("FTL"));
        assert_eq!(fields.rate.as_deref(), Some("1,850.00"));
        assert_eq!(fields.currency.as_deref(), Some("USD"));
        assert_eq!(fields.weight.as_deref(), Some("42,000 lbs"));
    }

    #[test]
    fn single_line_labels_stop_at_the_next_label() {
        let fields = StructuredExtractor::new()
            .extract("Shipper: Acme Corp Consignee: Beta LLC Delivery Date: 03/04/2025");
        assert_eq!(fields.shipper.as_deref(), Some("Acme Corp"));
        assert_eq!(fields.consignee.as_deref(), Some("Beta LLC"));
        assert_eq!(fields.delivery_datetime.as_deref(), Some("03/04/2025"));
    }

    #[test]
    fn fallback_patterns_fire_in_order() {
        let fields =
            StructuredExtractor::new().extract("Moving one dry van load, total due $900 for 12 tons");
        assert_eq!(fields.equipment_type.as_deref(), Some("dry van"));
        assert_eq!(fields.rate.as_deref(), Some("900"));
        assert_eq!(fields.currency.as_deref(), Some("USD"));
        assert_eq!(fields.weight.as_deref(), Some("12 tons"));
    }

    #[test]
    fn missing_fields_are_null_not_omitted() {
        let fields = StructuredExtractor::new().extract("nothing useful here");
        let value = serde_json::to_value(&fields).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 11);
        for field in Field::ALL {
            assert!(object[field.as_str()].is_null(), "{} should be null", field.as_str());
        }
    }

    #[test]
    fn extraction_is_idempotent() {
        let extractor = StructuredExtractor::new();
        assert_eq!(
            extractor.extract(RATE_CONFIRMATION),
            extractor.extract(RATE_CONFIRMATION)
        );
    }

    #[test]
    fn fill_missing_keeps_existing_values() {
        let mut first = StructuredFields {
            rate: Some("100".to_string()),
            ..Default::default()
        };
        let second = StructuredFields {
            rate: Some("200".to_string()),
            currency: Some("EUR".to_string()),
            ..Default::default()
        };
        first.fill_missing_from(&second);
        assert_eq!(first.rate.as_deref(), Some("100"));
        assert_eq!(first.currency.as_deref(), Some("EUR"));
    }
}
