use crate::metadata::{FieldDef, FieldType, Registry};
use serde_json::Value;

/// Formats a field value for alert text, dispatching on the field type.
/// List fields format each element and join with ", ".
pub fn format_value(registry: &Registry, field: &FieldDef, value: &Value) -> String {
    if value.is_null() {
        return String::new();
    }

    if field.is_list {
        if let Value::Array(items) = value {
            return items
                .iter()
                .map(|item| format_scalar(registry, field, item))
                .collect::<Vec<_>>()
                .join(", ");
        }
    }

    format_scalar(registry, field, value)
}

fn format_scalar(registry: &Registry, field: &FieldDef, value: &Value) -> String {
    match field.field_type {
        FieldType::Boolean => {
            if value.as_bool() == Some(true) {
                "yes".to_string()
            } else {
                "no".to_string()
            }
        }
        FieldType::PersonName => value
            .get("full")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        FieldType::Lookup => format_lookup(registry, field, value),
        FieldType::Address => format_address(value),
        FieldType::Phone => format_phone(value),
        FieldType::Money => format_money(value),
        FieldType::Date => format_date(value),
        FieldType::DateTime => format_date_time(value),
        FieldType::Filter => "(filter)".to_string(),
        FieldType::Picklist => match value {
            Value::Array(items) => items
                .iter()
                .map(display_scalar)
                .collect::<Vec<_>>()
                .join(", "),
            other => display_scalar(other),
        },
        _ => display_scalar(value),
    }
}

/// Lookup snapshots format as their description field values joined with
/// " - ", recursing through nested lookup descriptions.
fn format_lookup(registry: &Registry, field: &FieldDef, value: &Value) -> String {
    let Some(def) = field.lookup.as_ref() else {
        return display_scalar(value);
    };
    let Some(target_meta) = registry.document(&def.target_document) else {
        return display_scalar(value);
    };

    let mut parts = Vec::new();
    for path in &def.description_fields {
        let first = path.split('.').next().unwrap_or(path);
        let Some(desc_field) = target_meta.fields.get(first) else {
            continue;
        };
        let Some(desc_value) = value.get(first) else {
            continue;
        };
        let formatted = format_value(registry, desc_field, desc_value);
        if !formatted.is_empty() {
            parts.push(formatted);
        }
    }

    if parts.is_empty() {
        display_scalar(value)
    } else {
        parts.join(" - ")
    }
}

fn format_address(value: &Value) -> String {
    let part = |key: &str| value.get(key).and_then(Value::as_str);
    let mut out = String::new();
    if let Some(place_type) = part("placeType") {
        out.push_str(place_type);
    }
    if let Some(place) = part("place") {
        out.push(' ');
        out.push_str(place);
    }
    for key in ["number", "complement", "district", "city", "state", "country", "postalCode"] {
        if let Some(piece) = value.get(key).map(display_scalar).filter(|p| !p.is_empty()) {
            out.push_str(", ");
            out.push_str(&piece);
        }
    }
    out.trim_start_matches(", ").trim().to_string()
}

fn format_phone(value: &Value) -> String {
    let mut out = String::new();
    if let Some(country) = value.get("countryCode").map(display_scalar) {
        out.push_str(&country);
    }
    if let Some(number) = value.get("phoneNumber").and_then(Value::as_str) {
        // Slices only on char boundaries; odd numbers render as-is.
        match (number.get(..2), number.get(2..6), number.get(6..)) {
            (Some(area), Some(prefix), Some(rest)) if !rest.is_empty() => {
                out.push_str(&format!(" ({area}) {prefix}-{rest}"));
            }
            _ => {
                out.push(' ');
                out.push_str(number);
            }
        }
    }
    out.trim().to_string()
}

fn format_money(value: &Value) -> String {
    let amount = value
        .get("value")
        .and_then(Value::as_f64)
        .unwrap_or_default();
    match value.get("currency").and_then(Value::as_str) {
        Some("BRL") => format!("R$ {}", number_format(amount, ",", ".")),
        _ => format!("$ {}", number_format(amount, ".", ",")),
    }
}

/// `1234567.5` with `dsep`=","/`tsep`="." renders as `1.234.567,50`.
fn number_format(amount: f64, dsep: &str, tsep: &str) -> String {
    let fixed = format!("{amount:.2}");
    let (whole, decimals) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let negative = whole.starts_with('-');
    let digits: Vec<char> = whole.trim_start_matches('-').chars().collect();

    let mut grouped = String::new();
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push_str(tsep);
        }
        grouped.push(*c);
    }

    let sign = if negative { "-" } else { "" };
    format!("{sign}{grouped}{dsep}{decimals}")
}

fn format_date(value: &Value) -> String {
    let parts = value
        .as_str()
        .and_then(|s| Some((s.get(0..4)?, s.get(5..7)?, s.get(8..10)?)));
    match parts {
        Some((year, month, day)) => format!("{day}/{month}/{year}"),
        None => display_scalar(value),
    }
}

fn format_date_time(value: &Value) -> String {
    match value.as_str().and_then(|s| s.get(11..19)) {
        Some(time) => format!("{} {}", format_date(value), time),
        None => display_scalar(value),
    }
}

/// Plain rendering for scalars: strings unquoted, everything else as JSON.
pub fn display_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
