use serde::Deserialize;
use serde_json::Value;
use ticket_triage_core::{Confidence, RecordCollection, TicketId, TicketRecord, Urgency};
use tracing::{debug, warn};

/// Loose shape of one persisted ticket. Field names written by older
/// dashboard builds (`key`, `Customer`, `Percentage`, ...) are accepted as
/// aliases, and every field is optional so one bad entry never fails a page.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StoredTicket {
    #[serde(alias = "key", alias = "Identity")]
    id: Option<Value>,
    #[serde(alias = "Customer", alias = "company", alias = "Company")]
    customer: Option<Value>,
    #[serde(alias = "Message")]
    message: Option<Value>,
    #[serde(alias = "Urgency")]
    urgency: Option<Value>,
    #[serde(alias = "Percentage")]
    confidence: Option<Value>,
    annotation: Option<Value>,
}

/// Decode a stored page. Anything other than a JSON array is treated as
/// absent; entries without a usable id or customer are dropped, and unknown
/// or malformed classification fields fall back to unclassified.
pub(crate) fn decode_records(page_key: &str, records_json: &str) -> Option<RecordCollection> {
    let entries = match serde_json::from_str::<Value>(records_json) {
        Ok(Value::Array(entries)) => entries,
        Ok(_) => {
            warn!(page_key, "stored page is not a JSON array, treating as absent");
            return None;
        }
        Err(err) => {
            warn!(page_key, error = %err, "stored page is not valid JSON, treating as absent");
            return None;
        }
    };

    let total = entries.len();
    let records = entries.into_iter().filter_map(decode_ticket).collect::<Vec<_>>();
    if records.len() < total {
        debug!(page_key, dropped = total - records.len(), "dropped undecodable stored tickets");
    }
    Some(RecordCollection::from_records(records))
}

fn decode_ticket(entry: Value) -> Option<TicketRecord> {
    let stored = serde_json::from_value::<StoredTicket>(entry).ok()?;

    let id = match stored.id? {
        Value::String(raw) => TicketId::parse(&raw).ok()?,
        Value::Number(number) => TicketId::parse(&number.to_string()).ok()?,
        _ => return None,
    };
    let customer = text(stored.customer)?;
    if customer.trim().is_empty() {
        return None;
    }

    let mut record = TicketRecord::new(id, customer, text(stored.message).unwrap_or_default());
    record.urgency = stored.urgency.and_then(urgency).unwrap_or_default();
    if matches!(record.urgency, Urgency::Unclassified | Urgency::Unknown) {
        record.confidence = Confidence::ZERO;
    } else {
        record.confidence = stored.confidence.and_then(confidence).unwrap_or_default();
    }
    record.annotation = stored.annotation.and_then(|value| value.as_bool());
    Some(record)
}

fn text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text),
        _ => None,
    }
}

fn urgency(value: Value) -> Option<Urgency> {
    let Value::String(label) = value else {
        return None;
    };
    let normalized = label.trim().to_ascii_lowercase();
    if normalized == "not determined" {
        return Some(Urgency::Unclassified);
    }
    Urgency::parse(&normalized)
}

/// Accepts a bare percentage number or a legacy `"91.5%"` string.
fn confidence(value: Value) -> Option<Confidence> {
    match value {
        Value::Number(number) => number.as_f64().and_then(Confidence::from_percent),
        Value::String(text) => {
            let trimmed = text.trim();
            let number = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
            number.parse::<f64>().ok().and_then(Confidence::from_percent)
        }
        _ => None,
    }
}
