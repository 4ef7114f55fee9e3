use serde::Serialize;
use serde_json::Value;

use oplogtail_types::{LogEntry, LogPosition, OperationKind, PresentationEntry};

/// Map a raw operation code to its kind
pub fn classify(code: &str) -> OperationKind {
    match code {
        "i" => OperationKind::Insert,
        "u" => OperationKind::Update,
        "d" => OperationKind::Delete,
        "n" => OperationKind::Noop,
        other => OperationKind::Other(other.to_string()),
    }
}

/// Build the human-oriented view of an entry
pub fn present(entry: &LogEntry) -> PresentationEntry {
    PresentationEntry {
        namespace: entry.namespace.clone(),
        operation: classify(&entry.op),
        operation_id: entry.operation_id.clone(),
        timestamp: entry.position.timestamp(),
        ts: entry.position,
        target_id: entry.target_id().cloned(),
        criteria: entry.criteria.clone(),
        data: entry.document.clone(),
    }
}

/// Entry as delivered to listeners, raw or presentation-shaped
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OplogPayload {
    Raw(LogEntry),
    Pretty(PresentationEntry),
}

impl OplogPayload {
    pub fn new(entry: LogEntry, pretty: bool) -> Self {
        if pretty {
            Self::Pretty(present(&entry))
        } else {
            Self::Raw(entry)
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Self::Raw(entry) => &entry.namespace,
            Self::Pretty(entry) => &entry.namespace,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Raw(entry) => classify(&entry.op),
            Self::Pretty(entry) => entry.operation.clone(),
        }
    }

    pub fn position(&self) -> LogPosition {
        match self {
            Self::Raw(entry) => entry.position,
            Self::Pretty(entry) => entry.ts,
        }
    }

    /// Operation document (`o` / `data`)
    pub fn document(&self) -> Option<&Value> {
        match self {
            Self::Raw(entry) => entry.document.as_ref(),
            Self::Pretty(entry) => entry.data.as_ref(),
        }
    }

    pub fn target_id(&self) -> Option<&Value> {
        match self {
            Self::Raw(entry) => entry.target_id(),
            Self::Pretty(entry) => entry.target_id.as_ref(),
        }
    }

    pub fn as_raw(&self) -> Option<&LogEntry> {
        match self {
            Self::Raw(entry) => Some(entry),
            Self::Pretty(_) => None,
        }
    }

    pub fn as_pretty(&self) -> Option<&PresentationEntry> {
        match self {
            Self::Pretty(entry) => Some(entry),
            Self::Raw(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update_entry() -> LogEntry {
        LogEntry::new(LogPosition::new(1_700_000_000, 3), "u", "optest.c")
            .with_operation_id(json!(42))
            .with_document(json!({"$set": {"n": "US"}}))
            .with_criteria(json!({"_id": "abc"}))
    }

    #[test]
    fn test_classify_codes() {
        assert_eq!(classify("i"), OperationKind::Insert);
        assert_eq!(classify("u"), OperationKind::Update);
        assert_eq!(classify("d"), OperationKind::Delete);
        assert_eq!(classify("n"), OperationKind::Noop);
        assert_eq!(classify("c"), OperationKind::Other("c".to_string()));
        assert_eq!(classify(""), OperationKind::Other(String::new()));
    }

    #[test]
    fn test_present_update() {
        let view = present(&update_entry());
        assert_eq!(view.namespace, "optest.c");
        assert_eq!(view.operation, OperationKind::Update);
        assert_eq!(view.operation_id, Some(json!(42)));
        assert_eq!(view.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(view.ts, LogPosition::new(1_700_000_000, 3));
        assert_eq!(view.target_id, Some(json!("abc")));
        assert_eq!(view.criteria, Some(json!({"_id": "abc"})));
        assert_eq!(view.data, Some(json!({"$set": {"n": "US"}})));
    }

    #[test]
    fn test_present_omits_absent_fields() {
        let entry = LogEntry::new(LogPosition::new(5, 1), "n", "");
        let value = serde_json::to_value(present(&entry)).unwrap();
        assert_eq!(value["operation"], "noop");
        assert!(value.get("targetId").is_none());
        assert!(value.get("criteria").is_none());
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_payload_accessors() {
        let raw = OplogPayload::new(update_entry(), false);
        let pretty = OplogPayload::new(update_entry(), true);

        for payload in [&raw, &pretty] {
            assert_eq!(payload.namespace(), "optest.c");
            assert_eq!(payload.kind(), OperationKind::Update);
            assert_eq!(payload.position(), LogPosition::new(1_700_000_000, 3));
            assert_eq!(payload.target_id(), Some(&json!("abc")));
            assert_eq!(payload.document(), Some(&json!({"$set": {"n": "US"}})));
        }
        assert!(raw.as_raw().is_some() && raw.as_pretty().is_none());
        assert!(pretty.as_pretty().is_some() && pretty.as_raw().is_none());
    }

    #[test]
    fn test_raw_payload_keeps_wire_names() {
        let value = serde_json::to_value(OplogPayload::new(update_entry(), false)).unwrap();
        assert_eq!(value["op"], "u");
        assert_eq!(value["ns"], "optest.c");
        assert_eq!(value["o2"]["_id"], "abc");
    }
}
