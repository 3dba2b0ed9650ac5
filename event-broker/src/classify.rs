use serde_json::Value;
use tracing::trace;

const CLASS_FIELD: &str = "class";
const EVENT_FIELD: &str = "event";
const SINGLE: &str = "single";
const HISTORY_REQUEST: &str = "historyRequest";

/// Result of inspecting one inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// A publish. `message` is the whole parsed object, whose `event` is never `null`.
    Single { message: Value },
    HistoryRequest,
    /// Anything else, including text that is not JSON at all.
    Unclassified,
}

/// Tags a raw text payload by its `class` field.
///
/// Parse failures and unknown classes both yield [`Classified::Unclassified`];
/// nothing here reports an error back to the caller.
pub fn classify(raw: &str) -> Classified {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(error) => {
            trace!(%error, "discarding payload that is not valid json");
            return Classified::Unclassified;
        }
    };
    classify_value(value)
}

fn classify_value(value: Value) -> Classified {
    let Value::Object(fields) = value else {
        return Classified::Unclassified;
    };

    match fields.get(CLASS_FIELD).and_then(Value::as_str) {
        Some(SINGLE) => {}
        Some(HISTORY_REQUEST) => return Classified::HistoryRequest,
        _ => return Classified::Unclassified,
    }
    if matches!(fields.get(EVENT_FIELD), None | Some(Value::Null)) {
        return Classified::Unclassified;
    }
    Classified::Single {
        message: Value::Object(fields),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn single_with_event_is_classified() {
        let classified = classify(r#"{"class":"single","event":{"name":"hello"}}"#);
        assert_eq!(
            classified,
            Classified::Single {
                message: json!({ "class": "single", "event": { "name": "hello" } })
            }
        );
    }

    #[test]
    fn single_keeps_extra_fields() {
        let classified = classify(r#"{"class":"single","event":1,"origin":"sensor-4"}"#);
        assert_eq!(
            classified,
            Classified::Single {
                message: json!({ "class": "single", "event": 1, "origin": "sensor-4" })
            }
        );
    }

    #[test]
    fn scalar_events_are_opaque_but_valid() {
        assert_eq!(
            classify(r#"{"class":"single","event":false}"#),
            Classified::Single {
                message: json!({ "class": "single", "event": false })
            }
        );
        assert_eq!(
            classify(r#"{"class":"single","event":0}"#),
            Classified::Single {
                message: json!({ "class": "single", "event": 0 })
            }
        );
    }

    #[test]
    fn single_without_event_is_dropped() {
        assert_eq!(classify(r#"{"class":"single"}"#), Classified::Unclassified);
        assert_eq!(
            classify(r#"{"class":"single","event":null}"#),
            Classified::Unclassified
        );
    }

    #[test]
    fn history_request_ignores_extra_fields() {
        assert_eq!(
            classify(r#"{"class":"historyRequest"}"#),
            Classified::HistoryRequest
        );
        assert_eq!(
            classify(r#"{"class":"historyRequest","from":3}"#),
            Classified::HistoryRequest
        );
    }

    #[test]
    fn unknown_shapes_are_unclassified() {
        for raw in [
            r#"{"foo":"bar"}"#,
            r#"{"class":"historyResponse","events":[]}"#,
            r#"{"class":7,"event":{}}"#,
            r#"{"class":"SINGLE","event":{}}"#,
            r#"["single"]"#,
            r#""historyRequest""#,
            "null",
        ] {
            assert_eq!(classify(raw), Classified::Unclassified, "payload: {raw}");
        }
    }

    #[test]
    fn malformed_text_is_unclassified() {
        assert_eq!(classify("not json"), Classified::Unclassified);
        assert_eq!(classify(r#"{"class":"single","event":"#), Classified::Unclassified);
        assert_eq!(classify(""), Classified::Unclassified);
    }
}
