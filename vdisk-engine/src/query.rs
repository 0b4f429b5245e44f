//! Dot-path lookups into info documents.

use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

/// Look up `request` (e.g. `"spec.volume.uri"`) in `doc`.
///
/// No request returns the whole document. Otherwise the result is
/// `{<last segment>: <value>}`. Array elements are addressed by index.
pub fn lookup(doc: Value, request: Option<&str>) -> Result<Value> {
    let Some(request) = request.filter(|r| !r.is_empty()) else {
        return Ok(doc);
    };

    let mut current = &doc;
    let mut last = "";
    for segment in request.split('.') {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| EngineError::QueryPathNotFound(request.to_string()))?;
        last = segment;
    }

    let mut out = Map::new();
    out.insert(last.to_string(), current.clone());
    Ok(Value::Object(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({"meta": {"name": "vol", "bindings": {"host1": {"backing": "/a"}}}, "spec": {"fds": [3, 4]}})
    }

    #[test]
    fn test_whole_document_without_request() {
        assert_eq!(lookup(doc(), None).unwrap(), doc());
        assert_eq!(lookup(doc(), Some("")).unwrap(), doc());
    }

    #[test]
    fn test_nested_lookup_keyed_by_last_segment() {
        assert_eq!(lookup(doc(), Some("meta.name")).unwrap(), json!({"name": "vol"}));
        assert_eq!(
            lookup(doc(), Some("meta.bindings.host1.backing")).unwrap(),
            json!({"backing": "/a"})
        );
        assert_eq!(lookup(doc(), Some("spec.fds.1")).unwrap(), json!({"1": 4}));
    }

    #[test]
    fn test_unknown_segment_is_not_found() {
        let err = lookup(doc(), Some("meta.owner")).unwrap_err();
        assert!(matches!(err, EngineError::QueryPathNotFound(_)));
        assert!(lookup(doc(), Some("meta.name.x")).is_err());
    }
}
