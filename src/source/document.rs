use bson::{Bson, Document};
use serde_json::{Map, Value};

use super::{SourceError, SourceResult};

/// Stringify a document identifier: hex for intrinsic ids, display form for
/// everything else. The engine keys documents by string only.
pub fn stringify_id(value: &Bson) -> String {
    match value {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        Bson::Double(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Stringify the configured id field and normalize it onto `_id`.
///
/// Returns the string id. A document without the field is not routable and
/// is rejected.
pub fn normalize_document_id(doc: &mut Document, id_field: &str) -> SourceResult<String> {
    let value = doc
        .get(id_field)
        .ok_or_else(|| SourceError::MissingField(id_field.to_string()))?;

    let id = stringify_id(value);
    doc.insert(id_field, Bson::String(id.clone()));
    if id_field != "_id" {
        doc.insert("_id", Bson::String(id.clone()));
    }
    Ok(id)
}

/// Convert a BSON document into the plain JSON map the engine indexes.
///
/// Intrinsic ids become hex strings and datetimes become RFC 3339 strings so
/// the stored source round-trips through the search response unchanged.
pub fn bson_to_json(doc: &Document) -> Map<String, Value> {
    let mut map = Map::with_capacity(doc.len());
    for (key, value) in doc {
        map.insert(key.clone(), bson_value_to_json(value));
    }
    map
}

fn bson_value_to_json(value: &Bson) -> Value {
    match value {
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(dt.to_chrono().to_rfc3339()),
        Bson::String(s) => Value::String(s.clone()),
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(n) => Value::Number((*n).into()),
        Bson::Int64(n) => Value::Number((*n).into()),
        Bson::Double(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::Array(items) => Value::Array(items.iter().map(bson_value_to_json).collect()),
        Bson::Document(nested) => Value::Object(bson_to_json(nested)),
        Bson::Null => Value::Null,
        Bson::Decimal128(d) => Value::String(d.to_string()),
        other => Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::oid::ObjectId;
    use bson::doc;

    #[test]
    fn test_stringify_object_id() {
        let oid = ObjectId::new();
        assert_eq!(stringify_id(&Bson::ObjectId(oid)), oid.to_hex());
    }

    #[test]
    fn test_stringify_scalar_ids() {
        assert_eq!(stringify_id(&Bson::String("k1".to_string())), "k1");
        assert_eq!(stringify_id(&Bson::Int64(42)), "42");
    }

    #[test]
    fn test_normalize_intrinsic_id() {
        let oid = ObjectId::new();
        let mut doc = doc! { "_id": oid, "title": "red fox" };
        let id = normalize_document_id(&mut doc, "_id").unwrap();
        assert_eq!(id, oid.to_hex());
        assert_eq!(doc.get_str("_id").unwrap(), oid.to_hex());
    }

    #[test]
    fn test_normalize_custom_id_field_sets_underscore_id() {
        let mut doc = doc! { "sku": 1001, "title": "blue whale" };
        let id = normalize_document_id(&mut doc, "sku").unwrap();
        assert_eq!(id, "1001");
        assert_eq!(doc.get_str("_id").unwrap(), "1001");
        assert_eq!(doc.get_str("sku").unwrap(), "1001");
    }

    #[test]
    fn test_normalize_missing_field_is_rejected() {
        let mut doc = doc! { "title": "red panda" };
        assert!(normalize_document_id(&mut doc, "sku").is_err());
    }

    #[test]
    fn test_bson_to_json_flattens_special_types() {
        let oid = ObjectId::new();
        let now = chrono::Utc::now();
        let doc = doc! {
            "_id": oid,
            "title": "red fox",
            "count": 3_i64,
            "price": 9.5,
            "active": true,
            "updated_at": bson::DateTime::from_chrono(now),
            "tags": ["a", "b"],
            "nested": { "k": 1_i32 },
        };

        let json = bson_to_json(&doc);
        assert_eq!(json["_id"], Value::String(oid.to_hex()));
        assert_eq!(json["count"], Value::Number(3.into()));
        assert_eq!(json["active"], Value::Bool(true));
        assert!(json["updated_at"].as_str().unwrap().starts_with(&now.format("%Y-%m-%dT").to_string()));
        assert_eq!(json["tags"].as_array().unwrap().len(), 2);
        assert_eq!(json["nested"]["k"], Value::Number(1.into()));
    }
}
