use md5::{Digest, Md5};
use serde_json::Value;

use crate::error::{DumpError, Result};

/// Parsed form of an inventory response, single-server or cluster.
pub struct Inventory {
    pub collections: Vec<Value>,
    pub views: Vec<Value>,
    /// The server's tick at snapshot time, echoed into `dump.json`.
    pub tick: String,
    pub properties: Option<Value>,
}

impl Inventory {
    pub fn parse(body: &Value) -> Result<Inventory> {
        if !body.is_object() {
            return Err(DumpError::malformed("inventory is not an object"));
        }
        let collections = body
            .get("collections")
            .and_then(Value::as_array)
            .ok_or_else(|| DumpError::malformed("inventory carries no collections array"))?
            .clone();
        let views = body
            .get("views")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let tick = body
            .get("tick")
            .and_then(Value::as_str)
            .ok_or_else(|| DumpError::malformed("inventory carries no tick value"))?
            .to_string();
        let properties = body.get("properties").filter(|p| p.is_object()).cloned();
        Ok(Inventory {
            collections,
            views,
            tick,
            properties,
        })
    }
}

/// The `parameters` object of a collection descriptor.
pub fn collection_parameters(collection: &Value) -> Result<&Value> {
    collection
        .get("parameters")
        .filter(|p| p.is_object())
        .ok_or_else(|| DumpError::malformed("collection descriptor has no parameters"))
}

/// Numeric id of a collection; accepts both string and integer encodings.
pub fn collection_id(parameters: &Value) -> u64 {
    let slot = parameters.get("id").or_else(|| parameters.get("cid"));
    match slot {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        _ => 0,
    }
}

pub fn md5_hex(name: &str) -> String {
    hex::encode(Md5::digest(name.as_bytes()))
}

/// Whether a name can be used as-is in a filename on any supported
/// filesystem.
pub fn is_filesystem_safe(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn id_or_random(parameters: &Value, keys: &[&str]) -> String {
    for key in keys {
        match parameters.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return s.clone(),
            Some(Value::Number(n)) => {
                if let Some(id) = n.as_u64() {
                    return id.to_string();
                }
            }
            _ => {}
        }
    }
    rand::random::<u64>().to_string()
}

/// Name to use in data/structure filenames. Names with special characters are
/// replaced by the collection's numeric id (or a random value as last
/// resort), so the dump never produces hostile filenames.
pub fn escaped_collection_name(name: &str, parameters: &Value) -> String {
    if is_filesystem_safe(name) {
        return name.to_string();
    }
    // "cid" vs "id" presence differs between cluster and single server
    id_or_random(parameters, &["cid", "id"])
}

pub fn escaped_view_name(name: &str, view: &Value) -> String {
    if is_filesystem_safe(name) {
        return name.to_string();
    }
    id_or_random(view, &["id"])
}

/// Directory name for a database: its name when filesystem-safe, else its id.
pub fn database_dir_name<'a>(name: &'a str, id: &'a str) -> &'a str {
    if is_filesystem_safe(name) {
        name
    } else {
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_inventory() {
        let body = json!({
            "collections": [],
            "views": [{"name": "v"}],
            "tick": "12345",
            "properties": {"id": "1"},
        });
        let inv = Inventory::parse(&body).unwrap();
        assert!(inv.collections.is_empty());
        assert_eq!(inv.views.len(), 1);
        assert_eq!(inv.tick, "12345");
        assert!(inv.properties.is_some());
    }

    #[test]
    fn missing_tick_is_malformed() {
        let body = json!({"collections": []});
        assert!(Inventory::parse(&body).is_err());
    }

    #[test]
    fn filesystem_safety() {
        assert!(is_filesystem_safe("users"));
        assert!(is_filesystem_safe("_apps"));
        assert!(is_filesystem_safe("Users-2_x"));
        assert!(!is_filesystem_safe(""));
        assert!(!is_filesystem_safe("a/b"));
        assert!(!is_filesystem_safe("über"));
        assert!(!is_filesystem_safe("a b"));
    }

    #[test]
    fn escaping_prefers_name_then_cid_then_id() {
        let params = json!({"cid": "9007", "id": "1234"});
        assert_eq!(escaped_collection_name("plain", &params), "plain");
        assert_eq!(escaped_collection_name("a/b", &params), "9007");

        let params = json!({"id": 1234});
        assert_eq!(escaped_collection_name("a/b", &params), "1234");
    }

    #[test]
    fn escaping_falls_back_to_random() {
        let params = json!({});
        let escaped = escaped_collection_name("a/b", &params);
        assert!(escaped.parse::<u64>().is_ok());
    }

    #[test]
    fn collection_id_accepts_both_encodings() {
        assert_eq!(collection_id(&json!({"id": "77"})), 77);
        assert_eq!(collection_id(&json!({"id": 77})), 77);
        assert_eq!(collection_id(&json!({"cid": "11"})), 11);
        assert_eq!(collection_id(&json!({})), 0);
    }

    #[test]
    fn database_dir_name_uses_id_for_unsafe_names() {
        assert_eq!(database_dir_name("mydb", "42"), "mydb");
        assert_eq!(database_dir_name("my db", "42"), "42");
    }

    #[test]
    fn md5_matches_known_digest() {
        // md5("users")
        assert_eq!(md5_hex("users"), "9bc65c2abec141778ffaa729489f3e87");
    }
}
