use serde_json::Value;
use sha2::{Digest, Sha256};

/// Request payload exactly as the client sent it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestBody {
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl RequestBody {
    pub fn new(content_type: Option<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self { content_type, bytes: bytes.into() }
    }

    pub fn json(value: &Value) -> Self {
        Self::new(Some("application/json".to_string()), value.to_string())
    }

    pub fn is_json(&self) -> bool {
        match &self.content_type {
            Some(content_type) => content_type.to_ascii_lowercase().contains("json"),
            None => true,
        }
    }

    /// Parsed payload, only for JSON (or untyped) bodies that actually parse.
    pub fn as_json(&self) -> Option<Value> {
        if !self.is_json() {
            return None;
        }
        serde_json::from_slice(&self.bytes).ok()
    }
}

/// What the origin fetcher needs to issue a call: method, path, query, and an optional body.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestDescriptor {
    pub method: String,
    pub path: String,
    /// Query pairs in arrival order. Repeated keys are kept.
    pub query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
}

impl RequestDescriptor {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_body(self, body: Value) -> Self {
        self.with_raw_body(RequestBody::json(&body))
    }

    pub fn with_raw_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn has_query(&self, key: &str) -> bool {
        self.query.iter().any(|(name, _)| name == key)
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.iter().find(|(name, _)| name == key).map(|(_, value)| value.as_str())
    }

    /// Stable key for this request: `METHOD path#<sha256>`.
    ///
    /// Query pairs are sorted by key (values of a repeated key keep their order) and every
    /// key and value is length-prefixed, so no value can imitate a pair separator. JSON bodies
    /// are hashed with sorted object keys; anything else is hashed as raw bytes together with
    /// its content type.
    pub fn fingerprint(&self) -> String {
        let method = self.method.to_ascii_uppercase();
        let mut hasher = Sha256::new();
        write_field(&mut hasher, method.as_bytes());
        write_field(&mut hasher, self.path.as_bytes());

        let mut pairs: Vec<&(String, String)> = self.query.iter().collect();
        pairs.sort_by(|left, right| left.0.cmp(&right.0));
        hasher.update(pairs.len().to_string().as_bytes());
        hasher.update(b"\n");
        for (key, value) in pairs {
            write_field(&mut hasher, key.as_bytes());
            write_field(&mut hasher, value.as_bytes());
        }

        match &self.body {
            None => hasher.update(b"none"),
            Some(body) => match body.as_json() {
                Some(value) => {
                    let mut canonical = String::new();
                    write_canonical_json(&value, &mut canonical);
                    hasher.update(b"json");
                    write_field(&mut hasher, canonical.as_bytes());
                }
                None => {
                    hasher.update(b"raw");
                    write_field(&mut hasher, body.content_type.as_deref().unwrap_or("").as_bytes());
                    write_field(&mut hasher, &body.bytes);
                }
            },
        }

        format!("{} {}#{:x}", method, self.path, hasher.finalize())
    }

    pub fn is_read(&self) -> bool {
        matches!(self.method.to_ascii_uppercase().as_str(), "GET" | "HEAD")
    }
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update(bytes.len().to_string().as_bytes());
    hasher.update(b":");
    hasher.update(bytes);
}

fn write_canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|left, right| left.0.cmp(right.0));
            out.push('{');
            for (index, (key, nested)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical_json(nested, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{RequestBody, RequestDescriptor};

    #[test]
    fn query_order_does_not_change_the_key() {
        let left = RequestDescriptor::new("get", "/api/crm/contacts")
            .with_query("page", "2")
            .with_query("owner", "ana");
        let right = RequestDescriptor::new("GET", "/api/crm/contacts")
            .with_query("owner", "ana")
            .with_query("page", "2");

        assert_eq!(left.fingerprint(), right.fingerprint());
        assert!(left.fingerprint().starts_with("GET /api/crm/contacts#"));
    }

    #[test]
    fn separator_characters_inside_values_do_not_collide() {
        let smuggled = RequestDescriptor::new("GET", "/api/crm/contacts").with_query("a", "1&b=2");
        let split = RequestDescriptor::new("GET", "/api/crm/contacts")
            .with_query("a", "1")
            .with_query("b", "2");
        let long_key = RequestDescriptor::new("GET", "/api/crm/contacts").with_query("a=1", "");
        let long_value = RequestDescriptor::new("GET", "/api/crm/contacts").with_query("a", "1=");

        assert_ne!(smuggled.fingerprint(), split.fingerprint());
        assert_ne!(long_key.fingerprint(), long_value.fingerprint());
    }

    #[test]
    fn repeated_query_keys_are_all_kept() {
        let one = RequestDescriptor::new("GET", "/api/crm/contacts").with_query("tag", "a");
        let two = one.clone().with_query("tag", "b");
        let swapped = RequestDescriptor::new("GET", "/api/crm/contacts")
            .with_query("tag", "b")
            .with_query("tag", "a");

        assert_eq!(two.query.len(), 2);
        assert_eq!(two.query_value("tag"), Some("a"));
        assert_ne!(one.fingerprint(), two.fingerprint());
        assert_ne!(two.fingerprint(), swapped.fingerprint());
    }

    #[test]
    fn body_key_order_does_not_change_the_key() {
        let left = RequestDescriptor::new("POST", "/api/llm/complete")
            .with_body(json!({"model": "m1", "input": {"b": 1, "a": [1, 2]}}));
        let right = RequestDescriptor::new("POST", "/api/llm/complete")
            .with_body(json!({"input": {"a": [1, 2], "b": 1}, "model": "m1"}));

        assert_eq!(left.fingerprint(), right.fingerprint());
    }

    #[test]
    fn different_payloads_produce_different_keys() {
        let base = RequestDescriptor::new("POST", "/api/llm/complete");
        let one = base.clone().with_body(json!({"prompt": "a"}));
        let two = base.clone().with_body(json!({"prompt": "b"}));
        let query = base.with_query("prompt", "a");

        assert_ne!(one.fingerprint(), two.fingerprint());
        assert_ne!(one.fingerprint(), query.fingerprint());
    }

    #[test]
    fn non_json_bodies_hash_raw_bytes_and_content_type() {
        let form = RequestBody::new(
            Some("application/x-www-form-urlencoded".to_string()),
            "name=ana&tags=a",
        );
        let text = RequestBody::new(Some("text/plain".to_string()), "name=ana&tags=a");
        let base = RequestDescriptor::new("POST", "/api/crm/contacts");

        assert_eq!(form.as_json(), None);
        assert_ne!(
            base.clone().with_raw_body(form.clone()).fingerprint(),
            base.clone().with_raw_body(text).fingerprint()
        );
        assert_eq!(
            base.clone().with_raw_body(form.clone()).fingerprint(),
            base.with_raw_body(form).fingerprint()
        );
    }

    #[test]
    fn json_typed_body_that_does_not_parse_is_hashed_raw() {
        let broken = RequestBody::new(Some("application/json".to_string()), "{not json");

        assert_eq!(broken.as_json(), None);
        let key = RequestDescriptor::new("POST", "/api/llm/complete").with_raw_body(broken);
        assert!(key.fingerprint().starts_with("POST /api/llm/complete#"));
    }
}
