use serde_json::{Map, Value};

/// Replacement for the value of every sensitive parameter.
pub const FILTERED: &str = "[FILTERED]";

/// Redacts request parameters whose key contains one of the configured
/// names (ASCII case-insensitive). Nested objects and arrays are walked.
#[derive(Debug, Clone, Default)]
pub struct ParameterFilter {
    needles: Vec<String>,
}

impl ParameterFilter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let needles = names
            .into_iter()
            .map(|n| n.as_ref().trim().to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        Self { needles }
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.needles.iter().any(|n| key.contains(n.as_str()))
    }

    pub fn filter_map(&self, params: &Map<String, Value>) -> Map<String, Value> {
        params
            .iter()
            .map(|(k, v)| {
                let v = if self.is_sensitive(k) {
                    Value::String(FILTERED.to_owned())
                } else {
                    self.filter_value(v)
                };
                (k.clone(), v)
            })
            .collect()
    }

    pub fn filter_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.filter_map(map)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.filter_value(v)).collect()),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter() -> ParameterFilter {
        ParameterFilter::new(["password", "social_security_number"])
    }

    #[test]
    fn redacts_sensitive_keys() {
        let Value::Object(params) = json!({
            "social_security_number": "001-555-1212",
            "number": "001-555-1212",
        }) else {
            unreachable!()
        };
        let out = filter().filter_map(&params);
        assert_eq!(out["social_security_number"], FILTERED);
        assert_eq!(out["number"], "001-555-1212");
    }

    #[test]
    fn matching_is_case_insensitive_and_by_substring() {
        let f = filter();
        assert!(f.is_sensitive("user_PASSWORD_confirmation"));
        assert!(!f.is_sensitive("username"));
    }

    #[test]
    fn walks_nested_values() {
        let nested = json!({"user": {"password": "hunter2", "name": "x"}, "list": [{"password": 1}]});
        let out = filter().filter_value(&nested);
        assert_eq!(out["user"]["password"], FILTERED);
        assert_eq!(out["user"]["name"], "x");
        assert_eq!(out["list"][0]["password"], FILTERED);
    }

    #[test]
    fn non_string_sensitive_values_are_replaced_too() {
        let nested = json!({"social_security_number": {"a": 1}});
        let out = filter().filter_value(&nested);
        assert_eq!(out["social_security_number"], FILTERED);
    }
}
