use std::collections::HashMap;

/// Parse query parameters from a URI string
///
/// Handles URL decoding and returns a HashMap of parameter key-value pairs.
/// Multiple values for the same key are not supported (only the last is kept).
///
/// # Example
/// ```
/// use murmur::core::query_params::parse_query_params;
///
/// let params = parse_query_params("/login?next=%2Fuser%2Fbob&x=1");
/// assert_eq!(params.get("next"), Some(&"/user/bob".to_string()));
/// assert_eq!(params.get("x"), Some(&"1".to_string()));
/// ```
pub fn parse_query_params(uri: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    if let Some(query_start) = uri.find('?') {
        let query = &uri[query_start + 1..];
        for param in query.split('&').filter(|p| !p.is_empty()) {
            if let Some(eq_idx) = param.find('=') {
                let key = &param[..eq_idx];
                let encoded_value = param[eq_idx + 1..].replace('+', " ");
                let decoded = urlencoding::decode(&encoded_value)
                    .map(|v| v.into_owned())
                    .unwrap_or(encoded_value);
                params.insert(key.to_string(), decoded);
            } else {
                // Flag parameter without value
                params.insert(param.to_string(), String::new());
            }
        }
    }

    params
}

/// Get a non-empty string parameter from parsed query params
pub fn get_string(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params.get(key).filter(|s| !s.is_empty()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_and_missing_query() {
        assert!(parse_query_params("/index").is_empty());

        let params = parse_query_params("/login?debug&next=");
        assert_eq!(params.get("debug"), Some(&String::new()));
        assert_eq!(get_string(&params, "next"), None);
    }
}
