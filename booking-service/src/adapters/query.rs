/// Query string split into `key=value` pairs without percent-decoding.
///
/// The redirect gateway signs the encoded form, and decoding (`+` to space
/// in particular) would change the bytes the signature covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawQuery {
    pairs: Vec<(String, String)>,
}

impl RawQuery {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim().trim_start_matches('?');
        let pairs = raw
            .split('&')
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (part.to_string(), String::new()),
            })
            .collect();
        Self { pairs }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Raw value of the first occurrence of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Form-decoded value of `key`, for reading fields after verification.
    pub fn decoded(&self, key: &str) -> Option<String> {
        let raw = self.get(key)?.replace('+', " ");
        urlencoding::decode(&raw).ok().map(|v| v.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_encoded_bytes() {
        let query = RawQuery::parse("?vnp_OrderInfo=Thanh+toan%20don&vnp_Amount=20000000");
        assert_eq!(query.get("vnp_OrderInfo"), Some("Thanh+toan%20don"));
        assert_eq!(query.decoded("vnp_OrderInfo").as_deref(), Some("Thanh toan don"));
        assert_eq!(query.get("vnp_Amount"), Some("20000000"));
    }

    #[test]
    fn preserves_arrival_order_and_bare_keys() {
        let query = RawQuery::parse("b=2&flag&a=1&&");
        let keys: Vec<&str> = query.pairs().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "flag", "a"]);
        assert_eq!(query.get("flag"), Some(""));
    }

    #[test]
    fn empty_input() {
        assert!(RawQuery::parse("").is_empty());
        assert!(RawQuery::parse("?").is_empty());
    }
}
