//! Session keys and request parameters
//!
//! A session key identifies one (path, parameter set) combination. Requests
//! that normalize to the same key share a single transcoder process.

use std::collections::BTreeMap;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;

use super::error::RequestError;

/// Name of the query parameter carrying the base64-encoded source locator
pub const LOCATOR_PARAM: &str = "url";

const PADDING_INDIFFERENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);

const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, PADDING_INDIFFERENT);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, PADDING_INDIFFERENT);

/// Canonical identifier of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(String);

impl SessionKey {
    /// Derive a key from a request path and its parameters
    ///
    /// Parameter names are sorted ascending, parameters whose value is empty
    /// after trimming are dropped, and the remaining `name=value` pairs are
    /// joined with `&`. The pair string is appended after `?` only when it
    /// is non-empty.
    pub fn derive(path: &str, params: &RequestParams) -> Self {
        let pairs = params
            .iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("&");

        if pairs.is_empty() {
            Self(path.to_string())
        } else {
            Self(format!("{}?{}", path, pairs))
        }
    }

    /// Get the key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decoded query parameters of a subscriber request, ordered by name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams {
    params: BTreeMap<String, String>,
}

impl RequestParams {
    /// Create an empty parameter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an `application/x-www-form-urlencoded` query string
    ///
    /// When a name repeats, the first value wins.
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::new();
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params.insert(name.into_owned(), value.into_owned());
        }
        params
    }

    /// Insert a parameter unless the name is already present
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.entry(name.into()).or_insert_with(|| value.into());
    }

    /// Get a parameter value by name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Iterate over parameters in ascending name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of parameters, including empty-valued ones
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Check if there are no parameters
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Extract and decode the source locator
    ///
    /// An absent or blank locator parameter is [`RequestError::MissingLocator`].
    pub fn locator(&self) -> Result<String, RequestError> {
        let encoded = self
            .get(LOCATOR_PARAM)
            .filter(|v| !v.trim().is_empty())
            .ok_or(RequestError::MissingLocator)?;
        decode_locator(encoded)
    }

    /// Parameters forwarded to the transcoder (everything but the locator)
    pub fn options(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().filter(|(name, _)| *name != LOCATOR_PARAM)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RequestParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}

/// Decode a base64 source locator
///
/// Accepts the standard and URL-safe alphabets with or without padding.
/// Form decoding turns `+` into a space, so spaces are read back as `+`.
pub fn decode_locator(encoded: &str) -> Result<String, RequestError> {
    let normalized: String = encoded
        .chars()
        .map(|c| if c == ' ' { '+' } else { c })
        .collect();
    let normalized = normalized.trim();

    let bytes = STANDARD_LENIENT
        .decode(normalized)
        .or_else(|_| URL_SAFE_LENIENT.decode(normalized))
        .map_err(|e| RequestError::LocatorDecode(e.to_string()))?;

    let locator =
        String::from_utf8(bytes).map_err(|e| RequestError::LocatorDecode(e.to_string()))?;

    if locator.trim().is_empty() {
        return Err(RequestError::LocatorDecode("empty locator".into()));
    }

    Ok(locator)
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};

    use super::*;

    #[test]
    fn test_key_sorts_parameters() {
        let a = RequestParams::from_query("url=abc&b=2&a=1");
        let b = RequestParams::from_query("a=1&url=abc&b=2");

        assert_eq!(SessionKey::derive("/proxy", &a), SessionKey::derive("/proxy", &b));
        assert_eq!(SessionKey::derive("/proxy", &a).as_str(), "/proxy?a=1&b=2&url=abc");
    }

    #[test]
    fn test_key_drops_blank_values() {
        let params = RequestParams::from_query("a=&b=%20%20&c=3");
        assert_eq!(SessionKey::derive("/proxy", &params).as_str(), "/proxy?c=3");
    }

    #[test]
    fn test_key_without_parameters_is_path() {
        let params = RequestParams::from_query("a=&b=");
        assert_eq!(SessionKey::derive("/proxy", &params).as_str(), "/proxy");
        assert_eq!(SessionKey::derive("/proxy", &RequestParams::new()).as_str(), "/proxy");
    }

    #[test]
    fn test_key_differs_by_locator() {
        let first = RequestParams::from_query("url=AAAA&a=1");
        let second = RequestParams::from_query("url=BBBB&a=1");
        assert_ne!(
            SessionKey::derive("/proxy", &first),
            SessionKey::derive("/proxy", &second)
        );
    }

    #[test]
    fn test_repeated_name_keeps_first_value() {
        let params = RequestParams::from_query("a=1&a=2");
        assert_eq!(params.get("a"), Some("1"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_decode_standard_base64() {
        let encoded = STANDARD.encode("rtsp://camera.local:554/stream1");
        let params = RequestParams::from_iter([("url", encoded)]);
        assert_eq!(params.locator().unwrap(), "rtsp://camera.local:554/stream1");
    }

    #[test]
    fn test_decode_url_safe_unpadded() {
        let encoded = URL_SAFE_NO_PAD.encode("rtsp://h/?a=b~~");
        assert_eq!(decode_locator(&encoded).unwrap(), "rtsp://h/?a=b~~");
    }

    #[test]
    fn test_decode_restores_plus_from_form_decoding() {
        // "rtsp://x/>>>" has a '+' in its standard encoding
        let encoded = STANDARD.encode("rtsp://x/>>>");
        assert!(encoded.contains('+'));

        let query = format!("url={}", encoded);
        let params = RequestParams::from_query(&query);
        assert_eq!(params.locator().unwrap(), "rtsp://x/>>>");
    }

    #[test]
    fn test_decode_keeps_trailing_plus() {
        let params = RequestParams::from_query("url=cnRzcDovL3gvPj4+&-r=25");
        assert_eq!(params.locator().unwrap(), "rtsp://x/>>>");

        assert_eq!(decode_locator("cnRzcDovL3gvPj4 ").unwrap(), "rtsp://x/>>>");
        assert_eq!(decode_locator("cnRzcDovL3gvPj4+\n").unwrap(), "rtsp://x/>>>");
    }

    #[test]
    fn test_missing_locator() {
        let params = RequestParams::from_query("a=1");
        assert!(matches!(params.locator(), Err(RequestError::MissingLocator)));

        let blank = RequestParams::from_query("url=&a=1");
        assert!(matches!(blank.locator(), Err(RequestError::MissingLocator)));
    }

    #[test]
    fn test_undecodable_locator() {
        let params = RequestParams::from_query("url=%%%not-base64!!");
        assert!(matches!(params.locator(), Err(RequestError::LocatorDecode(_))));
    }

    #[test]
    fn test_non_utf8_locator() {
        let encoded = STANDARD.encode([0xff, 0xfe, 0xfd]);
        assert!(matches!(
            decode_locator(&encoded),
            Err(RequestError::LocatorDecode(_))
        ));
    }

    #[test]
    fn test_options_exclude_locator() {
        let params = RequestParams::from_query("url=abc&-b:v=800k&-r=25");
        let options: Vec<_> = params.options().collect();
        assert_eq!(options, vec![("-b:v", "800k"), ("-r", "25")]);
    }
}
