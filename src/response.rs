use crate::types::Headers;
use bytes::Bytes;

/// One response: `:status` leads the header list, trailers are kept apart
/// from the main header block.
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: usize,
    pub headers: Headers,
    pub body: Bytes,
    pub trailers: Headers,
}

impl Response {
    /// Builds a response for sending: `:status` is prepended and the given
    /// headers are normalized for the wire.
    pub fn new(status: u16, headers: Headers, body: impl Into<Bytes>) -> Self {
        let mut full_headers = vec![(":status".to_owned(), status.to_string())];
        full_headers.extend(headers.into_iter().filter_map(|(name, value)| {
            let name = name.to_ascii_lowercase();
            match name.as_str() {
                "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding"
                | "upgrade" => None,
                _ => Some((name, value)),
            }
        }));
        Self {
            request_id: 0,
            headers: full_headers,
            body: body.into(),
            trailers: Headers::new(),
        }
    }

    pub fn header(&self, key: impl AsRef<str>) -> Option<&str> {
        let key = key.as_ref();
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_ref())
    }

    pub fn status(&self) -> u16 {
        self.header(":status")
            .expect("no status in response")
            .parse()
            .expect("non-number status")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_leads_the_header_list() {
        let response = Response::new(404, vec![("server".to_owned(), "h2".to_owned())], "");
        assert_eq!(response.headers[0].0, ":status");
        assert_eq!(response.status(), 404);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let response = Response::new(200, vec![("location".to_owned(), "/next".to_owned())], "");
        assert_eq!(response.header("Location"), Some("/next"));
    }

    #[test]
    fn connection_specific_headers_are_stripped() {
        let response = Response::new(
            200,
            vec![
                ("Connection".to_owned(), "close".to_owned()),
                ("Content-Type".to_owned(), "text/plain".to_owned()),
            ],
            "ok",
        );
        assert!(response.header("connection").is_none());
        assert_eq!(response.header("content-type"), Some("text/plain"));
    }
}
