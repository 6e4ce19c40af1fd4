use crate::types::{H2Error, Headers};
use bytes::Bytes;
use log::debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

static REQUEST_ID: AtomicUsize = AtomicUsize::new(1);

/// Hop-by-hop headers that must never appear on an HTTP/2 request.
const CONNECTION_SPECIFIC: [&str; 5] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone, derive_more::Display)]
pub enum Method {
    #[display(fmt = "GET")]
    Get,
    #[display(fmt = "POST")]
    Post,
    #[display(fmt = "PUT")]
    Put,
    #[display(fmt = "DELETE")]
    Delete,
    #[display(fmt = "HEAD")]
    Head,
    #[display(fmt = "PATCH")]
    Patch,
    #[display(fmt = "OPTIONS")]
    Options,
    #[display(fmt = "{}", _0)]
    Other(String),
}

impl From<&str> for Method {
    fn from(method: &str) -> Self {
        match method {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "PATCH" => Self::Patch,
            "OPTIONS" => Self::Options,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// One request. The pseudo-header fields derived from the URL lead `headers`;
/// caller-supplied fields follow.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: usize,
    pub url: Url,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, url: Url, headers: Option<Headers>, body: impl Into<Bytes>) -> Self {
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_owned(),
        };
        let mut full_headers = vec![
            (":method".to_owned(), method.to_string()),
            (":scheme".to_owned(), url.scheme().to_owned()),
            (":path".to_owned(), path),
            (
                ":authority".to_owned(),
                if let Some(port) = url.port() {
                    format!("{}:{}", url.host_str().expect("URL cannot be a base"), port)
                } else {
                    url.host_str().expect("URL cannot be a base").to_owned()
                },
            ),
        ];
        if let Some(headers) = headers {
            full_headers.extend(headers);
        }
        Self {
            id: REQUEST_ID.fetch_add(1, Ordering::SeqCst),
            url,
            headers: full_headers,
            body: body.into(),
        }
    }

    #[inline]
    pub fn get(url: Url, headers: Option<Headers>) -> Self {
        Self::new(Method::Get, url, headers, Bytes::new())
    }

    #[inline]
    pub fn post(url: Url, headers: Option<Headers>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::Post, url, headers, body)
    }

    #[cfg(feature = "json")]
    pub fn post_json<T: serde::Serialize>(url: Url, payload: &T) -> serde_json::Result<Self> {
        let body = serde_json::to_vec(payload)?;
        Ok(Self::new(
            Method::Post,
            url,
            Some(vec![(
                "content-type".to_owned(),
                "application/json".to_owned(),
            )]),
            body,
        ))
    }

    pub fn header(&self, key: impl AsRef<str>) -> Option<&str> {
        let key = key.as_ref();
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_ref())
    }

    pub fn method(&self) -> &str {
        self.header(":method").unwrap_or("GET")
    }

    pub fn path(&self) -> &str {
        self.header(":path").unwrap_or("/")
    }

    /// Builds the follow-up request a 3xx response asks for, against the
    /// resolved Location. 303 downgrades to GET; 307/308 keep the body.
    pub fn redirect(&self, response: &crate::response::Response) -> Option<Self> {
        let status = response.status();
        if !(300..400).contains(&status) {
            return None;
        }
        let target = self.url.join(response.header("location")?).ok()?;
        let method = if status == 303 {
            Method::Get
        } else {
            Method::from(self.method())
        };
        let body = if matches!(status, 307 | 308) {
            self.body.clone()
        } else {
            Bytes::new()
        };
        let extra: Headers = self
            .headers
            .iter()
            .filter(|(name, _)| !name.starts_with(':'))
            .cloned()
            .collect();
        Some(Self::new(method, target, Some(extra), body))
    }

    /// The header list as it goes on the wire: pseudo-header fields first,
    /// names lowercased, `host` folded into `:authority`, connection-specific
    /// fields dropped.
    pub(crate) fn field_lines(&self) -> Result<Headers, H2Error> {
        let mut pseudo = Headers::new();
        let mut regular = Headers::new();
        let mut host = None;
        for (name, value) in &self.headers {
            let name = name.to_ascii_lowercase();
            if name.starts_with(':') {
                pseudo.push((name, value.clone()));
            } else if name == "host" {
                host = Some(value.clone());
            } else if CONNECTION_SPECIFIC.contains(&name.as_str()) {
                debug!("dropping connection-specific header {}", name);
            } else {
                regular.push((name, value.clone()));
            }
        }
        if let Some(host) = host {
            match pseudo.iter_mut().find(|(name, _)| name == ":authority") {
                Some((_, authority)) => *authority = host,
                None => pseudo.push((":authority".to_owned(), host)),
            }
        }
        for required in [":method", ":scheme", ":path"] {
            if !pseudo.iter().any(|(name, _)| name == required) {
                return Err(H2Error::InvalidRequest(format!("{} is missing", required)));
            }
        }
        pseudo.extend(regular);
        Ok(pseudo)
    }

    /// Inverse of `field_lines`: reassembles a request from a decoded header
    /// list, as a server sees it.
    pub(crate) fn from_field_lines(fields: Headers, body: Bytes) -> Result<Self, H2Error> {
        let mut method = None;
        let mut scheme = None;
        let mut authority = None;
        let mut path = None;
        let mut regular = Headers::new();
        for (name, value) in fields {
            match name.as_str() {
                ":method" => method = Some(value),
                ":scheme" => scheme = Some(value),
                ":authority" => authority = Some(value),
                ":path" => path = Some(value),
                _ => regular.push((name, value)),
            }
        }
        let method =
            method.ok_or_else(|| H2Error::InvalidRequest(":method is missing".to_owned()))?;
        let path = path.ok_or_else(|| H2Error::InvalidRequest(":path is missing".to_owned()))?;
        let scheme = scheme.unwrap_or_else(|| "https".to_owned());
        let authority = authority
            .or_else(|| {
                regular
                    .iter()
                    .find(|(name, _)| name == "host")
                    .map(|(_, value)| value.clone())
            })
            .ok_or_else(|| H2Error::InvalidRequest(":authority is missing".to_owned()))?;
        let url = Url::parse(&format!("{}://{}{}", scheme, authority, path))
            .map_err(|err| H2Error::InvalidRequest(err.to_string()))?;
        let mut headers = vec![
            (":method".to_owned(), method),
            (":scheme".to_owned(), scheme),
            (":path".to_owned(), path),
            (":authority".to_owned(), authority),
        ];
        headers.extend(regular);
        Ok(Self {
            id: REQUEST_ID.fetch_add(1, Ordering::SeqCst),
            url,
            headers,
            body,
        })
    }
}
