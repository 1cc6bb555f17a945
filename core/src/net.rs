use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, RANGE,
};
use reqwest::StatusCode;

use crate::config::EngineConfig;
use crate::credentials::Credentials;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub basic_auth: Option<(String, String)>,
    /// Resume offset; asks for `bytes=<start>-`.
    pub range_start: Option<u64>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            basic_auth: None,
            range_start: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<&Credentials>) -> Self {
        if let Some(credentials) = credentials {
            self.headers = credentials.headers.clone();
            self.cookies = credentials.cookies.clone();
            self.basic_auth = credentials.basic_auth.clone();
        }
        self
    }

    pub fn with_range_start(mut self, start: u64) -> Self {
        if start > 0 {
            self.range_start = Some(start);
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct HeadInfo {
    pub status_code: u16,
    pub total_bytes: Option<u64>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

/// An open response body.
pub struct StreamBody {
    /// Size of the whole resource when known, not just of this body.
    pub total_bytes: Option<u64>,
    /// The server honoured `range_start`, so the body continues an earlier transfer.
    pub resumed: bool,
    pub reader: Box<dyn Read + Send>,
}

pub trait NetClient: Send + Sync {
    fn head(&self, req: &FetchRequest) -> CoreResult<HeadInfo>;
    fn open(&self, req: &FetchRequest) -> CoreResult<StreamBody>;
}

#[derive(Clone)]
pub struct ReqwestNetClient {
    client: Client,
}

impl ReqwestNetClient {
    pub fn new(config: &EngineConfig) -> CoreResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.read_timeout_secs))
            .build()
            .map_err(|err| CoreError::Network(err.to_string()))?;
        Ok(Self { client })
    }

    fn request_headers(&self, req: &FetchRequest) -> CoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (key, value) in &req.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| CoreError::InvalidRequest(err.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| CoreError::InvalidRequest(err.to_string()))?;
            headers.insert(name, value);
        }
        if !req.cookies.is_empty() {
            let cookie_value = req
                .cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<String>>()
                .join("; ");
            headers.insert(
                reqwest::header::COOKIE,
                HeaderValue::from_str(&cookie_value)
                    .map_err(|err| CoreError::InvalidRequest(err.to_string()))?,
            );
        }
        if let Some(start) = req.range_start {
            let value = format!("bytes={}-", start);
            headers.insert(
                RANGE,
                HeaderValue::from_str(&value)
                    .map_err(|err| CoreError::InvalidRequest(err.to_string()))?,
            );
        }
        Ok(headers)
    }
}

impl NetClient for ReqwestNetClient {
    fn head(&self, req: &FetchRequest) -> CoreResult<HeadInfo> {
        let mut request = self.client.head(&req.url).headers(self.request_headers(req)?);
        if let Some((user, pass)) = &req.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }
        let resp = request.send().map_err(map_reqwest_error)?;
        let headers = resp.headers();
        let total_bytes = header_u64(headers, CONTENT_LENGTH);
        let content_type = header_string(headers, CONTENT_TYPE);
        let content_disposition = header_string(headers, CONTENT_DISPOSITION);

        Ok(HeadInfo {
            status_code: resp.status().as_u16(),
            total_bytes,
            content_type,
            content_disposition,
        })
    }

    fn open(&self, req: &FetchRequest) -> CoreResult<StreamBody> {
        let mut request = self.client.get(&req.url).headers(self.request_headers(req)?);
        if let Some((user, pass)) = &req.basic_auth {
            request = request.basic_auth(user, Some(pass));
        }
        let resp = request.send().map_err(map_reqwest_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::from_status(status.as_u16(), &req.url));
        }
        let body_len = header_u64(resp.headers(), CONTENT_LENGTH);
        let resumed = req.range_start.is_some() && status == StatusCode::PARTIAL_CONTENT;
        let total_bytes = if resumed {
            body_len.map(|len| len + req.range_start.unwrap_or(0))
        } else {
            body_len
        };
        Ok(StreamBody {
            total_bytes,
            resumed,
            reader: Box::new(resp),
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> CoreError {
    if err.is_builder() {
        CoreError::InvalidRequest(err.to_string())
    } else {
        CoreError::Network(err.to_string())
    }
}

fn header_u64(headers: &HeaderMap, name: HeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

pub fn is_html_content_type(content_type: Option<&str>) -> bool {
    let Some(value) = content_type else {
        return false;
    };
    let value = value.to_ascii_lowercase();
    value.contains("text/html") || value.contains("application/xhtml")
}
