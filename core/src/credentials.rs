use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::error::{CoreError, CoreResult};

/// Authentication material attached to every request a task makes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub basic_auth: Option<(String, String)>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.cookies.is_empty() && self.basic_auth.is_none()
    }
}

pub trait CredentialProvider: Send + Sync {
    /// `Ok(None)` means the source exists but holds nothing for us.
    fn get_credentials(&self, source_tag: &str) -> CoreResult<Option<Credentials>>;
}

#[derive(Debug, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn get_credentials(&self, _source_tag: &str) -> CoreResult<Option<Credentials>> {
        Ok(None)
    }
}

/// Fixed credentials keyed by source tag. Unknown tags are unavailable sources.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    sources: HashMap<String, Credentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, tag: impl Into<String>, credentials: Credentials) -> Self {
        self.sources.insert(tag.into(), credentials);
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn get_credentials(&self, source_tag: &str) -> CoreResult<Option<Credentials>> {
        match self.sources.get(source_tag) {
            Some(credentials) if credentials.is_empty() => Ok(None),
            Some(credentials) => Ok(Some(credentials.clone())),
            None => Err(CoreError::CredentialsUnavailable {
                source_tag: source_tag.to_string(),
                detail: "unknown credential source".to_string(),
            }),
        }
    }
}

/// Reads cookies from Netscape `cookies.txt` exports, one file per source tag.
#[derive(Debug, Default, Clone)]
pub struct CookieFileProvider {
    files: HashMap<String, PathBuf>,
}

impl CookieFileProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, tag: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.insert(tag.into(), path.into());
        self
    }
}

impl CredentialProvider for CookieFileProvider {
    fn get_credentials(&self, source_tag: &str) -> CoreResult<Option<Credentials>> {
        let path = self
            .files
            .get(source_tag)
            .ok_or_else(|| CoreError::CredentialsUnavailable {
                source_tag: source_tag.to_string(),
                detail: "no cookie file registered".to_string(),
            })?;
        let content = fs::read_to_string(path).map_err(|err| CoreError::CredentialsUnavailable {
            source_tag: source_tag.to_string(),
            detail: format!("{}: {}", path.display(), err),
        })?;
        let cookies = parse_cookie_file(&content);
        if cookies.is_empty() {
            return Ok(None);
        }
        Ok(Some(Credentials {
            cookies,
            ..Credentials::default()
        }))
    }
}

fn parse_cookie_file(content: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for line in content.lines() {
        // `#HttpOnly_` prefixed lines are real cookies, other `#` lines are comments.
        let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 {
            continue;
        }
        let name = fields[5].trim();
        if !name.is_empty() {
            cookies.insert(name.to_string(), fields[6].trim().to_string());
        }
    }
    cookies
}
