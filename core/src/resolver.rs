use std::sync::Arc;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::credentials::Credentials;
use crate::error::{CoreError, CoreResult};
use crate::net::{is_html_content_type, FetchRequest, NetClient};
use crate::task::Quality;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Video track only.
    Video,
    /// Audio track only.
    Audio,
    /// Both tracks in one file.
    Muxed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamVariant {
    pub kind: StreamKind,
    /// Where to fetch it from: a direct media URL or an HLS playlist URL.
    pub locator: String,
    pub height: Option<u32>,
    pub bitrate_kbps: Option<u32>,
    pub declared_size: Option<u64>,
}

impl StreamVariant {
    pub fn new(kind: StreamKind, locator: impl Into<String>) -> Self {
        Self {
            kind,
            locator: locator.into(),
            height: None,
            bitrate_kbps: None,
            declared_size: None,
        }
    }

    pub fn with_height(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }

    pub fn with_bitrate(mut self, kbps: u32) -> Self {
        self.bitrate_kbps = Some(kbps);
        self
    }

    pub fn with_size(mut self, bytes: u64) -> Self {
        self.declared_size = Some(bytes);
        self
    }

    fn rank(&self) -> (u32, u32) {
        (self.height.unwrap_or(0), self.bitrate_kbps.unwrap_or(0))
    }

    fn fits(&self, max_height: Option<u32>) -> bool {
        match (max_height, self.height) {
            (Some(limit), Some(height)) => height <= limit,
            _ => true,
        }
    }
}

/// One downloadable media entry of a post, with every variant the source offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub title: String,
    pub variants: Vec<StreamVariant>,
}

impl MediaDescriptor {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            variants: Vec::new(),
        }
    }

    pub fn with_variant(mut self, variant: StreamVariant) -> Self {
        self.variants.push(variant);
        self
    }
}

/// Maps a post URL to the media it contains.
///
/// Implementations fail with `NotFound`, `Unsupported`, `AuthRequired` or
/// `Network`. Resolution is never retried by the engine.
pub trait MediaResolver: Send + Sync {
    fn resolve(&self, url: &str, credentials: Option<&Credentials>)
        -> CoreResult<Vec<MediaDescriptor>>;
}

/// Video stream and audio stream chosen for one descriptor.
pub type StreamPair = (Option<StreamVariant>, Option<StreamVariant>);

/// Picks streams for a quality tier: best separate video + audio, falling back
/// to the best muxed variant.
pub fn select_streams(descriptor: &MediaDescriptor, quality: Quality) -> CoreResult<StreamPair> {
    let max_height = quality.max_height();
    let best_of = |kind: StreamKind| {
        descriptor
            .variants
            .iter()
            .filter(|variant| variant.kind == kind && variant.fits(max_height))
            .max_by_key(|variant| variant.rank())
            .cloned()
    };
    let best_audio = descriptor
        .variants
        .iter()
        .filter(|variant| variant.kind == StreamKind::Audio)
        .max_by_key(|variant| variant.bitrate_kbps.unwrap_or(0))
        .cloned();

    if !quality.wants_video() {
        if let Some(audio) = best_audio {
            return Ok((None, Some(audio)));
        }
        if let Some(muxed) = best_of(StreamKind::Muxed) {
            return Ok((None, Some(muxed)));
        }
        return Err(CoreError::Unsupported(format!(
            "no audio stream for {}",
            descriptor.title
        )));
    }

    let best_video = best_of(StreamKind::Video);
    let best_muxed = best_of(StreamKind::Muxed);
    match (best_video, best_muxed) {
        (Some(video), muxed) => {
            // A muxed variant taller than the separate video beats video+audio.
            if let Some(muxed) = muxed {
                if muxed.rank() > video.rank() {
                    return Ok((Some(muxed), None));
                }
            }
            Ok((Some(video), best_audio))
        }
        (None, Some(muxed)) => Ok((Some(muxed), None)),
        (None, None) => Err(CoreError::Unsupported(format!(
            "no video stream for {} at quality {}",
            descriptor.title, quality
        ))),
    }
}

/// Treats the URL itself as a single muxed media file.
pub struct DirectResolver {
    net: Arc<dyn NetClient>,
}

impl DirectResolver {
    pub fn new(net: Arc<dyn NetClient>) -> Self {
        Self { net }
    }
}

impl MediaResolver for DirectResolver {
    fn resolve(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> CoreResult<Vec<MediaDescriptor>> {
        let req = FetchRequest::new(url).with_credentials(credentials);
        let head = self.net.head(&req)?;
        let mut declared_size = None;
        let mut title = None;
        match head.status_code {
            200..=299 => {
                if is_html_content_type(head.content_type.as_deref()) {
                    return Err(CoreError::Unsupported(format!(
                        "{} is a web page, not a media file",
                        url
                    )));
                }
                declared_size = head.total_bytes.filter(|size| *size > 0);
                title = filename_from_content_disposition(head.content_disposition.as_deref());
            }
            // Some CDNs refuse HEAD; the GET will tell us the rest.
            405 | 501 => {}
            status => return Err(CoreError::from_status(status, url)),
        }
        let title = title
            .or_else(|| filename_from_url(url))
            .map(|name| strip_extension(&name))
            .unwrap_or_else(|| "video".to_string());
        let mut variant = StreamVariant::new(StreamKind::Muxed, url);
        variant.declared_size = declared_size;
        Ok(vec![MediaDescriptor::new(title).with_variant(variant)])
    }
}

fn filename_from_content_disposition(value: Option<&str>) -> Option<String> {
    let value = value?;
    let mut filename_star: Option<String> = None;
    let mut filename: Option<String> = None;

    for part in value.split(';') {
        let part = part.trim();
        let lower = part.to_ascii_lowercase();
        if lower.starts_with("filename*=") {
            let raw = part.splitn(2, '=').nth(1)?.trim().trim_matches('"');
            let raw = raw.find("''").map(|idx| &raw[idx + 2..]).unwrap_or(raw);
            let decoded = percent_decode(raw);
            if !decoded.is_empty() {
                filename_star = Some(decoded);
            }
        } else if lower.starts_with("filename=") {
            let raw = part.splitn(2, '=').nth(1)?.trim().trim_matches('"');
            if !raw.is_empty() {
                filename = Some(raw.to_string());
            }
        }
    }

    filename_star.or(filename)
}

fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let name = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    Some(percent_decode(name))
}

fn percent_decode(value: &str) -> String {
    url::form_urlencoded::parse(format!("x={}", value.replace('&', "%26")).as_bytes())
        .next()
        .map(|(_, decoded)| decoded.into_owned())
        .unwrap_or_else(|| value.to_string())
}

fn strip_extension(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() <= 5 => stem.to_string(),
        _ => name.to_string(),
    }
}
