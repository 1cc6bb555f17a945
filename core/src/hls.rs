use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::Arc;

use m3u8_rs::{MasterPlaylist, MediaPlaylist, Playlist};
use url::Url;

use crate::error::{CoreError, CoreResult};
use crate::net::{FetchRequest, NetClient, StreamBody};

const MAX_PLAYLIST_BYTES: u64 = 4 * 1024 * 1024;

pub fn is_hls_locator(locator: &str) -> bool {
    let path = locator.split(['?', '#']).next().unwrap_or(locator);
    path.to_ascii_lowercase().ends_with(".m3u8")
}

pub fn parse_playlist(content: &[u8]) -> CoreResult<Playlist> {
    match m3u8_rs::parse_playlist(content) {
        Ok((_, playlist)) => Ok(playlist),
        Err(_) => Err(CoreError::Unsupported("failed to parse m3u8 playlist".to_string())),
    }
}

pub fn select_best_variant(master: &MasterPlaylist) -> Option<String> {
    master
        .variants
        .iter()
        .filter(|variant| !variant.is_i_frame)
        .max_by_key(|variant| variant.bandwidth)
        .map(|variant| variant.uri.clone())
}

pub fn segment_urls(media: &MediaPlaylist, base_url: &str) -> Vec<String> {
    media
        .segments
        .iter()
        .map(|segment| join_url(base_url, &segment.uri))
        .collect()
}

fn join_url(base_url: &str, uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return uri.to_string();
    }
    match Url::parse(base_url).and_then(|base| base.join(uri)) {
        Ok(joined) => joined.to_string(),
        Err(_) => uri.to_string(),
    }
}

/// Opens an HLS stream as one continuous body made of its media segments.
///
/// A master playlist is followed to its highest-bandwidth variant. The total
/// size is unknown and the body never resumes.
pub fn open_hls(net: Arc<dyn NetClient>, req: &FetchRequest) -> CoreResult<StreamBody> {
    let mut playlist_url = req.url.clone();
    let mut playlist = parse_playlist(&fetch_playlist(net.as_ref(), req, &playlist_url)?)?;
    if let Playlist::MasterPlaylist(master) = &playlist {
        let variant = select_best_variant(master).ok_or_else(|| {
            CoreError::Unsupported(format!("no playable variant in {}", playlist_url))
        })?;
        playlist_url = join_url(&playlist_url, &variant);
        playlist = parse_playlist(&fetch_playlist(net.as_ref(), req, &playlist_url)?)?;
    }
    let media = match playlist {
        Playlist::MediaPlaylist(media) => media,
        Playlist::MasterPlaylist(_) => {
            return Err(CoreError::Unsupported(format!(
                "nested master playlist at {}",
                playlist_url
            )))
        }
    };
    let segments = segment_urls(&media, &playlist_url);
    if segments.is_empty() {
        return Err(CoreError::NotFound(format!(
            "playlist {} has no segments",
            playlist_url
        )));
    }
    Ok(StreamBody {
        total_bytes: None,
        resumed: false,
        reader: Box::new(HlsReader {
            net,
            template: FetchRequest {
                range_start: None,
                ..req.clone()
            },
            pending: segments.into(),
            current: None,
        }),
    })
}

fn fetch_playlist(net: &dyn NetClient, req: &FetchRequest, url: &str) -> CoreResult<Vec<u8>> {
    let playlist_req = FetchRequest {
        url: url.to_string(),
        range_start: None,
        ..req.clone()
    };
    let body = net.open(&playlist_req)?;
    let mut content = Vec::new();
    body.reader
        .take(MAX_PLAYLIST_BYTES)
        .read_to_end(&mut content)
        .map_err(|err| CoreError::Network(err.to_string()))?;
    Ok(content)
}

struct HlsReader {
    net: Arc<dyn NetClient>,
    template: FetchRequest,
    pending: VecDeque<String>,
    current: Option<Box<dyn Read + Send>>,
}

impl Read for HlsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                let read = reader.read(buf)?;
                if read > 0 {
                    return Ok(read);
                }
                self.current = None;
            }
            let Some(url) = self.pending.pop_front() else {
                return Ok(0);
            };
            let req = FetchRequest {
                url,
                ..self.template.clone()
            };
            // The CoreError rides along as the payload so the fetcher can tell
            // a 404 from a dropped connection.
            let body = self
                .net
                .open(&req)
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
            self.current = Some(body.reader);
        }
    }
}
