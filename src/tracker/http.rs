//! HTTP(S) tracker announce.
use super::{
    parse_compact_peers, url_encode, AnnounceParams, AnnounceResponse, TrackerError, TrackerResult,
};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_bytes::ByteBuf;
use tracing::debug;
use url::Url;

/// Sends one GET announce and parses the bencoded response.
///
/// The numeric parameters go through normal query building; `info_hash`
/// and `peer_id` are appended pre-encoded so the 20 raw bytes reach the
/// tracker percent-encoded byte-for-byte instead of being reinterpreted as
/// UTF-8. Anything but status 200 is an error.
#[tracing::instrument(skip(params), level = "debug")]
pub async fn announce(base: &Url, params: &AnnounceParams) -> TrackerResult<AnnounceResponse> {
    let request_url = build_announce_url(base, params);
    debug!(url = %request_url, "announcing to HTTP tracker");
    let response = reqwest::get(&request_url).await?;
    if response.status() != StatusCode::OK {
        return Err(TrackerError::HttpStatus(response.status().as_u16()));
    }
    let body = response.bytes().await?;
    parse_response(&body)
}

fn build_announce_url(base: &Url, params: &AnnounceParams) -> String {
    let mut url = base.clone();
    url.query_pairs_mut()
        .append_pair("port", &params.port.to_string())
        .append_pair("uploaded", &params.uploaded.to_string())
        .append_pair("downloaded", &params.downloaded.to_string())
        .append_pair("left", &params.left.to_string())
        .append_pair("compact", "1");
    format!(
        "{}&info_hash={}&peer_id={}",
        url,
        url_encode(&params.info_hash),
        url_encode(&params.peer_id)
    )
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    /// Trackers report protocol-level refusals inside a 200 body.
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<u32>,
    #[serde(default)]
    peers: Option<ByteBuf>,
}

pub(crate) fn parse_response(body: &[u8]) -> TrackerResult<AnnounceResponse> {
    let raw: RawResponse = serde_bencode::from_bytes(body)?;
    if let Some(reason) = raw.failure_reason {
        return Err(TrackerError::Failure(reason));
    }
    let blob = raw
        .peers
        .ok_or(TrackerError::MissingRequiredProperty("peers"))?;
    let peers = parse_compact_peers(&blob)?;
    Ok(AnnounceResponse {
        interval_secs: raw.interval.unwrap_or(0),
        peers,
    })
}
