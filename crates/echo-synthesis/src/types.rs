//! Synthesis request and response types.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use echo_models::{JobId, SynthesisPayload, VIDEO_CONTENT_TYPE};

use crate::error::{SynthesisError, SynthesisResult};

/// Request sent to the synthesis service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisRequest {
    /// Job the render belongs to; repeated calls for one job carry the same id
    pub job_id: String,
    pub recipient_identity: String,
    pub text: String,
    #[serde(rename = "audioReferenceID")]
    pub audio_reference_id: String,
    #[serde(rename = "videoAvatarReferenceID")]
    pub video_avatar_reference_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_text: Option<String>,
}

impl SynthesisRequest {
    pub fn for_job(job_id: &JobId, payload: &SynthesisPayload) -> Self {
        Self {
            job_id: job_id.to_string(),
            recipient_identity: payload.recipient_identity.clone(),
            text: payload.text.clone(),
            audio_reference_id: payload.audio_reference_id.clone(),
            video_avatar_reference_id: payload.video_avatar_reference_id.clone(),
            audio_text: payload.audio_text.clone(),
        }
    }
}

/// A rendered video returned by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedVideo {
    pub content_type: String,
    pub bytes: Bytes,
}

impl SynthesizedVideo {
    pub fn new(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// JSON form of a video response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct VideoPayloadResponse {
    /// `data:<type>;base64,<payload>`
    #[serde(default)]
    pub video: Option<String>,
    #[serde(default)]
    pub video_base64: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl VideoPayloadResponse {
    pub fn into_video(self) -> SynthesisResult<SynthesizedVideo> {
        if let Some(data_url) = self.video {
            return decode_data_url(&data_url);
        }
        if let Some(encoded) = self.video_base64 {
            let bytes = STANDARD
                .decode(encoded.trim())
                .map_err(|e| SynthesisError::invalid_response(format!("bad base64: {}", e)))?;
            let content_type = self
                .content_type
                .unwrap_or_else(|| VIDEO_CONTENT_TYPE.to_string());
            return Ok(SynthesizedVideo::new(content_type, bytes));
        }
        Err(SynthesisError::invalid_response(
            "JSON response carries no video",
        ))
    }
}

/// Decode a `data:` URL into its media type and bytes.
pub fn decode_data_url(data_url: &str) -> SynthesisResult<SynthesizedVideo> {
    let rest = data_url
        .strip_prefix("data:")
        .ok_or_else(|| SynthesisError::invalid_response("video is not a data URL"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| SynthesisError::invalid_response("data URL has no payload"))?;
    let content_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| SynthesisError::invalid_response("data URL is not base64"))?;
    let content_type = if content_type.is_empty() {
        VIDEO_CONTENT_TYPE
    } else {
        content_type
    };

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| SynthesisError::invalid_response(format!("bad base64: {}", e)))?;
    Ok(SynthesizedVideo::new(content_type, bytes))
}

/// Encode bytes as a `data:` URL.
pub fn encode_data_url(content_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", content_type, STANDARD.encode(bytes))
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HealthResponse {
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_boundary_field_names() {
        let payload = SynthesisPayload::new("u1", "hello", "a1", "v1").with_audio_text("hello");
        let request = SynthesisRequest::for_job(&JobId::from("j1"), &payload);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["jobId"], "j1");
        assert_eq!(json["recipientIdentity"], "u1");
        assert_eq!(json["audioReferenceID"], "a1");
        assert_eq!(json["videoAvatarReferenceID"], "v1");
        assert_eq!(json["audioText"], "hello");
    }

    #[test]
    fn data_url_decodes() {
        let url = encode_data_url("video/mp4", b"\x00\x01video");
        let video = decode_data_url(&url).unwrap();
        assert_eq!(video.content_type, "video/mp4");
        assert_eq!(&video.bytes[..], b"\x00\x01video");
    }

    #[test]
    fn malformed_data_urls_are_invalid() {
        for bad in ["video/mp4;base64,AAAA", "data:video/mp4,AAAA", "data:video/mp4;base64", "data:;base64,***"] {
            assert!(
                matches!(decode_data_url(bad), Err(SynthesisError::InvalidResponse(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn json_payload_prefers_data_url() {
        let response: VideoPayloadResponse = serde_json::from_str(&format!(
            r#"{{"video":"{}"}}"#,
            encode_data_url("video/webm", b"abc")
        ))
        .unwrap();
        let video = response.into_video().unwrap();
        assert_eq!(video.content_type, "video/webm");
        assert_eq!(&video.bytes[..], b"abc");

        let response: VideoPayloadResponse =
            serde_json::from_str(r#"{"video_base64":"YWJj"}"#).unwrap();
        let video = response.into_video().unwrap();
        assert_eq!(video.content_type, VIDEO_CONTENT_TYPE);
        assert_eq!(&video.bytes[..], b"abc");

        let response: VideoPayloadResponse = serde_json::from_str("{}").unwrap();
        assert!(response.into_video().is_err());
    }
}
