//! Upload event normalization
//!
//! Turns raw storage-notification object keys into `NormalizedEvent`s the
//! dispatch coordinator can act on. Pure parsing, no I/O.
//!
//! Key layouts accepted:
//! - `{owner}/{model}_{name}.ext` — single-view session named `name`
//! - `{owner}/{session}/{model}_{view}.ext` — one of four camera views

use crate::models::{MediaKind, SessionKey, View};
use percent_encoding::percent_decode_str;
use serde::Serialize;
use thiserror::Error;

/// Video extensions accepted for upload objects
const VIDEO_EXTENSIONS: [&str; 8] = ["mp4", "avi", "mov", "mkv", "wmv", "flv", "webm", "m4v"];
/// Image extensions accepted for upload objects
const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp"];

/// A storage event reduced to what orchestration needs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEvent {
    pub owner_id: String,
    pub session_id: String,
    pub model_name: String,
    pub view: View,
    /// Percent-decoded object key
    pub object_key: String,
    pub media_kind: MediaKind,
}

impl NormalizedEvent {
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.owner_id.clone(), self.session_id.clone())
    }
}

/// Notification payloads that cannot be mapped to a session
///
/// Malformed events are logged and dropped; they never mutate session
/// state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MalformedEvent {
    #[error("object key is not valid percent-encoded UTF-8: {0}")]
    BadEncoding(String),

    #[error("expected 2 or 3 key segments, got {0}")]
    SegmentCount(usize),

    #[error("object key contains an empty segment")]
    EmptySegment,

    #[error("filename {0:?} has no model_view separator")]
    MissingSeparator(String),

    #[error("unrecognized view token {0:?}")]
    UnknownView(String),

    #[error("unsupported media extension {0:?}")]
    UnsupportedExtension(String),
}

/// Classify an object key by its extension
pub fn media_kind_for_key(key: &str) -> Result<MediaKind, MalformedEvent> {
    let ext = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Ok(MediaKind::Video)
    } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Ok(MediaKind::Image)
    } else {
        Err(MalformedEvent::UnsupportedExtension(ext))
    }
}

/// Parse a storage object key into a normalized event
///
/// Keys arrive percent-encoded from the storage notifier and are decoded
/// before splitting.
pub fn parse_object_key(key: &str) -> Result<NormalizedEvent, MalformedEvent> {
    let decoded = percent_decode_str(key)
        .decode_utf8()
        .map_err(|e| MalformedEvent::BadEncoding(e.to_string()))?
        .into_owned();

    let segments: Vec<&str> = decoded.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(MalformedEvent::EmptySegment);
    }

    match segments.as_slice() {
        [owner, filename] => {
            let media_kind = media_kind_for_key(filename)?;
            let (model_name, session_id) = split_filename(filename)?;
            Ok(NormalizedEvent {
                owner_id: owner.to_string(),
                session_id,
                model_name,
                view: View::Single,
                object_key: decoded.clone(),
                media_kind,
            })
        }
        [owner, session, filename] => {
            let media_kind = media_kind_for_key(filename)?;
            let (model_name, view_token) = split_filename(filename)?;
            let view = view_token
                .parse::<View>()
                .ok()
                .filter(|v| *v != View::Single)
                .ok_or(MalformedEvent::UnknownView(view_token))?;
            Ok(NormalizedEvent {
                owner_id: owner.to_string(),
                session_id: session.to_string(),
                model_name,
                view,
                object_key: decoded.clone(),
                media_kind,
            })
        }
        other => Err(MalformedEvent::SegmentCount(other.len())),
    }
}

/// Split `{model}_{rest}.ext` into (model, rest), stripping the extension.
/// The split is on the first underscore; `rest` may itself contain more.
fn split_filename(filename: &str) -> Result<(String, String), MalformedEvent> {
    let base = filename
        .rsplit_once('.')
        .map(|(base, _)| base)
        .unwrap_or(filename);

    match base.split_once('_') {
        Some((model, rest)) if !model.is_empty() && !rest.is_empty() => {
            Ok((model.to_string(), rest.to_string()))
        }
        _ => Err(MalformedEvent::MissingSeparator(filename.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_view_key() {
        let event = parse_object_key("u1/cx_morning-check.mp4").unwrap();
        assert_eq!(event.owner_id, "u1");
        assert_eq!(event.session_id, "morning-check");
        assert_eq!(event.model_name, "cx");
        assert_eq!(event.view, View::Single);
        assert_eq!(event.media_kind, MediaKind::Video);
        assert_eq!(event.object_key, "u1/cx_morning-check.mp4");
    }

    #[test]
    fn parses_multi_view_key() {
        let event = parse_object_key("u1/s1/cx_front.mp4").unwrap();
        assert_eq!(event.owner_id, "u1");
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.model_name, "cx");
        assert_eq!(event.view, View::Front);
    }

    #[test]
    fn single_view_session_name_keeps_later_underscores() {
        let event = parse_object_key("u1/gy_desk_setup_a.jpg").unwrap();
        assert_eq!(event.model_name, "gy");
        assert_eq!(event.session_id, "desk_setup_a");
        assert_eq!(event.media_kind, MediaKind::Image);
    }

    #[test]
    fn decodes_percent_encoded_keys() {
        let event = parse_object_key("u1/s%201/cx_left.mp4").unwrap();
        assert_eq!(event.session_id, "s 1");
        assert_eq!(event.object_key, "u1/s 1/cx_left.mp4");
    }

    #[test]
    fn rejects_unknown_view_token() {
        let err = parse_object_key("u1/s1/cx_top.mp4").unwrap_err();
        assert_eq!(err, MalformedEvent::UnknownView("top".to_string()));
    }

    #[test]
    fn rejects_single_as_explicit_multi_view_token() {
        let err = parse_object_key("u1/s1/cx_single.mp4").unwrap_err();
        assert_eq!(err, MalformedEvent::UnknownView("single".to_string()));
    }

    #[test]
    fn rejects_wrong_segment_counts() {
        assert_eq!(
            parse_object_key("cx_front.mp4").unwrap_err(),
            MalformedEvent::SegmentCount(1)
        );
        assert_eq!(
            parse_object_key("a/b/c/cx_front.mp4").unwrap_err(),
            MalformedEvent::SegmentCount(4)
        );
    }

    #[test]
    fn rejects_empty_segments() {
        assert_eq!(
            parse_object_key("u1//cx_front.mp4").unwrap_err(),
            MalformedEvent::EmptySegment
        );
    }

    #[test]
    fn rejects_missing_separator() {
        assert_eq!(
            parse_object_key("u1/s1/front.mp4").unwrap_err(),
            MalformedEvent::MissingSeparator("front.mp4".to_string())
        );
    }

    #[test]
    fn rejects_unsupported_extension() {
        assert_eq!(
            parse_object_key("u1/s1/cx_front.txt").unwrap_err(),
            MalformedEvent::UnsupportedExtension("txt".to_string())
        );
        assert_eq!(
            parse_object_key("u1/s1/cx_front").unwrap_err(),
            MalformedEvent::UnsupportedExtension(String::new())
        );
    }

    #[test]
    fn extension_classes_cover_original_sets() {
        for ext in ["mp4", "avi", "mov", "mkv", "wmv", "flv", "webm", "m4v"] {
            assert_eq!(
                media_kind_for_key(&format!("cx_front.{ext}")).unwrap(),
                MediaKind::Video
            );
        }
        for ext in ["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp"] {
            assert_eq!(
                media_kind_for_key(&format!("cx_front.{ext}")).unwrap(),
                MediaKind::Image
            );
        }
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        assert_eq!(
            media_kind_for_key("cx_front.MP4").unwrap(),
            MediaKind::Video
        );
    }
}
