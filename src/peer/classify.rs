//! Best-effort camera / screen classification of inbound tracks
//!
//! An explicit marker (a stream id announced with `screen-share-started`)
//! always wins. Without one, track and stream ids are sniffed for the
//! conventions browsers and this crate use for display capture, and a
//! receive-only video transceiver next to an already-known camera stream is
//! taken as a screen share.

use serde::{Deserialize, Serialize};

use super::transport::{RemoteTrackInfo, TransceiverDirection};
use crate::media::MediaKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteTrackKind {
    Camera,
    Microphone,
    Screen,
    ScreenAudio,
}

impl RemoteTrackKind {
    pub fn is_screen(self) -> bool {
        matches!(self, RemoteTrackKind::Screen | RemoteTrackKind::ScreenAudio)
    }
}

const SCREEN_HINTS: &[&str] = &["screen", "display", "window", "desktop", "monitor", "tab:"];

fn looks_like_screen(id: &str) -> bool {
    let id = id.to_ascii_lowercase();
    SCREEN_HINTS.iter().any(|hint| id.contains(hint))
}

/// What the classifier knows about the remote side besides the track itself
#[derive(Debug, Default, Clone, Copy)]
pub struct ClassifyContext<'a> {
    /// Stream ids the remote explicitly announced as screen shares
    pub announced_screen_streams: &'a [String],
    /// Stream id of the remote camera, once one has been seen
    pub camera_stream: Option<&'a str>,
}

pub fn classify_remote_track(info: &RemoteTrackInfo, ctx: ClassifyContext<'_>) -> RemoteTrackKind {
    let screen = |kind: MediaKind| match kind {
        MediaKind::Video => RemoteTrackKind::Screen,
        MediaKind::Audio => RemoteTrackKind::ScreenAudio,
    };

    if ctx
        .announced_screen_streams
        .iter()
        .any(|s| s == &info.stream_id)
    {
        return screen(info.kind);
    }

    if looks_like_screen(&info.track_id) || looks_like_screen(&info.stream_id) {
        return screen(info.kind);
    }

    // Camera-like ids are trusted before the directionality fallback
    let camera_hint = |id: &str| {
        let id = id.to_ascii_lowercase();
        id.contains("camera") || id.contains("microphone") || id.starts_with("user-")
    };
    if camera_hint(&info.track_id) || camera_hint(&info.stream_id) {
        return match info.kind {
            MediaKind::Video => RemoteTrackKind::Camera,
            MediaKind::Audio => RemoteTrackKind::Microphone,
        };
    }

    match info.kind {
        MediaKind::Audio => RemoteTrackKind::Microphone,
        MediaKind::Video => {
            let send_only_remote = info.direction == TransceiverDirection::RecvOnly;
            let second_stream = ctx
                .camera_stream
                .is_some_and(|camera| camera != info.stream_id);
            if send_only_remote && second_stream {
                RemoteTrackKind::Screen
            } else {
                RemoteTrackKind::Camera
            }
        }
    }
}
