//! Display capture for screen-share surfaces.
//!
//! Capturing the screen is platform work the hosting surface does; the peer
//! layer only needs a video track to put on the wire and a signal telling it
//! when the capture stream has ended. [`DisplaySource`] is that seam.

use crate::error::{Error, Result};
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::info;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// A live display capture: the outgoing track plus its "ended" flag.
pub struct CapturedDisplay {
    track: Arc<TrackLocalStaticSample>,
    ended: Arc<watch::Sender<bool>>,
}

impl CapturedDisplay {
    pub fn track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    pub fn track_id(&self) -> &str {
        self.track.id()
    }

    /// Resolves to `true` once the capture stream has ended.
    pub fn ended_signal(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Stops the capture from the consuming side.
    pub fn release(&self) {
        if !self.ended.send_replace(true) {
            info!(track = %self.track.id(), "display capture released");
        }
    }
}

#[async_trait]
pub trait DisplaySource: Send + Sync {
    /// Requests a display capture. Fails with [`Error::MediaAccess`] when the
    /// capture is denied or no display is available.
    async fn capture(&self) -> Result<CapturedDisplay>;
}

/// Producer half handed to the host: encoded frames go in, `end` stops it.
pub struct DisplayFeed {
    track: Arc<TrackLocalStaticSample>,
    ended: Arc<watch::Sender<bool>>,
}

impl DisplayFeed {
    /// Writes one encoded VP8 frame.
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<()> {
        if self.is_ended() {
            return Err(Error::MediaAccess("display capture has ended".into()));
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::MediaAccess(format!("write sample failed: {e}")))
    }

    pub fn track_id(&self) -> &str {
        self.track.id()
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Ends the capture stream (the user stopped sharing).
    pub fn end(&self) {
        self.ended.send_replace(true);
    }
}

impl Drop for DisplayFeed {
    fn drop(&mut self) {
        self.end();
    }
}

/// Display source fed by the host with already-encoded VP8 frames.
///
/// Every successful capture sends a [`DisplayFeed`] to the receiver returned
/// by [`SampleDisplaySource::new`].
pub struct SampleDisplaySource {
    feeds: Option<mpsc::UnboundedSender<DisplayFeed>>,
}

impl SampleDisplaySource {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DisplayFeed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { feeds: Some(tx) }, rx)
    }

    /// A source whose captures are always refused.
    pub fn denied() -> Self {
        Self { feeds: None }
    }
}

#[async_trait]
impl DisplaySource for SampleDisplaySource {
    async fn capture(&self) -> Result<CapturedDisplay> {
        let feeds = self
            .feeds
            .as_ref()
            .ok_or_else(|| Error::MediaAccess("display capture permission denied".into()))?;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            format!("screen-{}", random_id()),
            "screen-share".to_owned(),
        ));
        let (ended, _) = watch::channel(false);
        let ended = Arc::new(ended);

        feeds
            .send(DisplayFeed {
                track: track.clone(),
                ended: ended.clone(),
            })
            .map_err(|_| Error::MediaAccess("no host is consuming the capture".into()))?;

        Ok(CapturedDisplay { track, ended })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denied_source_reports_media_access() {
        let source = SampleDisplaySource::denied();
        assert!(matches!(source.capture().await, Err(Error::MediaAccess(_))));
    }

    #[tokio::test]
    async fn capture_without_host_is_refused() {
        let (source, feeds) = SampleDisplaySource::new();
        drop(feeds);
        assert!(matches!(source.capture().await, Err(Error::MediaAccess(_))));
    }

    #[tokio::test]
    async fn ending_the_feed_ends_the_capture() {
        let (source, mut feeds) = SampleDisplaySource::new();
        let capture = source.capture().await.unwrap();
        let feed = feeds.recv().await.unwrap();
        let mut ended = capture.ended_signal();

        assert!(!capture.is_ended());
        assert_eq!(capture.track().kind(), webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Video);

        drop(feed);
        ended.changed().await.unwrap();
        assert!(*ended.borrow());
        assert!(capture.is_ended());
    }

    #[tokio::test]
    async fn released_capture_rejects_frames() {
        let (source, mut feeds) = SampleDisplaySource::new();
        let capture = source.capture().await.unwrap();
        let feed = feeds.recv().await.unwrap();

        capture.release();
        capture.release();
        assert!(feed.is_ended());
        let res = feed
            .write_frame(Bytes::from_static(&[0u8; 4]), Duration::from_millis(33))
            .await;
        assert!(matches!(res, Err(Error::MediaAccess(_))));
    }
}
