//! Pre-recorded media played to each connected caller.
//!
//! [`FileMediaSource`] looks for `<base>.ivf` (VP8) and `<base>.ogg` (Opus).
//! A missing file just disables that track. Samples are only written once
//! [`MediaAttachment::start`] is called, which the session does on reaching
//! connectivity; dropping the attachment stops every pump.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::media::io::ivf_reader::{IVFFileHeader, IVFReader};
use webrtc::media::io::ogg_reader::OggReader;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const STREAM_ID: &str = "buoy";
const OGG_PAGE_DURATION: Duration = Duration::from_millis(20);
const OPUS_SAMPLE_RATE: u64 = 48_000;
const NO_GRANULE: u64 = u64::MAX;
const READ_AHEAD: usize = 16;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media io failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unreadable container {path}: {reason}")]
    Container { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Clone)]
pub struct MediaTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
}

impl MediaTrack {
    pub fn new(kind: MediaKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self { kind, track }
    }

    pub fn video() -> Self {
        Self::with_codec(MediaKind::Video, MIME_TYPE_VP8, 90_000, 0)
    }

    pub fn audio() -> Self {
        Self::with_codec(MediaKind::Audio, MIME_TYPE_OPUS, 48_000, 2)
    }

    fn with_codec(kind: MediaKind, mime_type: &str, clock_rate: u32, channels: u16) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_string(),
                clock_rate,
                channels,
                ..Default::default()
            },
            kind.to_string(),
            STREAM_ID.to_string(),
        ));
        Self { kind, track }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack").field("kind", &self.kind).finish()
    }
}

enum Pump {
    Video {
        reader: IVFReader<BufReader<File>>,
        header: IVFFileHeader,
        track: Arc<TrackLocalStaticSample>,
    },
    Audio {
        reader: OggReader<BufReader<File>>,
        track: Arc<TrackLocalStaticSample>,
    },
}

impl Pump {
    async fn run(self) {
        match self {
            Pump::Video {
                mut reader,
                header,
                track,
            } => {
                let frame_duration = ivf_frame_duration(&header);
                let mut frames_in = read_ahead(move || {
                    reader.parse_next_frame().ok().map(|(frame, _)| frame.freeze())
                });
                let mut ticker = tokio::time::interval(frame_duration);
                let mut frames = 0u64;
                while let Some(data) = frames_in.recv().await {
                    ticker.tick().await;
                    let sample = Sample {
                        data,
                        duration: frame_duration,
                        ..Default::default()
                    };
                    if let Err(err) = track.write_sample(&sample).await {
                        tracing::debug!(target = "buoy.media", error = %err, "video write failed");
                        break;
                    }
                    frames += 1;
                }
                tracing::debug!(target = "buoy.media", frames, "video playback finished");
            }
            Pump::Audio { mut reader, track } => {
                let mut pages_in = read_ahead(move || {
                    reader
                        .parse_next_page()
                        .ok()
                        .map(|(page, header)| (page.freeze(), header.granule_position))
                });
                let mut ticker = tokio::time::interval(OGG_PAGE_DURATION);
                let mut last_granule = 0u64;
                let mut pages = 0u64;
                while let Some((data, granule)) = pages_in.recv().await {
                    ticker.tick().await;
                    let sample = Sample {
                        data,
                        duration: ogg_page_duration(granule, &mut last_granule),
                        ..Default::default()
                    };
                    if let Err(err) = track.write_sample(&sample).await {
                        tracing::debug!(target = "buoy.media", error = %err, "audio write failed");
                        break;
                    }
                    pages += 1;
                }
                tracing::debug!(target = "buoy.media", pages, "audio playback finished");
            }
        }
    }
}

/// Pulls items from a blocking container reader on the blocking pool. The
/// reader stops as soon as the receiving pump is gone.
fn read_ahead<T, F>(mut next: F) -> mpsc::Receiver<T>
where
    T: Send + 'static,
    F: FnMut() -> Option<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(READ_AHEAD);
    tokio::task::spawn_blocking(move || {
        while let Some(item) = next() {
            if tx.blocking_send(item).is_err() {
                break;
            }
        }
    });
    rx
}

fn ivf_frame_duration(header: &IVFFileHeader) -> Duration {
    let frame_ms = if header.timebase_denominator == 0 {
        33
    } else {
        (1000 * u64::from(header.timebase_numerator)) / u64::from(header.timebase_denominator)
    };
    Duration::from_millis(frame_ms.max(1))
}

/// Playback length of one Opus page. Pages on which no packet ends carry
/// granule `u64::MAX`; they get the nominal page length and leave the running
/// position untouched.
fn ogg_page_duration(granule: u64, last_granule: &mut u64) -> Duration {
    if granule == NO_GRANULE {
        return OGG_PAGE_DURATION;
    }
    let samples = granule.saturating_sub(*last_granule);
    *last_granule = granule;
    Duration::from_millis(samples.saturating_mul(1000) / OPUS_SAMPLE_RATE)
}

/// Tracks owned by one call session, plus the pumps that feed them.
pub struct MediaAttachment {
    tracks: Vec<MediaTrack>,
    pending: Vec<Pump>,
    running: Vec<JoinHandle<()>>,
}

impl MediaAttachment {
    /// An attachment with tracks but nothing to play; samples are written by the caller.
    pub fn silent(tracks: Vec<MediaTrack>) -> Self {
        Self {
            tracks,
            pending: Vec::new(),
            running: Vec::new(),
        }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn is_playing(&self) -> bool {
        self.running.iter().any(|task| !task.is_finished())
    }

    /// Starts playback. Calling it again is a no-op.
    pub fn start(&mut self, span: &tracing::Span) {
        for pump in self.pending.drain(..) {
            self.running
                .push(tokio::spawn(pump.run().instrument(span.clone())));
        }
    }

    pub fn release(&mut self) {
        self.pending.clear();
        for task in self.running.drain(..) {
            task.abort();
        }
    }
}

impl Drop for MediaAttachment {
    fn drop(&mut self) {
        self.release();
    }
}

pub trait MediaSource: Send + Sync {
    /// Opens the media at `base`. `Ok(None)` means no media is available.
    fn open(&self, base: &Path) -> Result<Option<MediaAttachment>, MediaError>;
}

/// Disables media for every session.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMedia;

impl MediaSource for NoMedia {
    fn open(&self, _base: &Path) -> Result<Option<MediaAttachment>, MediaError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileMediaSource;

impl MediaSource for FileMediaSource {
    fn open(&self, base: &Path) -> Result<Option<MediaAttachment>, MediaError> {
        let mut attachment = MediaAttachment::silent(Vec::new());

        if let Some(file) = open_if_present(&base.with_extension("ivf"))? {
            let path = base.with_extension("ivf");
            let (reader, header) = IVFReader::new(file).map_err(|err| MediaError::Container {
                path,
                reason: err.to_string(),
            })?;
            let media = MediaTrack::video();
            attachment.pending.push(Pump::Video {
                reader,
                header,
                track: media.track(),
            });
            attachment.tracks.push(media);
        }

        if let Some(file) = open_if_present(&base.with_extension("ogg"))? {
            let path = base.with_extension("ogg");
            let (reader, _) = OggReader::new(file, true).map_err(|err| MediaError::Container {
                path,
                reason: err.to_string(),
            })?;
            let media = MediaTrack::audio();
            attachment.pending.push(Pump::Audio {
                reader,
                track: media.track(),
            });
            attachment.tracks.push(media);
        }

        if attachment.tracks.is_empty() {
            Ok(None)
        } else {
            Ok(Some(attachment))
        }
    }
}

fn open_if_present(path: &Path) -> Result<Option<BufReader<File>>, MediaError> {
    match File::open(path) {
        Ok(file) => Ok(Some(BufReader::new(file))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(MediaError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
