//! Frame ingestion with a fixed-delay, bounded reconnect policy.

use chrono::Utc;
use image::{imageops::FilterType, RgbImage};
use tracing::{error, info, warn};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};

use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread;
use std::time::Duration;

use crate::config::{ImageSize, RetryConfig};
use crate::error::{LprError, LprErrorKind};

/// One captured RGB frame.
pub struct Frame {
    pub image: RgbImage,
    pub timestamp_ms: i64,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self { image, timestamp_ms: Utc::now().timestamp_millis() }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Raw capture capability. Implementations do not retry; [`FrameSource`] does.
pub trait VideoSource {
    type Handle;

    fn open(&mut self, uri: &str) -> Result<Self::Handle, LprError>;

    fn capture(&mut self, handle: &mut Self::Handle) -> Result<Frame, LprError>;

    fn close(&mut self, handle: Self::Handle);

    /// `false` once the source has reached a clean end of stream.
    fn is_streaming(&self, _handle: &Self::Handle) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Streaming,
    Reconnecting,
    Failed,
}

/// A [`VideoSource`] plus the reconnect state machine around it.
pub struct FrameSource<S: VideoSource> {
    source: S,
    uri: String,
    handle: Option<S::Handle>,
    state: StreamState,
    retries: u32,
    max_retries: u32,
    delay: Duration,
    last_error: String,
    sleep: Box<dyn FnMut(Duration)>,
}

impl<S: VideoSource> FrameSource<S> {
    /// Open `uri`. Failing to open at startup is fatal, there is no retry.
    pub fn open(mut source: S, uri: &str, retry: &RetryConfig) -> Result<Self, LprError> {
        let handle = source.open(uri)?;
        info!(uri, "video source opened");
        Ok(Self {
            source,
            uri: uri.to_string(),
            handle: Some(handle),
            state: StreamState::Streaming,
            retries: 0,
            max_retries: retry.max_retries,
            delay: Duration::from_secs_f64(retry.retry_delay_seconds),
            last_error: String::new(),
            sleep: Box::new(thread::sleep),
        })
    }

    /// Replace the function used to wait between reconnect attempts.
    pub fn with_sleep(mut self, sleep: impl FnMut(Duration) + 'static) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Consecutive failures since the last good capture.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Next frame, reconnecting as needed.
    ///
    /// `Ok(None)` means the source ended cleanly. Once the retry budget is
    /// spent every call returns `RetryBudgetExceeded`.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, LprError> {
        loop {
            match self.state {
                StreamState::Failed => return Err(self.exhausted()),
                StreamState::Reconnecting => {
                    if let Err(e) = self.reconnect() {
                        self.record_failure(e);
                    }
                }
                StreamState::Streaming => {
                    let handle = match self.handle.as_mut() {
                        Some(handle) => handle,
                        None => {
                            self.state = StreamState::Reconnecting;
                            continue;
                        }
                    };
                    if !self.source.is_streaming(handle) {
                        info!(uri = %self.uri, "end of stream");
                        return Ok(None);
                    }
                    match self.source.capture(handle) {
                        Ok(frame) => {
                            if self.retries > 0 {
                                info!(uri = %self.uri, after = self.retries, "stream recovered");
                            }
                            self.retries = 0;
                            return Ok(Some(frame));
                        }
                        Err(e) => self.record_failure(e),
                    }
                }
            }
        }
    }

    /// Release the current handle, wait the fixed delay, reopen.
    pub fn reconnect(&mut self) -> Result<(), LprError> {
        if let Some(handle) = self.handle.take() {
            self.source.close(handle);
        }
        warn!(uri = %self.uri, delay_s = self.delay.as_secs_f64(), attempt = self.retries, "reconnecting to video source");
        (self.sleep)(self.delay);
        let handle = self.source.open(&self.uri)?;
        self.handle = Some(handle);
        self.state = StreamState::Streaming;
        Ok(())
    }

    pub fn close(mut self) {
        if let Some(handle) = self.handle.take() {
            self.source.close(handle);
        }
    }

    fn record_failure(&mut self, e: LprError) {
        self.retries += 1;
        self.last_error = e.to_string();
        if self.retries > self.max_retries {
            error!(
                uri = %self.uri,
                error = e.kind().name(),
                retries = self.retries,
                "retry budget exhausted: {}", e
            );
            self.state = StreamState::Failed;
        } else {
            warn!(uri = %self.uri, error = e.kind().name(), retries = self.retries, "stream failure: {}", e);
            self.state = StreamState::Reconnecting;
        }
    }

    fn exhausted(&self) -> LprError {
        LprErrorKind::RetryBudgetExceeded { attempts: self.retries, last: self.last_error.clone() }.into()
    }
}

/// Decodes any ffmpeg-readable URI (RTSP, file, v4l2 device) into raw RGB frames
/// scaled to the configured size.
pub struct FfmpegSource {
    size: ImageSize,
    binary: String,
    timeout: Duration,
}

pub struct FfmpegStream {
    child: Child,
    frames: Receiver<io::Result<Vec<u8>>>,
    /// Frame read while opening, handed out by the first capture.
    first: Option<Vec<u8>>,
}

const NETWORK_SCHEMES: [&str; 6] = ["http://", "https://", "tcp://", "udp://", "rtmp://", "srt://"];

impl FfmpegSource {
    pub fn new(size: ImageSize) -> Self {
        Self { size, binary: "ffmpeg".to_string(), timeout: Duration::from_secs(30) }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// How long open and capture wait for a frame before failing.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn frame_len(&self) -> usize {
        self.size.width as usize * self.size.height as usize * 3
    }

    fn command(&self, uri: &str) -> Command {
        let micros = self.timeout.as_micros().to_string();
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            cmd.arg("-rtsp_transport").arg("tcp").arg("-timeout").arg(&micros);
        } else if NETWORK_SCHEMES.iter().any(|scheme| uri.starts_with(scheme)) {
            cmd.arg("-rw_timeout").arg(&micros);
        } else if uri.starts_with("/dev/video") {
            cmd.arg("-f").arg("video4linux2");
        }
        cmd.arg("-i")
            .arg(uri)
            .arg("-vf")
            .arg(format!("scale={}:{}", self.size.width, self.size.height))
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }

    /// Wait up to the timeout for the next raw frame from the reader thread.
    fn next_buffer(&self, frames: &Receiver<io::Result<Vec<u8>>>) -> Result<Vec<u8>, String> {
        match frames.recv_timeout(self.timeout) {
            Ok(Ok(buffer)) => Ok(buffer),
            Ok(Err(e)) => Err(e.to_string()),
            Err(RecvTimeoutError::Timeout) => Err(format!("no frame within {:.1}s", self.timeout.as_secs_f64())),
            Err(RecvTimeoutError::Disconnected) => Err("ffmpeg stream ended".to_string()),
        }
    }
}

/// Read fixed-size frames off ffmpeg's stdout until it ends or the receiver is dropped.
fn spawn_reader(mut stdout: ChildStdout, frame_len: usize) -> Receiver<io::Result<Vec<u8>>> {
    let (tx, rx) = bounded(2);
    thread::spawn(move || loop {
        let mut buffer = vec![0u8; frame_len];
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                if tx.send(Ok(buffer)).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e));
                break;
            }
        }
    });
    rx
}

fn stop(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

impl Drop for FfmpegStream {
    fn drop(&mut self) {
        stop(&mut self.child);
    }
}

impl VideoSource for FfmpegSource {
    type Handle = FfmpegStream;

    /// Starts ffmpeg and waits for its first frame, so an unreachable input
    /// fails here as a connection error.
    fn open(&mut self, uri: &str) -> Result<FfmpegStream, LprError> {
        let mut child = self.command(uri).spawn().map_err(|e| LprError::connection(uri, e))?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                stop(&mut child);
                return Err(LprError::connection(uri, "ffmpeg stdout not captured"));
            }
        };
        let frames = spawn_reader(stdout, self.frame_len());
        match self.next_buffer(&frames) {
            Ok(first) => Ok(FfmpegStream { child, frames, first: Some(first) }),
            Err(reason) => {
                stop(&mut child);
                Err(LprError::connection(uri, reason))
            }
        }
    }

    fn capture(&mut self, handle: &mut FfmpegStream) -> Result<Frame, LprError> {
        let buffer = match handle.first.take() {
            Some(buffer) => buffer,
            None => self.next_buffer(&handle.frames).map_err(LprError::capture)?,
        };
        let image = RgbImage::from_raw(self.size.width, self.size.height, buffer)
            .ok_or_else(|| LprError::capture("frame buffer does not match image size"))?;
        Ok(Frame::new(image))
    }

    fn close(&mut self, handle: FfmpegStream) {
        drop(handle);
    }
}

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Replays the still images of a directory, in file name order.
pub struct ImageFolderSource {
    size: ImageSize,
}

pub struct ImageFolder {
    pending: VecDeque<PathBuf>,
}

impl ImageFolderSource {
    pub fn new(size: ImageSize) -> Self {
        Self { size }
    }
}

impl VideoSource for ImageFolderSource {
    type Handle = ImageFolder;

    fn open(&mut self, uri: &str) -> Result<ImageFolder, LprError> {
        let entries = fs::read_dir(uri).map_err(|e| LprError::connection(uri, e))?;
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        Ok(ImageFolder { pending: paths.into() })
    }

    fn capture(&mut self, handle: &mut ImageFolder) -> Result<Frame, LprError> {
        let path = handle.pending.pop_front().ok_or_else(|| LprError::capture("no images left"))?;
        let img = image::open(&path).map_err(|e| LprError::capture(format!("{}: {}", path.display(), e)))?;
        let img = img.resize_exact(self.size.width, self.size.height, FilterType::Triangle);
        Ok(Frame::new(img.to_rgb8()))
    }

    fn close(&mut self, _handle: ImageFolder) {}

    fn is_streaming(&self, handle: &ImageFolder) -> bool {
        !handle.pending.is_empty()
    }
}
