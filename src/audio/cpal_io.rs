//! `cpal` implementations of [`AudioInput`] and [`AudioOutput`].
//!
//! cpal streams are not `Send` on every platform, so each stream is built,
//! played and dropped on its own OS thread.  The async side talks to that
//! thread through channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, error, info, warn};

use super::capture::CaptureError;
use super::container::{self, pcm16_to_samples, samples_to_pcm16};
use super::device::{AudioInput, AudioOutput, LevelCallback, PlaybackEnd, Recorder};
use super::level::rms_level;
use super::playback::PlaybackError;
use super::resample::{downmix, resample, to_f32, to_i16, upmix};

/// How long a device thread may take to report that its stream is running.
const STREAM_READY_TIMEOUT: Duration = Duration::from_secs(2);

/// Extra time allowed past the nominal playback duration before giving up.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Error conversions
// ---------------------------------------------------------------------------

impl From<cpal::BuildStreamError> for CaptureError {
    fn from(e: cpal::BuildStreamError) -> Self {
        match e {
            cpal::BuildStreamError::DeviceNotAvailable => Self::NoDevice,
            other => Self::Device(other.to_string()),
        }
    }
}

impl From<cpal::BuildStreamError> for PlaybackError {
    fn from(e: cpal::BuildStreamError) -> Self {
        match e {
            cpal::BuildStreamError::DeviceNotAvailable => Self::NoDevice,
            other => Self::Device(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Device lookup
// ---------------------------------------------------------------------------

fn find_input(name: Option<&str>) -> Result<cpal::Device, CaptureError> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| CaptureError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or(CaptureError::NoDevice),
        None => host.default_input_device().ok_or(CaptureError::NoDevice),
    }
}

fn find_output(name: Option<&str>) -> Result<cpal::Device, PlaybackError> {
    let host = cpal::default_host();
    match name {
        Some(wanted) => host
            .output_devices()
            .map_err(|e| PlaybackError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or(PlaybackError::NoDevice),
        None => host.default_output_device().ok_or(PlaybackError::NoDevice),
    }
}

// ---------------------------------------------------------------------------
// CpalInput
// ---------------------------------------------------------------------------

/// Microphone input on the named device, or the host default.
pub struct CpalInput {
    device_name: Option<String>,
}

impl CpalInput {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

#[async_trait]
impl AudioInput for CpalInput {
    /// Desktop hosts have no separate permission prompt; a reachable
    /// device counts as granted.
    async fn request_permission(&self) -> Result<(), CaptureError> {
        let name = self.device_name.clone();
        tokio::task::spawn_blocking(move || find_input(name.as_deref()).map(|_| ()))
            .await
            .map_err(|e| CaptureError::Device(e.to_string()))?
    }

    async fn configure_for_capture(&self) -> Result<(), CaptureError> {
        debug!("capture: using input {:?}", self.device_name.as_deref().unwrap_or("default"));
        Ok(())
    }

    async fn open_recorder(&self, level: LevelCallback) -> Result<Box<dyn Recorder>, CaptureError> {
        let name = self.device_name.clone();
        let recorder = tokio::task::spawn_blocking(move || CpalRecorder::spawn(name, level))
            .await
            .map_err(|e| CaptureError::Device(e.to_string()))??;
        Ok(Box::new(recorder))
    }
}

/// One running capture stream and the samples it has delivered.
struct CpalRecorder {
    samples: Arc<Mutex<Vec<i16>>>,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
    sample_rate: u32,
    channels: u16,
}

impl CpalRecorder {
    fn spawn(device_name: Option<String>, level: LevelCallback) -> Result<Self, CaptureError> {
        let samples = Arc::new(Mutex::new(Vec::<i16>::new()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(u32, u16), CaptureError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let sink = Arc::clone(&samples);
        let thread = thread::Builder::new()
            .name("capture-recorder".into())
            .spawn(move || {
                let stream = match build_input(device_name.as_deref(), sink, level) {
                    Ok((stream, rate, channels)) => {
                        let _ = ready_tx.send(Ok((rate, channels)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Blocks until finish/discard/drop.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| CaptureError::ResourceExhausted(e.to_string()))?;

        let (sample_rate, channels) = match ready_rx.recv_timeout(STREAM_READY_TIMEOUT) {
            Ok(result) => result?,
            Err(_) => {
                let _ = stop_tx.send(());
                return Err(CaptureError::Device("input stream did not start".into()));
            }
        };
        debug!("capture: recorder open at {sample_rate} Hz x{channels}");

        Ok(Self {
            samples,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            sample_rate,
            channels,
        })
    }

    async fn close(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            if tokio::task::spawn_blocking(move || handle.join()).await.is_err() {
                warn!("capture: recorder thread did not shut down cleanly");
            }
        }
    }

    fn take_samples(&self) -> Vec<i16> {
        std::mem::take(&mut *self.samples.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

fn build_input(
    device_name: Option<&str>,
    sink: Arc<Mutex<Vec<i16>>>,
    level: LevelCallback,
) -> Result<(cpal::Stream, u32, u16), CaptureError> {
    let device = find_input(device_name)?;
    let supported = device
        .default_input_config()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    let channels = supported.channels();
    let sample_rate = supported.sample_rate().0;
    let config: cpal::StreamConfig = supported.into();

    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let pcm = to_i16(data);
            level(rms_level(&pcm));
            sink.lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(&pcm);
        },
        |err: cpal::StreamError| {
            error!("capture: cpal stream error: {err}");
        },
        None,
    )?;
    stream
        .play()
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    Ok((stream, sample_rate, channels))
}

#[async_trait]
impl Recorder for CpalRecorder {
    async fn finish(&mut self) -> Result<Vec<u8>, CaptureError> {
        self.close().await;
        let samples = self.take_samples();
        let wrapped = container::wrap_pcm(
            &samples_to_pcm16(&samples),
            self.sample_rate,
            self.channels,
            16,
        )?;
        Ok(wrapped)
    }

    async fn discard(&mut self) {
        self.close().await;
        self.take_samples();
    }
}

impl Drop for CpalRecorder {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ---------------------------------------------------------------------------
// CpalOutput
// ---------------------------------------------------------------------------

/// Speaker output on the named device, or the host default.
pub struct CpalOutput {
    device_name: Option<String>,
    /// Stop flag of the stream currently playing, if any.
    current: Mutex<Option<Arc<AtomicBool>>>,
}

impl CpalOutput {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            current: Mutex::new(None),
        }
    }

    fn set_current(&self, flag: Option<Arc<AtomicBool>>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = flag;
    }
}

#[async_trait]
impl AudioOutput for CpalOutput {
    async fn configure_for_playback(&self) -> Result<(), PlaybackError> {
        let name = self.device_name.clone();
        tokio::task::spawn_blocking(move || find_output(name.as_deref()).map(|_| ()))
            .await
            .map_err(|e| PlaybackError::Device(e.to_string()))?
    }

    async fn play(&self, wrapped: Vec<u8>) -> Result<PlaybackEnd, PlaybackError> {
        let (header, payload) = container::unwrap(&wrapped)?;
        let mono = downmix(&pcm16_to_samples(payload), header.channels);
        let source_rate = header.sample_rate;
        let nominal = header.duration();

        let stop = Arc::new(AtomicBool::new(false));
        self.set_current(Some(Arc::clone(&stop)));

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let name = self.device_name.clone();
        let spawned = thread::Builder::new()
            .name("playback-output".into())
            .spawn(move || {
                let result = render(name.as_deref(), &mono, source_rate, nominal, &stop);
                let _ = done_tx.send(result);
            });
        if let Err(e) = spawned {
            self.set_current(None);
            return Err(PlaybackError::Device(e.to_string()));
        }

        let result = done_rx
            .await
            .unwrap_or_else(|_| Err(PlaybackError::Device("output thread exited".into())));
        self.set_current(None);
        result
    }

    fn stop(&self) {
        if let Some(flag) = self.current.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Play mono samples on the output device, blocking until done or stopped.
fn render(
    device_name: Option<&str>,
    mono: &[i16],
    source_rate: u32,
    nominal: Duration,
    stop: &AtomicBool,
) -> Result<PlaybackEnd, PlaybackError> {
    let device = find_output(device_name)?;
    let supported = device
        .default_output_config()
        .map_err(|e| PlaybackError::Device(e.to_string()))?;
    let channels = supported.channels();
    let device_rate = supported.sample_rate().0;
    let config: cpal::StreamConfig = supported.into();

    let frames = resample(mono, source_rate, device_rate);
    let data = to_f32(&upmix(&frames, channels));
    let finished = Arc::new(AtomicBool::new(false));

    let drained = Arc::clone(&finished);
    let mut position = 0usize;
    let stream = device.build_output_stream(
        &config,
        move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
            for slot in out.iter_mut() {
                *slot = match data.get(position) {
                    Some(&s) => {
                        position += 1;
                        s
                    }
                    None => {
                        drained.store(true, Ordering::SeqCst);
                        0.0
                    }
                };
            }
        },
        |err: cpal::StreamError| {
            error!("playback: cpal stream error: {err}");
        },
        None,
    )?;
    stream
        .play()
        .map_err(|e| PlaybackError::Device(e.to_string()))?;
    info!("playback: rendering at {device_rate} Hz x{channels}");

    let deadline = Instant::now() + nominal + DRAIN_GRACE;
    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok(PlaybackEnd::Interrupted);
        }
        if finished.load(Ordering::SeqCst) {
            // Let the last device buffer reach the speaker.
            thread::sleep(Duration::from_millis(50));
            return Ok(PlaybackEnd::Completed);
        }
        if Instant::now() >= deadline {
            warn!("playback: output stalled, giving up");
            return Ok(PlaybackEnd::Completed);
        }
        thread::sleep(Duration::from_millis(10));
    }
}
