//! Decode supervision state machine.
//!
//! Owns the decode engine's lifetime, runs the feed/drain loop on a
//! dedicated thread and restarts cleanly on stream changes, settings
//! changes, decoder errors and mid-stream resolution changes. Decode
//! errors are never fatal to the caller; the only unrecoverable
//! condition is an explicit terminate request.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::decode::engine::{self, BoxedEngine, EngineError};
use crate::decode::frame::PixelLayout;
use crate::pipeline::mailbox::FrameMailbox;
use crate::source::{FrameSource, UdpFrameSource};
use crate::utils::{self, RollingAverage};
use crate::{SettingsHandle, StreamConfig};

/// Bounded wait for the next access unit: roughly double an expected
/// video frame interval. Long enough to avoid busy-spinning, short
/// enough to notice a stalled stream quickly.
const FRAME_SOURCE_TIMEOUT: Duration = Duration::from_millis(66);

/// Backoff after a failed engine or source construction.
const CONFIGURE_BACKOFF: Duration = Duration::from_secs(1);

/// Interval of the best-effort settings drift poll.
const SETTINGS_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub type BoxedSource = Box<dyn FrameSource + Send>;
pub type EngineFactory =
    Box<dyn Fn(&StreamConfig) -> Result<BoxedEngine, EngineError> + Send + 'static>;
pub type SourceFactory = Box<dyn Fn(&StreamConfig) -> io::Result<BoxedSource> + Send + 'static>;

/// Most recent observed output format, for diagnostic display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
}

impl std::fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}x{}", self.layout, self.width, self.height)
    }
}

pub struct DecodeSupervisor {
    handle: Option<JoinHandle<()>>,
    restart: Arc<AtomicBool>,
    terminate: Arc<AtomicBool>,
    watch_stop: Option<flume::Sender<()>>,
    watch_handle: Option<JoinHandle<()>>,
    last_format: Arc<Mutex<Option<VideoFormat>>>,
}

impl DecodeSupervisor {
    /// Spawn the decode thread with the default engine selection and a
    /// UDP frame source binding.
    pub fn start(settings: SettingsHandle, mailbox: Arc<FrameMailbox>) -> Self {
        Self::with_factories(
            settings,
            mailbox,
            Box::new(engine::create_engine),
            Box::new(|config: &StreamConfig| {
                Ok(Box::new(UdpFrameSource::bind(&config.input_ip, config.input_port)?)
                    as BoxedSource)
            }),
        )
    }

    /// Spawn with explicit engine/source factories. The supervisor is
    /// written once against the engine contract; tests inject stubs
    /// here.
    pub fn with_factories(
        settings: SettingsHandle,
        mailbox: Arc<FrameMailbox>,
        engines: EngineFactory,
        sources: SourceFactory,
    ) -> Self {
        let restart = Arc::new(AtomicBool::new(false));
        let terminate = Arc::new(AtomicBool::new(false));
        let last_format = Arc::new(Mutex::new(None));
        let last_applied = Arc::new(Mutex::new(None::<StreamConfig>));

        let handle = {
            let settings = settings.clone();
            let restart = restart.clone();
            let terminate = terminate.clone();
            let last_format = last_format.clone();
            let last_applied = last_applied.clone();
            thread::Builder::new()
                .name("kestrel-decode".into())
                .spawn(move || {
                    utils::request_realtime_scheduling();
                    supervise(
                        settings,
                        mailbox,
                        engines,
                        sources,
                        restart,
                        terminate,
                        last_format,
                        last_applied,
                    );
                })
                .expect("spawn decode thread")
        };

        // Best-effort 1 Hz poll comparing live settings to the config
        // last used to start a session; raises the restart flag on
        // structural inequality.
        let (watch_stop_tx, watch_stop_rx) = flume::bounded::<()>(1);
        let watch_handle = {
            let settings = settings.clone();
            let restart = restart.clone();
            thread::Builder::new()
                .name("kestrel-settings-watch".into())
                .spawn(move || loop {
                    match watch_stop_rx.recv_timeout(SETTINGS_POLL_INTERVAL) {
                        Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => break,
                        Err(flume::RecvTimeoutError::Timeout) => {}
                    }
                    let current = settings.load_full();
                    let drifted = {
                        let applied = last_applied.lock().unwrap();
                        applied.as_ref().is_some_and(|a| *a != *current)
                    };
                    if drifted {
                        info!("stream config changed, requesting decoder restart");
                        restart.store(true, Ordering::Release);
                    }
                })
                .expect("spawn settings watch thread")
        };

        Self {
            handle: Some(handle),
            restart,
            terminate,
            watch_stop: Some(watch_stop_tx),
            watch_handle: Some(watch_handle),
            last_format,
        }
    }

    /// Ask the current decode session to tear down and reconfigure.
    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::Release);
    }

    /// Most recent observed frame format, for diagnostic display.
    pub fn last_video_format(&self) -> Option<VideoFormat> {
        *self.last_format.lock().unwrap()
    }

    /// Stop decoding for good. Stops the settings watch first (that is
    /// fire-and-forget and returns instantly), then sets the terminate
    /// and restart flags and joins the decode thread, so the thread is
    /// never resumed into further work after this returns. Idempotent.
    pub fn terminate(&mut self) {
        if let Some(stop) = self.watch_stop.take() {
            let _ = stop.send(());
        }
        self.terminate.store(true, Ordering::Release);
        self.restart.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("decode thread panicked during shutdown");
            }
        }
        if let Some(watch) = self.watch_handle.take() {
            let _ = watch.join();
        }
        info!("decode supervisor terminated");
    }
}

impl Drop for DecodeSupervisor {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// `Idle -> Configuring -> Decoding -> Restarting -> ...` until an
/// external terminate request. Construction failure is retried
/// indefinitely with a fixed backoff, never fatal.
#[allow(clippy::too_many_arguments)]
fn supervise(
    settings: SettingsHandle,
    mailbox: Arc<FrameMailbox>,
    engines: EngineFactory,
    sources: SourceFactory,
    restart: Arc<AtomicBool>,
    terminate: Arc<AtomicBool>,
    last_format: Arc<Mutex<Option<VideoFormat>>>,
    last_applied: Arc<Mutex<Option<StreamConfig>>>,
) {
    while !terminate.load(Ordering::Acquire) {
        // Configuring: read a fresh snapshot, build a new session
        let config = settings.load_full();

        let mut engine = match engines(&config) {
            Ok(engine) => engine,
            Err(e) => {
                warn!("decoder construction failed ({}), retrying", e);
                thread::sleep(CONFIGURE_BACKOFF);
                continue;
            }
        };
        let mut source = match sources(&config) {
            Ok(source) => source,
            Err(e) => {
                warn!("frame source binding failed ({}), retrying", e);
                thread::sleep(CONFIGURE_BACKOFF);
                continue;
            }
        };
        *last_applied.lock().unwrap() = Some((*config).clone());

        info!(
            "decoding {} from {}:{} ({})",
            config.codec.as_str(),
            config.input_ip,
            config.input_port,
            engine.kind()
        );
        *last_format.lock().unwrap() = None;

        decode_until_restart(
            engine.as_mut(),
            source.as_mut(),
            &mailbox,
            &restart,
            &terminate,
            &last_format,
        );

        // Restarting: force the mailbox empty before the session (and
        // with it the decoder's buffer pool) is torn down, so no frame
        // the pool issued is still reachable.
        mailbox.clear();
        drop(source);
        drop(engine);
        restart.store(false, Ordering::Release);
        if !terminate.load(Ordering::Acquire) {
            debug!("decode session ended, reconfiguring");
        }
    }
}

/// The Decoding state: feed/drain until a restart condition fires.
fn decode_until_restart(
    engine: &mut dyn crate::decode::engine::DecodeEngine,
    source: &mut dyn FrameSource,
    mailbox: &FrameMailbox,
    restart: &AtomicBool,
    terminate: &AtomicBool,
    last_format: &Mutex<Option<VideoFormat>>,
) {
    let mut configured = false;
    let mut last_dims: Option<(u32, u32)> = None;
    let mut parse_latency = RollingAverage::default();

    loop {
        // Restart conditions, checked every iteration and after every
        // bounded-wait return.
        if terminate.load(Ordering::Acquire) || restart.load(Ordering::Acquire) {
            return;
        }
        if source.parameters_changed() {
            info!("stream parameters changed, restarting decoder");
            return;
        }

        // Session configuration data that arrives before any video
        // data is fed once, it does not produce a display frame.
        if !configured {
            if let Some(data) = source.try_get_session_config_data() {
                match engine.feed_config(&data) {
                    Ok(()) => {
                        debug!("session configuration data fed ({} bytes)", data.len());
                        configured = true;
                    }
                    Err(e) if e.is_fatal() => {
                        error!("feeding session config failed: {}", e);
                        return;
                    }
                    Err(e) => debug!("session config rejected: {}", e),
                }
            }
        }

        let Some(au) = source.try_get_access_unit(FRAME_SOURCE_TIMEOUT) else {
            continue;
        };

        parse_latency.add(au.created_at.elapsed());
        metrics::histogram!("parse_to_feed_us").record(au.created_at.elapsed().as_micros() as f64);
        if parse_latency.time_since_last_log() > Duration::from_secs(3) {
            debug!("avg parse-to-feed: {}", parse_latency.average_readable());
            parse_latency.set_last_log();
            parse_latency.reset();
        }

        let frames = match engine.feed(&au) {
            Ok(frames) => frames,
            Err(e) if e.is_fatal() => {
                error!("decoder error: {}, restarting", e);
                return;
            }
            Err(e) => {
                // Transient: drop this access unit, keep decoding
                debug!("access unit dropped: {}", e);
                continue;
            }
        };

        for frame in frames {
            let dims = frame.dimensions();
            if let Some(previous) = last_dims {
                if previous != dims {
                    // Embedded decoders silently emit garbage instead
                    // of erroring when the stream geometry changes, so
                    // this is detected explicitly and forces a restart
                    // before the frame ever reaches the mailbox.
                    warn!(
                        "video resolution changed {}x{} -> {}x{}, restarting decoder",
                        previous.0, previous.1, dims.0, dims.1
                    );
                    restart.store(true, Ordering::Release);
                    return;
                }
            } else {
                info!("first frame: {} {}x{}", frame.layout, dims.0, dims.1);
            }
            last_dims = Some(dims);
            *last_format.lock().unwrap() = Some(VideoFormat {
                width: dims.0,
                height: dims.1,
                layout: frame.layout,
            });
            mailbox.publish(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;

    use super::*;
    use crate::decode::engine::DecodeEngine;
    use crate::decode::frame::testutil::gray_frame;
    use crate::decode::frame::DecodedFrame;
    use crate::source::{AccessUnit, ChannelFrameSource, SourceHandle};
    use crate::settings_handle;

    /// Engine stub: one synthetic frame per access unit, dimensions
    /// taken from the first two payload bytes (x16).
    struct StubEngine;

    impl DecodeEngine for StubEngine {
        fn feed_config(&mut self, _data: &[u8]) -> Result<(), EngineError> {
            Ok(())
        }

        fn feed(&mut self, au: &AccessUnit) -> Result<Vec<DecodedFrame>, EngineError> {
            let w = au.data.first().copied().unwrap_or(40) as u32 * 16;
            let h = au.data.get(1).copied().unwrap_or(30) as u32 * 16;
            Ok(vec![gray_frame(w, h, utils::time_us())])
        }

        fn kind(&self) -> &'static str {
            "stub"
        }
    }

    fn start_stub_supervisor(
        handle_slot: Arc<Mutex<Option<SourceHandle>>>,
        constructions: Arc<AtomicUsize>,
    ) -> (DecodeSupervisor, Arc<FrameMailbox>) {
        let mailbox = Arc::new(FrameMailbox::new());
        let supervisor = DecodeSupervisor::with_factories(
            settings_handle(StreamConfig::default()),
            mailbox.clone(),
            Box::new(move |_config| {
                constructions.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(StubEngine) as BoxedEngine)
            }),
            Box::new(move |_config| {
                let (source, handle) = ChannelFrameSource::new();
                *handle_slot.lock().unwrap() = Some(handle);
                Ok(Box::new(source) as BoxedSource)
            }),
        );
        (supervisor, mailbox)
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached within 5s");
    }

    #[test]
    fn resolution_change_restarts_before_publishing_the_new_frame() {
        let handle_slot = Arc::new(Mutex::new(None));
        let constructions = Arc::new(AtomicUsize::new(0));
        let (mut supervisor, mailbox) =
            start_stub_supervisor(handle_slot.clone(), constructions.clone());

        wait_for(|| handle_slot.lock().unwrap().is_some());
        let handle = handle_slot.lock().unwrap().clone().unwrap();

        // 40x30 blocks -> 640x480
        handle.push(AccessUnit::new(Bytes::from_static(&[40, 30])));
        wait_for(|| mailbox.published() == 1);

        // 80x45 blocks -> 1280x720: must trigger a restart, and the
        // differently-sized frame must never reach the mailbox.
        handle.push(AccessUnit::new(Bytes::from_static(&[80, 45])));
        wait_for(|| constructions.load(Ordering::SeqCst) >= 2);
        assert_eq!(mailbox.published(), 1);
        assert!(mailbox.take().is_none(), "mailbox cleared on restart");

        supervisor.terminate();
    }

    #[test]
    fn source_parameter_change_forces_reconfiguration() {
        let handle_slot = Arc::new(Mutex::new(None));
        let constructions = Arc::new(AtomicUsize::new(0));
        let (mut supervisor, _mailbox) =
            start_stub_supervisor(handle_slot.clone(), constructions.clone());

        wait_for(|| handle_slot.lock().unwrap().is_some());
        let handle = handle_slot.lock().unwrap().clone().unwrap();
        handle.signal_parameters_changed();

        wait_for(|| constructions.load(Ordering::SeqCst) >= 2);
        supervisor.terminate();
    }

    #[test]
    fn settings_drift_raises_restart() {
        let handle_slot = Arc::new(Mutex::new(None));
        let constructions = Arc::new(AtomicUsize::new(0));
        let settings = settings_handle(StreamConfig::default());
        let mailbox = Arc::new(FrameMailbox::new());
        let mut supervisor = DecodeSupervisor::with_factories(
            settings.clone(),
            mailbox,
            {
                let constructions = constructions.clone();
                Box::new(move |_config| {
                    constructions.fetch_add(1, Ordering::SeqCst);
                    Ok(Box::new(StubEngine) as BoxedEngine)
                })
            },
            {
                let handle_slot = handle_slot.clone();
                Box::new(move |_config| {
                    let (source, handle) = ChannelFrameSource::new();
                    *handle_slot.lock().unwrap() = Some(handle);
                    Ok(Box::new(source) as BoxedSource)
                })
            },
        );

        wait_for(|| constructions.load(Ordering::SeqCst) >= 1);
        let mut changed = StreamConfig::default();
        changed.input_port = 5601;
        settings.store(Arc::new(changed));

        // the 1 Hz watch should pick the drift up and force a restart
        wait_for(|| constructions.load(Ordering::SeqCst) >= 2);
        supervisor.terminate();
    }

    #[test]
    fn terminate_is_idempotent_and_stops_frame_production() {
        let handle_slot = Arc::new(Mutex::new(None));
        let constructions = Arc::new(AtomicUsize::new(0));
        let (mut supervisor, mailbox) =
            start_stub_supervisor(handle_slot.clone(), constructions.clone());

        wait_for(|| handle_slot.lock().unwrap().is_some());
        let handle = handle_slot.lock().unwrap().clone().unwrap();
        handle.push(AccessUnit::new(Bytes::from_static(&[40, 30])));
        wait_for(|| mailbox.published() >= 1);

        supervisor.terminate();
        supervisor.terminate();

        let published = mailbox.published();
        handle.push(AccessUnit::new(Bytes::from_static(&[40, 30])));
        thread::sleep(Duration::from_millis(150));
        assert_eq!(mailbox.published(), published, "no frames after terminate");
    }
}
