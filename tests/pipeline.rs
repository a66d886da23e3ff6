//! End-to-end decode supervision scenario against stub backends:
//! configure, process a burst of access units, survive a transient
//! error, terminate cleanly with zero frames in flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use kestrel::decode::engine::{DecodeEngine, EngineError};
use kestrel::decode::frame::{live_frame_count, DecodedFrame, PixelLayout, Plane};
use kestrel::decode::supervisor::{BoxedSource, DecodeSupervisor};
use kestrel::source::{AccessUnit, ChannelFrameSource, SourceHandle};
use kestrel::{settings_handle, FrameMailbox, StreamConfig, VideoCodec};

/// Emits one 1280x720 frame per access unit, mimicking the lockstep
/// discipline. Empty units are rejected as transient errors.
struct ScriptedEngine {
    frames_out: Arc<AtomicUsize>,
}

impl DecodeEngine for ScriptedEngine {
    fn feed_config(&mut self, data: &[u8]) -> Result<(), EngineError> {
        assert!(!data.is_empty());
        Ok(())
    }

    fn feed(&mut self, au: &AccessUnit) -> Result<Vec<DecodedFrame>, EngineError> {
        if au.data.is_empty() {
            return Err(EngineError::BadAccessUnit("empty".into()));
        }
        self.frames_out.fetch_add(1, Ordering::SeqCst);
        let width = 1280u32;
        let height = 720u32;
        let y = Plane {
            data: Bytes::from(vec![0x40; (width * height) as usize]),
            stride: width as usize,
        };
        let u = Plane {
            data: Bytes::from(vec![0x80; (width * height / 4) as usize]),
            stride: (width / 2) as usize,
        };
        let v = Plane {
            data: Bytes::from(vec![0x80; (width * height / 4) as usize]),
            stride: (width / 2) as usize,
        };
        Ok(vec![DecodedFrame::new_planar(
            width,
            height,
            au.created_at.elapsed().as_micros() as i64,
            PixelLayout::Yuv420p,
            [y, u, v],
        )])
    }

    fn kind(&self) -> &'static str {
        "stub"
    }
}

fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn hundred_access_units_end_to_end() {
    let mut config = StreamConfig::default();
    config.codec = VideoCodec::H264;
    config.input_port = 5600;
    config.input_ip = "127.0.0.1".into();
    config.force_software_decode = false;
    let settings = settings_handle(config);

    let mailbox = Arc::new(FrameMailbox::new());
    let frames_out = Arc::new(AtomicUsize::new(0));
    let constructions = Arc::new(AtomicUsize::new(0));
    let handle_slot: Arc<Mutex<Option<SourceHandle>>> = Arc::new(Mutex::new(None));

    let mut supervisor = DecodeSupervisor::with_factories(
        settings,
        mailbox.clone(),
        {
            let frames_out = frames_out.clone();
            let constructions = constructions.clone();
            Box::new(move |_config| {
                constructions.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(ScriptedEngine {
                    frames_out: frames_out.clone(),
                }) as Box<dyn DecodeEngine + Send>)
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

    wait_for(|| handle_slot.lock().unwrap().is_some(), "source binding");
    let handle = handle_slot.lock().unwrap().clone().unwrap();

    // Session config data arrives before any video data and does not
    // produce a display frame.
    handle.set_session_config_data(Bytes::from_static(b"\x67\x42\x00\x1f"));

    // Drain the mailbox like a render loop while feeding 100 units.
    let taken = Arc::new(AtomicUsize::new(0));
    let drain_stop = Arc::new(AtomicUsize::new(0));
    let drainer = {
        let mailbox = mailbox.clone();
        let taken = taken.clone();
        let drain_stop = drain_stop.clone();
        thread::spawn(move || {
            while drain_stop.load(Ordering::Acquire) == 0 {
                if mailbox.take().is_some() {
                    taken.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    for i in 0..100u8 {
        handle.push(AccessUnit::new(Bytes::from(vec![i, 0, 0, 1])));
        if i == 50 {
            // A malformed unit mid-stream is dropped, not fatal.
            handle.push(AccessUnit::new(Bytes::new()));
        }
        thread::sleep(Duration::from_millis(2));
    }

    // Allowing a few "no frame yet" polls, at least 90 of the 100
    // units must have produced a decoded frame.
    wait_for(|| mailbox.published() >= 90, "90 decoded frames");
    // The transient error never tore the session down.
    assert_eq!(constructions.load(Ordering::SeqCst), 1);

    // terminate() returns only after the decode thread has fully
    // exited: no further frames are produced afterwards.
    supervisor.terminate();
    assert_eq!(
        mailbox.published() as usize,
        frames_out.load(Ordering::SeqCst)
    );
    let after = mailbox.published();
    handle.push(AccessUnit::new(Bytes::from_static(&[9, 9, 9])));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(mailbox.published(), after);

    drain_stop.store(1, Ordering::Release);
    drainer.join().unwrap();

    // Zero frames in flight once the mailbox is drained.
    mailbox.clear();
    assert_eq!(live_frame_count(), 0);
}
