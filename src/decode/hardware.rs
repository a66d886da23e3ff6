//! Hardware-accelerated decode backend.
//!
//! Wraps a platform hardware decoder element behind the uniform engine
//! contract: feed one access unit, then poll (bounded) for the output
//! frame. VA-API platforms get a post-processor so frames come out as
//! GPU-importable DMA-BUFs; V4L2 stateful decoders emit DMA-BUFs that
//! need a CPU readback before upload.

use std::time::{Duration, Instant};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info, warn};

use crate::decode::convert::SampleConverter;
use crate::decode::engine::{DecodeEngine, EngineError};
use crate::decode::frame::DecodedFrame;
use crate::source::AccessUnit;
use crate::utils::{self, RollingAverage};
use crate::{StreamConfig, VideoCodec};

/// Frames the sink queue may hold before the decoder blocks internally.
/// The decoder's own output pool is sized against this bound on every
/// renegotiation.
const POOL_FRAME_HEADROOM: u32 = 4;

/// Bounded poll for the lockstep wait: up to 5 attempts of 2 ms each,
/// a documented worst-case wait of 10 ms per access unit.
const PULL_ATTEMPTS: u32 = 5;
const PULL_WAIT: gst::ClockTime = gst::ClockTime::from_mseconds(2);

pub struct HardwareEngine {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    converter: SampleConverter,
    decoder_element: &'static str,
    /// Baseline timestamp of the first successful submission
    first_submit_us: Option<i64>,
    decode_wait: RollingAverage,
}

impl HardwareEngine {
    pub fn new(config: &StreamConfig) -> Result<Self, EngineError> {
        gst::init().map_err(|e| EngineError::Unavailable(format!("gstreamer init: {e}")))?;

        let decoder_element = detect_hw_decoder(config.codec)
            .ok_or_else(|| EngineError::Unavailable("no hardware decoder element".into()))?;
        info!("using hardware decoder: {}", decoder_element);

        let pipeline_str = build_pipeline_string(config, decoder_element);
        debug!("pipeline: {}", pipeline_str);

        let (pipeline, appsrc, appsink) = launch(&pipeline_str)?;
        configure_appsink(&appsink);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| EngineError::Unavailable(format!("pipeline start: {e:?}")))?;

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            converter: SampleConverter::default(),
            decoder_element,
            first_submit_us: None,
            decode_wait: RollingAverage::default(),
        })
    }

    /// The decoder renegotiated its output ("parameters changed"). The
    /// internal output pool is reallocated from scratch against the new
    /// buffer requirement; a brief stall is accepted over incremental
    /// resizing.
    fn handle_parameters_changed(&mut self) {
        let Some(info) = self.converter.video_info() else {
            return;
        };
        info!(
            "decoder renegotiated: {}x{} {:?}, buffer requirement {} bytes, pool {} frames",
            info.width(),
            info.height(),
            info.format(),
            info.size(),
            POOL_FRAME_HEADROOM,
        );
        // Re-bounding the sink queue forces the negotiated pool to the
        // new size; the old pool is dropped wholesale.
        self.appsink.set_max_buffers(POOL_FRAME_HEADROOM);
    }

    fn check_bus_error(&self) -> Option<EngineError> {
        let bus = self.pipeline.bus()?;
        let msg = bus.timed_pop_filtered(gst::ClockTime::ZERO, &[gst::MessageType::Error])?;
        if let gst::MessageView::Error(err) = msg.view() {
            return Some(EngineError::Pipeline(format!(
                "{} reported: {}",
                self.decoder_element,
                err.error()
            )));
        }
        None
    }
}

impl DecodeEngine for HardwareEngine {
    fn feed_config(&mut self, data: &[u8]) -> Result<(), EngineError> {
        let buffer = gst::Buffer::from_slice(data.to_vec());
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| EngineError::Pipeline(format!("config push rejected: {e:?}")))?;
        Ok(())
    }

    fn feed(&mut self, au: &AccessUnit) -> Result<Vec<DecodedFrame>, EngineError> {
        let pts_us = utils::time_us();
        let before_feed = Instant::now();

        let buffer = gst::Buffer::from_slice(au.data.clone());
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| EngineError::Pipeline(format!("access unit push rejected: {e:?}")))?;
        if self.first_submit_us.is_none() {
            self.first_submit_us = Some(pts_us);
            debug!("first access unit submitted at t+{}us", pts_us);
        }

        // Lockstep: wait (bounded) for the frame belonging to this
        // access unit, then drain whatever else is already queued
        // without waiting.
        let mut out = Vec::new();
        let mut sample = None;
        for _ in 0..PULL_ATTEMPTS {
            if let Some(s) = self.appsink.try_pull_sample(PULL_WAIT) {
                sample = Some(s);
                break;
            }
        }

        if let Some(sample) = sample {
            self.decode_wait.add(before_feed.elapsed());
            metrics::histogram!("decode_wait_us")
                .record(before_feed.elapsed().as_micros() as f64);
            if self.decode_wait.time_since_last_log() > Duration::from_secs(3) {
                debug!("avg decode wait: {}", self.decode_wait.average_readable());
                self.decode_wait.set_last_log();
                self.decode_wait.reset();
            }

            if self.converter.update_from_sample(&sample)? {
                self.handle_parameters_changed();
            }
            if let Some(frame) = self.converter.convert(&sample, pts_us)? {
                out.push(frame);
            }
            while let Some(extra) = self.appsink.try_pull_sample(gst::ClockTime::ZERO) {
                if self.converter.update_from_sample(&extra)? {
                    self.handle_parameters_changed();
                }
                if let Some(frame) = self.converter.convert(&extra, pts_us)? {
                    out.push(frame);
                }
            }
        }

        if let Some(err) = self.check_bus_error() {
            return Err(err);
        }
        Ok(out)
    }

    fn kind(&self) -> &'static str {
        "HW"
    }
}

impl Drop for HardwareEngine {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("failed to stop decode pipeline: {:?}", e);
        }
    }
}

/// Detect the best available hardware decoder (NVDEC > VA-API > V4L2).
fn detect_hw_decoder(codec: VideoCodec) -> Option<&'static str> {
    let candidates: &[&'static str] = match codec {
        VideoCodec::H264 => &["nvh264dec", "vaapih264dec", "v4l2h264dec"],
        VideoCodec::H265 => &["nvh265dec", "vaapih265dec", "v4l2h265dec"],
    };
    for candidate in candidates {
        if let Some(factory) = gst::ElementFactory::find(candidate) {
            debug!(
                "found decoder: {} - {}",
                candidate,
                factory.metadata("long-name").unwrap_or("")
            );
            return Some(candidate);
        }
    }
    None
}

fn build_pipeline_string(config: &StreamConfig, decoder: &str) -> String {
    let (src_caps, parser) = match config.codec {
        VideoCodec::H264 => (
            "video/x-h264,stream-format=byte-stream,alignment=au",
            "h264parse",
        ),
        VideoCodec::H265 => (
            "video/x-h265,stream-format=byte-stream,alignment=au",
            "h265parse",
        ),
    };

    // VA-API can hand us importable single-plane DMA-BUFs through its
    // post-processor; V4L2 emits multi-plane DMA-BUFs (readback path),
    // NVDEC stays in system memory.
    let tail = if decoder.starts_with("vaapi") {
        "vaapipostproc ! appsink name=sink caps=\"video/x-raw(memory:DMABuf),format=(string){ BGRA, NV12 };video/x-raw,format=(string){ NV12, I420 }\""
            .to_string()
    } else if decoder.starts_with("v4l2") {
        "appsink name=sink caps=\"video/x-raw(memory:DMABuf),format=(string){ NV12, I420 };video/x-raw,format=(string){ NV12, I420, Y42B }\""
            .to_string()
    } else {
        "appsink name=sink caps=\"video/x-raw,format=(string){ NV12, I420, Y42B }\"".to_string()
    };

    format!(
        "appsrc name=src is-live=true format=time do-timestamp=true caps={src_caps} ! \
         {parser} ! \
         {decoder} ! \
         {tail}"
    )
}

pub(crate) fn launch(
    pipeline_str: &str,
) -> Result<(gst::Pipeline, gst_app::AppSrc, gst_app::AppSink), EngineError> {
    let pipeline = gst::parse::launch(pipeline_str)
        .map_err(|e| EngineError::Unavailable(format!("pipeline parse: {e}")))?
        .downcast::<gst::Pipeline>()
        .map_err(|_| EngineError::Unavailable("not a pipeline".into()))?;

    let appsrc = pipeline
        .by_name("src")
        .ok_or_else(|| EngineError::Unavailable("no appsrc element".into()))?
        .downcast::<gst_app::AppSrc>()
        .map_err(|_| EngineError::Unavailable("src is not an appsrc".into()))?;

    let appsink = pipeline
        .by_name("sink")
        .ok_or_else(|| EngineError::Unavailable("no appsink element".into()))?
        .downcast::<gst_app::AppSink>()
        .map_err(|_| EngineError::Unavailable("sink is not an appsink".into()))?;

    Ok((pipeline, appsrc, appsink))
}

pub(crate) fn configure_appsink(appsink: &gst_app::AppSink) {
    appsink.set_property("emit-signals", false);
    appsink.set_property("max-buffers", POOL_FRAME_HEADROOM);
    // Drop old buffers if we can't keep up
    appsink.set_property("drop", true);
    // Don't sync to clock for lowest latency
    appsink.set_property("sync", false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_string_selects_parser_by_codec() {
        let mut config = StreamConfig::default();
        let s = build_pipeline_string(&config, "nvh264dec");
        assert!(s.contains("h264parse"));
        assert!(s.contains("nvh264dec"));

        config.codec = VideoCodec::H265;
        let s = build_pipeline_string(&config, "v4l2h265dec");
        assert!(s.contains("h265parse"));
        assert!(s.contains("memory:DMABuf"));
    }

    #[test]
    fn vaapi_pipeline_requests_importable_output() {
        let config = StreamConfig::default();
        let s = build_pipeline_string(&config, "vaapih264dec");
        assert!(s.contains("vaapipostproc"));
        assert!(s.contains("BGRA"));
    }
}
