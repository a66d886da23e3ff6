//! Software decode fallback.
//!
//! Same uniform contract as the hardware backend, but the post-feed
//! poll is non-blocking: one access unit in, at most one frame out,
//! and if no frame is ready yet we return immediately instead of
//! spinning. Keeps latency bounded on platforms without an accelerator.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info, warn};

use crate::decode::convert::SampleConverter;
use crate::decode::engine::{DecodeEngine, EngineError};
use crate::decode::frame::DecodedFrame;
use crate::decode::hardware::{configure_appsink, launch};
use crate::source::AccessUnit;
use crate::utils;
use crate::{StreamConfig, VideoCodec};

pub struct SoftwareEngine {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    converter: SampleConverter,
}

impl SoftwareEngine {
    pub fn new(config: &StreamConfig) -> Result<Self, EngineError> {
        gst::init().map_err(|e| EngineError::Unavailable(format!("gstreamer init: {e}")))?;

        let (src_caps, parser, decoder) = match config.codec {
            VideoCodec::H264 => (
                "video/x-h264,stream-format=byte-stream,alignment=au",
                "h264parse",
                "avdec_h264",
            ),
            VideoCodec::H265 => (
                "video/x-h265,stream-format=byte-stream,alignment=au",
                "h265parse",
                "avdec_h265",
            ),
        };
        if gst::ElementFactory::find(decoder).is_none() {
            return Err(EngineError::Unavailable(format!(
                "software decoder {decoder} not installed"
            )));
        }
        info!("using software decoder: {}", decoder);

        let pipeline_str = format!(
            "appsrc name=src is-live=true format=time do-timestamp=true caps={src_caps} ! \
             {parser} ! \
             {decoder} ! \
             appsink name=sink caps=\"video/x-raw,format=(string){{ I420, Y42B, NV12 }}\""
        );
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
        })
    }
}

impl DecodeEngine for SoftwareEngine {
    fn feed_config(&mut self, data: &[u8]) -> Result<(), EngineError> {
        let buffer = gst::Buffer::from_slice(data.to_vec());
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| EngineError::Pipeline(format!("config push rejected: {e:?}")))?;
        Ok(())
    }

    fn feed(&mut self, au: &AccessUnit) -> Result<Vec<DecodedFrame>, EngineError> {
        let pts_us = utils::time_us();

        let buffer = gst::Buffer::from_slice(au.data.clone());
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| EngineError::Pipeline(format!("access unit push rejected: {e:?}")))?;

        // Exactly one poll, zero timeout. The frame for this access
        // unit usually surfaces on the feed of the next one.
        let Some(sample) = self.appsink.try_pull_sample(gst::ClockTime::ZERO) else {
            return Ok(Vec::new());
        };

        if self.converter.update_from_sample(&sample)? {
            if let Some(info) = self.converter.video_info() {
                info!(
                    "software decoder renegotiated: {}x{} {:?}",
                    info.width(),
                    info.height(),
                    info.format()
                );
            }
        }
        match self.converter.convert(&sample, pts_us)? {
            Some(frame) => Ok(vec![frame]),
            None => Ok(Vec::new()),
        }
    }

    fn kind(&self) -> &'static str {
        "SW"
    }
}

impl Drop for SoftwareEngine {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("failed to stop decode pipeline: {:?}", e);
        }
    }
}
