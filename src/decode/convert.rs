//! Normalization of GStreamer samples into [`DecodedFrame`]s.
//!
//! Both decode backends produce `gst::Sample`s; this module maps them
//! onto the pixel-layout tags the compositor dispatches on. DMA-BUF
//! backed surfaces keep their fd (duplicated), everything else is
//! copied once, stride-aware, into tightly packed planes.

use std::os::fd::{FromRawFd, OwnedFd};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_allocators::DmaBufMemory;
use gstreamer_video as gst_video;
use tracing::{debug, warn};

use crate::decode::engine::EngineError;
use crate::decode::frame::{
    DecodedFrame, DmaBufFrame, DmaBufPlane, PixelLayout, Plane,
};

const DMABUF_CAPS_FEATURE: &str = "memory:DMABuf";

/// Caches the negotiated caps and video info, and converts samples.
#[derive(Default)]
pub(crate) struct SampleConverter {
    caps: Option<gst::Caps>,
    info: Option<gst_video::VideoInfo>,
    dmabuf: bool,
}

impl SampleConverter {
    /// Refresh the cached caps from a sample. Returns true when the
    /// decoder renegotiated ("parameters changed").
    pub fn update_from_sample(&mut self, sample: &gst::Sample) -> Result<bool, EngineError> {
        let caps = sample
            .caps()
            .ok_or_else(|| EngineError::Pipeline("sample without caps".into()))?;
        if self.caps.as_deref() == Some(caps) {
            return Ok(false);
        }
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| EngineError::Pipeline(format!("unreadable caps: {e}")))?;
        self.dmabuf = caps
            .features(0)
            .is_some_and(|f| f.contains(DMABUF_CAPS_FEATURE));
        let changed = self.caps.is_some();
        self.caps = Some(caps.to_owned());
        self.info = Some(info);
        Ok(changed)
    }

    pub fn video_info(&self) -> Option<&gst_video::VideoInfo> {
        self.info.as_ref()
    }

    /// Convert one sample. Returns None when the frame had to be
    /// dropped (allocation failure, unsupported layout) - decoding
    /// continues in that case.
    pub fn convert(
        &self,
        sample: &gst::Sample,
        pts_us: i64,
    ) -> Result<Option<DecodedFrame>, EngineError> {
        let info = self
            .info
            .as_ref()
            .ok_or_else(|| EngineError::Pipeline("no negotiated caps".into()))?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| EngineError::Pipeline("sample without buffer".into()))?;

        if self.dmabuf {
            return Ok(self.dmabuf_frame(buffer, info, pts_us));
        }
        self.mapped_frame(buffer, info, pts_us)
    }

    /// Wrap a DMA-BUF backed buffer without copying pixel data. Only
    /// single-plane RGB layouts can be imported directly into the GPU;
    /// everything else goes through the readback path.
    fn dmabuf_frame(
        &self,
        buffer: &gst::BufferRef,
        info: &gst_video::VideoInfo,
        pts_us: i64,
    ) -> Option<DecodedFrame> {
        let memory = buffer.peek_memory(0);
        let Some(dmabuf) = memory.downcast_memory_ref::<DmaBufMemory>() else {
            warn!("caps advertise DMABuf but memory is not dmabuf backed, dropping frame");
            return None;
        };

        // Duplicate the fd so the frame outlives the decoder's pool.
        let fd = unsafe { libc::dup(dmabuf.fd()) };
        if fd < 0 {
            warn!("dup() of dmabuf fd failed, dropping frame");
            return None;
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let (offsets, strides) = match buffer.meta::<gst_video::VideoMeta>() {
            Some(meta) => (meta.offset().to_vec(), meta.stride().to_vec()),
            None => (info.offset().to_vec(), info.stride().to_vec()),
        };
        // The offset/stride arrays are fixed-size; only the format's
        // actual planes are meaningful.
        let planes = offsets
            .iter()
            .zip(strides.iter())
            .take(info.n_planes() as usize)
            .map(|(&offset, &stride)| DmaBufPlane {
                offset: offset as u64,
                stride: stride as u32,
            })
            .collect::<Vec<_>>();

        let format = info.format();
        let layout = match format {
            gst_video::VideoFormat::Bgra
            | gst_video::VideoFormat::Rgba
            | gst_video::VideoFormat::Bgrx => PixelLayout::OpaqueGpu,
            // Multi-plane YUV needs a CPU readback before upload
            _ => PixelLayout::HwReadback,
        };

        let frame = DmaBufFrame {
            fd,
            fourcc: drm_fourcc(format),
            // Non-linear layouts do not negotiate through these caps
            modifier: 0,
            planes,
            size: memory.size(),
        };
        Some(DecodedFrame::new_dmabuf(
            info.width(),
            info.height(),
            pts_us,
            layout,
            frame,
        ))
    }

    /// Copy a system-memory sample into tightly packed planes.
    fn mapped_frame(
        &self,
        buffer: &gst::BufferRef,
        info: &gst_video::VideoInfo,
        pts_us: i64,
    ) -> Result<Option<DecodedFrame>, EngineError> {
        let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, info)
            .map_err(|e| EngineError::Pipeline(format!("buffer map failed: {e}")))?;
        let width = info.width();
        let height = info.height();

        let plane = |idx: u32, row_bytes: usize, rows: usize| -> Result<Plane, EngineError> {
            let data = frame
                .plane_data(idx)
                .map_err(|e| EngineError::Pipeline(format!("plane {idx} unavailable: {e}")))?;
            let stride = info.stride()[idx as usize] as usize;
            Ok(Plane::copy_strided(data, stride, row_bytes, rows))
        };

        let decoded = match info.format() {
            gst_video::VideoFormat::I420 => {
                let (cw, ch) = (width.div_ceil(2) as usize, height.div_ceil(2) as usize);
                DecodedFrame::new_planar(
                    width,
                    height,
                    pts_us,
                    PixelLayout::Yuv420p,
                    [
                        plane(0, width as usize, height as usize)?,
                        plane(1, cw, ch)?,
                        plane(2, cw, ch)?,
                    ],
                )
            }
            gst_video::VideoFormat::Y42b => {
                let cw = width.div_ceil(2) as usize;
                DecodedFrame::new_planar(
                    width,
                    height,
                    pts_us,
                    PixelLayout::Yuv422p,
                    [
                        plane(0, width as usize, height as usize)?,
                        plane(1, cw, height as usize)?,
                        plane(2, cw, height as usize)?,
                    ],
                )
            }
            gst_video::VideoFormat::Nv12 => {
                let (cw, ch) = (width.div_ceil(2) as usize, height.div_ceil(2) as usize);
                DecodedFrame::new_nv12(
                    width,
                    height,
                    pts_us,
                    plane(0, width as usize, height as usize)?,
                    // Interleaved UV pairs, two bytes per chroma sample
                    plane(1, cw * 2, ch)?,
                )
            }
            other => {
                debug!("unsupported decoder output format {:?}, dropping frame", other);
                return Ok(None);
            }
        };
        Ok(Some(decoded))
    }
}

/// DRM fourcc for the formats the opaque import path can see.
fn drm_fourcc(format: gst_video::VideoFormat) -> u32 {
    let code: &[u8; 4] = match format {
        gst_video::VideoFormat::Bgra => b"AR24",
        gst_video::VideoFormat::Bgrx => b"XR24",
        gst_video::VideoFormat::Rgba => b"AB24",
        gst_video::VideoFormat::Nv12 => b"NV12",
        _ => b"    ",
    };
    u32::from_le_bytes(*code)
}
