//! Texture upload and composition on the render thread.
//!
//! Runs once per host render tick: drains the frame mailbox, uploads
//! the frame into the texture set selected by its pixel layout and
//! draws whichever set currently holds valid content. Never blocks and
//! never panics on the steady-state path; when no frame has ever
//! arrived it can draw alternating placeholder frames as a dev aid.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::decode::frame::{DecodedFrame, FrameStorage, PixelLayout};
use crate::display::external::{self, ImportError};
use crate::display::textures::{
    ExternalTexture, GpuShared, Nv12Textures, PlaceholderTextures, PlanarTextures,
};
use crate::display::viewport::{calculate_viewport, rotated_dimensions};
use crate::pipeline::mailbox::FrameMailbox;
use crate::utils::{self, RollingAverage};
use crate::SettingsHandle;

struct GpuState {
    shared: GpuShared,
    pipeline_planar: wgpu::RenderPipeline,
    pipeline_nv12: wgpu::RenderPipeline,
    pipeline_rgba: wgpu::RenderPipeline,
    planar: Option<PlanarTextures>,
    nv12: Option<Nv12Textures>,
    external: ExternalTexture,
    placeholders: PlaceholderTextures,
}

/// Which texture set a new upload landed in; everything else gets
/// invalidated so a stale set never outranks the fresh one.
#[derive(Clone, Copy, PartialEq)]
enum SetKind {
    Planar,
    Nv12,
    External,
}

pub struct VideoCompositor {
    mailbox: Arc<FrameMailbox>,
    settings: SettingsHandle,
    gpu: Option<GpuState>,
    viewport_size: (u32, u32),
    clear_requested: AtomicBool,
    /// Dimensions of the video currently on screen
    current_video: Option<(u32, u32)>,
    render_count: u64,
    rendered_frames: u64,
    decode_render_latency: RollingAverage,
}

impl VideoCompositor {
    /// The mailbox reference is handed over explicitly at construction;
    /// there is no ambient lookup of the active renderer.
    pub fn new(mailbox: Arc<FrameMailbox>, settings: SettingsHandle) -> Self {
        Self {
            mailbox,
            settings,
            gpu: None,
            viewport_size: (0, 0),
            clear_requested: AtomicBool::new(false),
            current_video: None,
            render_count: 0,
            rendered_frames: 0,
            decode_render_latency: RollingAverage::default(),
        }
    }

    /// Called once per graphics context creation, on the render thread.
    pub fn init_gpu(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        adapter_info: &wgpu::AdapterInfo,
        target_format: wgpu::TextureFormat,
    ) {
        if self.gpu.is_some() {
            return;
        }
        if adapter_info.device_type == wgpu::DeviceType::Cpu {
            info!("graphics backend is a software rasterizer ({})", adapter_info.name);
        } else {
            info!(
                "graphics backend: {} ({:?})",
                adapter_info.name, adapter_info.backend
            );
        }

        let shared = GpuShared::new(device.clone(), queue.clone());
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("video shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("video.wgsl").into()),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("video pipeline layout"),
            bind_group_layouts: &[&shared.bind_group_layout],
            push_constant_ranges: &[],
        });

        let make_pipeline = |entry_point: &str, label: &str| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                cache: None,
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    compilation_options: Default::default(),
                    buffers: &[],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some(entry_point),
                    compilation_options: Default::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: target_format,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            })
        };

        let placeholders = PlaceholderTextures::new(&shared);
        self.gpu = Some(GpuState {
            pipeline_planar: make_pipeline("fs_planar", "video pipeline planar"),
            pipeline_nv12: make_pipeline("fs_nv12", "video pipeline nv12"),
            pipeline_rgba: make_pipeline("fs_rgba", "video pipeline rgba"),
            planar: None,
            nv12: None,
            external: ExternalTexture::default(),
            placeholders,
            shared,
        });
    }

    /// Called once per host synchronization point with the current
    /// window size in pixels.
    pub fn sync(&mut self, width: u32, height: u32) {
        self.viewport_size = (width, height);
    }

    /// On the next tick only: discard any pending mailbox frame, mark
    /// all texture sets invalid and reset the frame counters. Used when
    /// switching away from the GPU-texture decode path entirely.
    pub fn clear_all_video_textures_next_frame(&self) {
        self.clear_requested.store(true, Ordering::Release);
    }

    /// Draw into the host-supplied target. Called once per frame inside
    /// the host's render pass window; viewport state is confined to the
    /// pass recorded here so host-owned drawing is unaffected.
    pub fn render(&mut self, target: &wgpu::TextureView, rotation_degrees: u32) {
        let render_start = std::time::Instant::now();
        self.render_count += 1;

        if self.gpu.is_none() {
            return;
        }

        if self.clear_requested.swap(false, Ordering::AcqRel) {
            self.mailbox.clear();
            let gpu = self.gpu.as_mut().unwrap();
            if let Some(planar) = gpu.planar.as_mut() {
                planar.valid = false;
            }
            if let Some(nv12) = gpu.nv12.as_mut() {
                nv12.valid = false;
            }
            gpu.external.release();
            self.mailbox.reset_stats();
            self.rendered_frames = 0;
            self.decode_render_latency.reset();
            self.current_video = None;
            debug!("video textures cleared");
        }

        if let Some(frame) = self.mailbox.take() {
            self.upload(&frame);
        }

        let generic = self.settings.load().generic.clone();
        let gpu = self.gpu.as_ref().unwrap();

        // Viewport from the current video's dimensions, swapped when
        // the display is rotated by a quarter turn.
        let viewport = self.current_video.map(|(w, h)| {
            let (w, h) = rotated_dimensions(w, h, rotation_degrees);
            calculate_viewport(
                self.viewport_size.0,
                self.viewport_size.1,
                w,
                h,
                generic.scale_to_fit,
            )
        });

        let quadrant = (rotation_degrees / 90) % 4;
        gpu.shared
            .queue
            .write_buffer(&gpu.shared.uniform_buffer, 0, &quadrant.to_le_bytes());

        // Fixed priority: opaque > nv12 > planar > placeholder
        let placeholder;
        let (pipeline, bind_group) = if gpu.external.valid {
            (&gpu.pipeline_rgba, gpu.external.bind_group().unwrap())
        } else if gpu.nv12.as_ref().is_some_and(|t| t.valid) {
            (&gpu.pipeline_nv12, gpu.nv12.as_ref().unwrap().bind_group())
        } else if gpu.planar.as_ref().is_some_and(|t| t.valid) {
            (&gpu.pipeline_planar, gpu.planar.as_ref().unwrap().bind_group())
        } else if generic.dev_draw_placeholder_frames {
            placeholder = if self.render_count % 2 == 0 {
                &gpu.placeholders.blue
            } else {
                &gpu.placeholders.green
            };
            (&gpu.pipeline_rgba, placeholder)
        } else {
            return;
        };

        let mut encoder = gpu
            .shared
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("video render encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("video render pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        // Host content outside the viewport stays intact
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            if let Some(vp) = viewport {
                if vp.width > 0 && vp.height > 0 {
                    pass.set_viewport(
                        vp.x as f32,
                        vp.y as f32,
                        vp.width as f32,
                        vp.height as f32,
                        0.0,
                        1.0,
                    );
                }
            }
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        gpu.shared.queue.submit(std::iter::once(encoder.finish()));

        metrics::histogram!("render_time_us").record(render_start.elapsed().as_micros() as f64);
    }

    /// Number of frames that actually reached the screen.
    pub fn rendered_frames(&self) -> u64 {
        self.rendered_frames
    }

    fn upload(&mut self, frame: &DecodedFrame) {
        let uploaded = match (&frame.layout, &frame.storage) {
            (PixelLayout::Yuv420p | PixelLayout::Yuv422p, FrameStorage::Planar { planes }) => {
                let gpu = self.gpu.as_mut().unwrap();
                PlanarTextures::upload(&mut gpu.planar, &gpu.shared, frame, planes);
                Some(SetKind::Planar)
            }
            (PixelLayout::Nv12, FrameStorage::SemiPlanar { y, uv }) => {
                let gpu = self.gpu.as_mut().unwrap();
                Nv12Textures::upload(&mut gpu.nv12, &gpu.shared, frame, y, uv);
                Some(SetKind::Nv12)
            }
            (PixelLayout::OpaqueGpu, FrameStorage::Dmabuf(dmabuf)) => {
                let gpu = self.gpu.as_mut().unwrap();
                match external::import_dmabuf(
                    &gpu.shared.device,
                    dmabuf,
                    frame.width,
                    frame.height,
                ) {
                    Ok(texture) => {
                        // The previous import and its native frame are
                        // released inside replace(), only now that the
                        // new import succeeded.
                        gpu.external.replace(&gpu.shared, texture, frame.clone());
                        Some(SetKind::External)
                    }
                    Err(ImportError::NotVulkan) | Err(ImportError::Unsupported(_)) => {
                        // Import path unavailable: one explicit
                        // download, then the ordinary planar path.
                        self.readback_upload(frame)
                    }
                    Err(e) => {
                        warn!("dmabuf import failed ({}), keeping previous texture", e);
                        None
                    }
                }
            }
            (PixelLayout::HwReadback, FrameStorage::Dmabuf(_)) => self.readback_upload(frame),
            (layout, _) => {
                warn!("no upload path for {} frame, skipping", layout);
                None
            }
        };

        let Some(uploaded) = uploaded else {
            return;
        };
        let gpu = self.gpu.as_mut().unwrap();
        if uploaded != SetKind::Planar {
            if let Some(planar) = gpu.planar.as_mut() {
                planar.valid = false;
            }
        }
        if uploaded != SetKind::Nv12 {
            if let Some(nv12) = gpu.nv12.as_mut() {
                nv12.valid = false;
            }
        }
        if uploaded != SetKind::External {
            gpu.external.invalidate();
        }

        self.current_video = Some((frame.width, frame.height));
        self.rendered_frames += 1;

        let latency_us = utils::time_us() - frame.pts_us;
        self.decode_render_latency
            .add(Duration::from_micros(latency_us.max(0) as u64));
        metrics::histogram!("decode_and_render_us").record(latency_us.max(0) as f64);
        if self.decode_render_latency.time_since_last_log() > Duration::from_secs(3) {
            debug!(
                "avg decode-and-render latency: {}, {} dropped",
                self.decode_render_latency.average_readable(),
                self.mailbox.dropped()
            );
            self.decode_render_latency.set_last_log();
            self.decode_render_latency.reset();
        }
    }

    fn readback_upload(&mut self, frame: &DecodedFrame) -> Option<SetKind> {
        let FrameStorage::Dmabuf(dmabuf) = &frame.storage else {
            return None;
        };
        let planes = external::readback_nv12_to_planar(dmabuf, frame.width, frame.height)?;
        let gpu = self.gpu.as_mut().unwrap();
        // Readback surfaces proceed as planar YUV 4:2:0
        let as_planar = DecodedFrame::new_planar(
            frame.width,
            frame.height,
            frame.pts_us,
            PixelLayout::Yuv420p,
            planes,
        );
        let FrameStorage::Planar { planes } = &as_planar.storage else {
            unreachable!()
        };
        PlanarTextures::upload(&mut gpu.planar, &gpu.shared, &as_planar, planes);
        Some(SetKind::Planar)
    }
}
