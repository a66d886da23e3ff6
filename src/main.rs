//! Kestrel ground station video pipeline.
//!
//! Hosts the compositor in a winit/wgpu window: decode supervisor on
//! its own thread, texture upload and draw once per redraw.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use kestrel::{DecodeSupervisor, FrameMailbox, SettingsHandle, StreamConfig, VideoCompositor};
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("kestrel=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Kestrel launching...");

    let config = load_config()?;
    info!(
        "stream: {} {}:{} (sw={})",
        config.codec.as_str(),
        config.input_ip,
        config.input_port,
        config.force_software_decode
    );
    let settings = kestrel::settings_handle(config);

    let mailbox = Arc::new(FrameMailbox::new());
    let supervisor = DecodeSupervisor::start(settings.clone(), mailbox.clone());
    let compositor = VideoCompositor::new(mailbox, settings.clone());

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);
    let mut app = KestrelApp {
        settings,
        supervisor,
        compositor,
        gpu: None,
    };
    event_loop.run_app(&mut app)?;

    app.supervisor.terminate();
    if let Some(format) = app.supervisor.last_video_format() {
        info!("last video format: {}", format);
    }
    info!("Kestrel shutting down");
    Ok(())
}

/// TOML file next to the binary plus KESTREL_* environment overrides.
fn load_config() -> Result<StreamConfig> {
    let loaded = config::Config::builder()
        .add_source(config::File::with_name("kestrel").required(false))
        .add_source(config::Environment::with_prefix("KESTREL").separator("__"))
        .build()?;
    Ok(loaded.try_deserialize().unwrap_or_default())
}

struct WindowGpu {
    window: Arc<Window>,
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface_config: wgpu::SurfaceConfiguration,
}

struct KestrelApp {
    settings: SettingsHandle,
    supervisor: DecodeSupervisor,
    compositor: VideoCompositor,
    gpu: Option<WindowGpu>,
}

impl KestrelApp {
    fn init_window(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Arc::new(
            event_loop.create_window(
                Window::default_attributes()
                    .with_title("Kestrel")
                    .with_inner_size(PhysicalSize::new(1280u32, 720u32)),
            )?,
        );

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let surface = instance.create_surface(window.clone())?;
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| eyre!("no suitable GPU adapter found"))?;
        info!("GPU: {}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("kestrel device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
            },
            None,
        ))?;

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .unwrap_or(caps.formats[0]);
        let size = window.inner_size();
        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 1,
        };
        surface.configure(&device, &surface_config);

        self.compositor
            .init_gpu(&device, &queue, &adapter.get_info(), format);
        self.gpu = Some(WindowGpu {
            window,
            surface,
            device,
            queue,
            surface_config,
        });
        Ok(())
    }

    fn redraw(&mut self) {
        let Some(gpu) = self.gpu.as_mut() else {
            return;
        };
        let frame = match gpu.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                gpu.surface.configure(&gpu.device, &gpu.surface_config);
                return;
            }
            Err(e) => {
                error!("surface error: {}", e);
                return;
            }
        };
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        // Host-owned clear, the compositor loads on top of it
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("host clear encoder"),
            });
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("host clear pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        gpu.queue.submit(std::iter::once(encoder.finish()));

        self.compositor
            .sync(gpu.surface_config.width, gpu.surface_config.height);
        let rotation = self.settings.load().generic.screen_rotation;
        self.compositor.render(&view, rotation);
        frame.present();
    }
}

impl ApplicationHandler for KestrelApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.gpu.is_none() {
            if let Err(e) = self.init_window(event_loop) {
                error!("window initialization failed: {:#}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                info!("window close requested");
                event_loop.exit();
            }
            WindowEvent::Resized(new_size) => {
                if let Some(gpu) = self.gpu.as_mut() {
                    gpu.surface_config.width = new_size.width.max(1);
                    gpu.surface_config.height = new_size.height.max(1);
                    gpu.surface.configure(&gpu.device, &gpu.surface_config);
                }
            }
            WindowEvent::RedrawRequested => {
                self.redraw();
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(gpu) = self.gpu.as_ref() {
            gpu.window.request_redraw();
        }
    }
}
