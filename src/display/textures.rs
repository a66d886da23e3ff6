//! GPU texture sets for the three upload paths.
//!
//! One set per pixel-layout family: planar YUV (three single-channel
//! textures), NV12 (luma + interleaved chroma) and an imported external
//! texture for opaque hardware surfaces. Whichever set holds valid
//! content gets drawn; a set is invalidated whenever a frame of a
//! different family arrives.

use std::borrow::Cow;

use wgpu::util::DeviceExt;

use crate::decode::frame::{chroma_dimensions, DecodedFrame, Plane, PixelLayout};

/// Shared GPU objects every texture set binds against.
pub struct GpuShared {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub bind_group_layout: wgpu::BindGroupLayout,
    pub uniform_buffer: wgpu::Buffer,
    pub samp_nearest: wgpu::Sampler,
    pub samp_linear: wgpu::Sampler,
    /// 1x1 stand-in for unused plane slots
    dummy_view: wgpu::TextureView,
}

impl GpuShared {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("video bind group layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                texture_entry(1),
                texture_entry(2),
                texture_entry(3),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 5,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("video view uniform"),
            contents: &[0u8; 16],
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let samp_nearest = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("video sampler nearest"),
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            ..Default::default()
        });
        let samp_linear = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("video sampler linear"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            ..Default::default()
        });

        let dummy = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("video dummy plane"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::R8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let dummy_view = dummy.create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            device,
            queue,
            bind_group_layout,
            uniform_buffer,
            samp_nearest,
            samp_linear,
            dummy_view,
        }
    }

    fn bind_group<'a>(&'a self, label: &str, views: [Option<&'a wgpu::TextureView>; 3]) -> wgpu::BindGroup {
        let view = |v: Option<&'a wgpu::TextureView>| v.unwrap_or(&self.dummy_view);
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(view(views[0])),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(view(views[1])),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(view(views[2])),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: wgpu::BindingResource::Sampler(&self.samp_nearest),
                },
                wgpu::BindGroupEntry {
                    binding: 5,
                    resource: wgpu::BindingResource::Sampler(&self.samp_linear),
                },
            ],
        })
    }

    fn plane_texture(&self, label: &str, width: u32, height: u32, format: wgpu::TextureFormat) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    fn write_plane(&self, texture: &wgpu::Texture, plane: &Plane, width: u32, height: u32) {
        // Decoder-side padding never leaks into the image: the declared
        // bytes_per_row is the plane's stride, the copy width is the
        // logical width.
        let (bytes_per_row, data) = pad_rows(&plane.data, plane.stride, height);
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
    }
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

/// wgpu requires bytes_per_row aligned to 256; pad each row when the
/// plane stride is not already aligned.
pub fn pad_rows(data: &[u8], stride: usize, rows: u32) -> (u32, Cow<'_, [u8]>) {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize;
    let aligned = (stride + align - 1) & !(align - 1);
    if aligned == stride {
        return (stride as u32, Cow::Borrowed(data));
    }
    let mut padded = vec![0u8; aligned * rows as usize];
    for row in 0..rows as usize {
        let src = row * stride;
        let src_end = (src + stride).min(data.len());
        if src >= src_end {
            break;
        }
        padded[row * aligned..row * aligned + (src_end - src)]
            .copy_from_slice(&data[src..src_end]);
    }
    (aligned as u32, Cow::Owned(padded))
}

/// Three single-channel planes (YUV 4:2:0 / 4:2:2).
pub struct PlanarTextures {
    y: wgpu::Texture,
    u: wgpu::Texture,
    v: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    width: u32,
    height: u32,
    layout: PixelLayout,
    pub valid: bool,
}

impl PlanarTextures {
    fn allocate(shared: &GpuShared, width: u32, height: u32, layout: PixelLayout) -> Self {
        let (cw, ch) = chroma_dimensions(layout, width, height);
        let y = shared.plane_texture("video y plane", width, height, wgpu::TextureFormat::R8Unorm);
        let u = shared.plane_texture("video u plane", cw, ch, wgpu::TextureFormat::R8Unorm);
        let v = shared.plane_texture("video v plane", cw, ch, wgpu::TextureFormat::R8Unorm);
        let bind_group = shared.bind_group(
            "video planar bind group",
            [
                Some(&y.create_view(&Default::default())),
                Some(&u.create_view(&Default::default())),
                Some(&v.create_view(&Default::default())),
            ],
        );
        Self {
            y,
            u,
            v,
            bind_group,
            width,
            height,
            layout,
            valid: false,
        }
    }

    /// Upload a planar frame, reallocating the textures when the
    /// geometry or subsampling changed.
    pub fn upload(
        slot: &mut Option<Self>,
        shared: &GpuShared,
        frame: &DecodedFrame,
        planes: &[Plane; 3],
    ) {
        let needs_realloc = slot.as_ref().is_none_or(|t| {
            t.width != frame.width || t.height != frame.height || t.layout != frame.layout
        });
        if needs_realloc {
            *slot = Some(Self::allocate(shared, frame.width, frame.height, frame.layout));
        }
        let set = slot.as_mut().unwrap();
        let (cw, ch) = chroma_dimensions(frame.layout, frame.width, frame.height);
        shared.write_plane(&set.y, &planes[0], frame.width, frame.height);
        shared.write_plane(&set.u, &planes[1], cw, ch);
        shared.write_plane(&set.v, &planes[2], cw, ch);
        set.valid = true;
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }
}

/// Luma plane + interleaved UV plane at half resolution.
pub struct Nv12Textures {
    y: wgpu::Texture,
    uv: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    width: u32,
    height: u32,
    pub valid: bool,
}

impl Nv12Textures {
    fn allocate(shared: &GpuShared, width: u32, height: u32) -> Self {
        let (cw, ch) = chroma_dimensions(PixelLayout::Nv12, width, height);
        let y = shared.plane_texture("video nv12 y plane", width, height, wgpu::TextureFormat::R8Unorm);
        let uv = shared.plane_texture("video nv12 uv plane", cw, ch, wgpu::TextureFormat::Rg8Unorm);
        let bind_group = shared.bind_group(
            "video nv12 bind group",
            [
                Some(&y.create_view(&Default::default())),
                Some(&uv.create_view(&Default::default())),
                None,
            ],
        );
        Self {
            y,
            uv,
            bind_group,
            width,
            height,
            valid: false,
        }
    }

    pub fn upload(
        slot: &mut Option<Self>,
        shared: &GpuShared,
        frame: &DecodedFrame,
        y: &Plane,
        uv: &Plane,
    ) {
        let needs_realloc = slot
            .as_ref()
            .is_none_or(|t| t.width != frame.width || t.height != frame.height);
        if needs_realloc {
            *slot = Some(Self::allocate(shared, frame.width, frame.height));
        }
        let set = slot.as_mut().unwrap();
        let (cw, ch) = chroma_dimensions(PixelLayout::Nv12, frame.width, frame.height);
        shared.write_plane(&set.y, y, frame.width, frame.height);
        shared.write_plane(&set.uv, uv, cw, ch);
        set.valid = true;
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }
}

/// An imported opaque hardware surface. The previous texture and the
/// native frame backing it are only released once a newer import has
/// succeeded, so an import failure never interrupts the display.
#[derive(Default)]
pub struct ExternalTexture {
    bind_group: Option<wgpu::BindGroup>,
    /// The imported texture references the native frame's memory, so
    /// the frame must stay alive as long as the texture is in use.
    _native_frame: Option<DecodedFrame>,
    pub valid: bool,
}

impl ExternalTexture {
    pub fn replace(&mut self, shared: &GpuShared, texture: wgpu::Texture, frame: DecodedFrame) {
        let view = texture.create_view(&Default::default());
        // Old texture and its native frame are freed here, after the
        // new import succeeded.
        self.bind_group = Some(shared.bind_group("video external bind group", [Some(&view), None, None]));
        self._native_frame = Some(frame);
        self.valid = true;
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn release(&mut self) {
        self.bind_group = None;
        self._native_frame = None;
        self.valid = false;
    }

    pub fn bind_group(&self) -> Option<&wgpu::BindGroup> {
        self.bind_group.as_ref()
    }
}

/// Solid-color 1280x720 placeholder textures, drawn alternating before
/// any real frame has arrived (developer aid).
pub struct PlaceholderTextures {
    pub green: wgpu::BindGroup,
    pub blue: wgpu::BindGroup,
}

impl PlaceholderTextures {
    pub fn new(shared: &GpuShared) -> Self {
        Self {
            green: Self::solid(shared, "video placeholder green", [0, 255, 0, 255]),
            blue: Self::solid(shared, "video placeholder blue", [0, 0, 255, 255]),
        }
    }

    fn solid(shared: &GpuShared, label: &str, rgba: [u8; 4]) -> wgpu::BindGroup {
        const W: u32 = 1280;
        const H: u32 = 720;
        let texture = shared.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: W,
                height: H,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let pixels: Vec<u8> = rgba.iter().copied().cycle().take((W * H * 4) as usize).collect();
        shared.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &pixels,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(W * 4),
                rows_per_image: Some(H),
            },
            wgpu::Extent3d {
                width: W,
                height: H,
                depth_or_array_layers: 1,
            },
        );
        let view = texture.create_view(&Default::default());
        shared.bind_group(label, [Some(&view), None, None])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_rows_borrows_when_aligned() {
        let data = vec![7u8; 256 * 4];
        let (bpr, padded) = pad_rows(&data, 256, 4);
        assert_eq!(bpr, 256);
        assert!(matches!(padded, Cow::Borrowed(_)));
    }

    #[test]
    fn pad_rows_pads_unaligned_strides() {
        let data: Vec<u8> = (0..100u8).collect();
        let (bpr, padded) = pad_rows(&data, 50, 2);
        assert_eq!(bpr, 256);
        assert_eq!(padded.len(), 512);
        assert_eq!(&padded[..50], &data[..50]);
        assert_eq!(&padded[256..306], &data[50..100]);
        // padding bytes are zeroed
        assert!(padded[50..256].iter().all(|&b| b == 0));
    }
}
