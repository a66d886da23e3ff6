//! Opaque hardware surface handling on the render thread.
//!
//! Two paths out of a DMA-BUF frame: direct import into the GPU
//! through Vulkan external memory (no pixel copy), or an explicit
//! readback of the mapping into system memory as planar YUV for
//! surfaces the import path cannot express.

use std::ffi::CStr;
use std::os::fd::AsRawFd;

use ash::vk;
use thiserror::Error;
use tracing::{debug, warn};

use crate::decode::frame::{DmaBufFrame, Plane};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("device is not using the Vulkan backend")]
    NotVulkan,
    #[error("import not supported: {0}")]
    Unsupported(String),
    #[error("vulkan error: {0}")]
    Vulkan(String),
}

const EXT_EXTERNAL_MEMORY_DMA_BUF: &CStr = c"VK_EXT_external_memory_dma_buf";
const KHR_EXTERNAL_MEMORY_FD: &CStr = c"VK_KHR_external_memory_fd";

/// wgpu texture format for the DRM fourccs the import path accepts.
fn formats_for_fourcc(fourcc: u32) -> Option<(vk::Format, wgpu::TextureFormat)> {
    match &fourcc.to_le_bytes() {
        b"AR24" | b"XR24" => Some((vk::Format::B8G8R8A8_UNORM, wgpu::TextureFormat::Bgra8Unorm)),
        b"AB24" => Some((vk::Format::R8G8B8A8_UNORM, wgpu::TextureFormat::Rgba8Unorm)),
        _ => None,
    }
}

/// Frees the raw Vulkan objects once wgpu drops the wrapping texture.
struct ImportGuard {
    device: ash::Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
}

impl Drop for ImportGuard {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Import a single-plane linear DMA-BUF as a wgpu texture without a
/// CPU copy. The frame's fd is duplicated; Vulkan owns the duplicate.
pub fn import_dmabuf(
    device: &wgpu::Device,
    frame: &DmaBufFrame,
    width: u32,
    height: u32,
) -> Result<wgpu::Texture, ImportError> {
    let (vk_format, wgpu_format) = formats_for_fourcc(frame.fourcc)
        .ok_or_else(|| ImportError::Unsupported(format!("fourcc {:#x}", frame.fourcc)))?;
    if frame.planes.len() != 1 {
        return Err(ImportError::Unsupported(
            "multi-plane surface needs readback".into(),
        ));
    }
    let plane = frame.planes[0];
    if plane.offset != 0 || frame.modifier != 0 {
        // Only linear, zero-offset layouts bind correctly without the
        // DRM modifier extension.
        return Err(ImportError::Unsupported("non-linear plane layout".into()));
    }

    let hal_texture = unsafe {
        device.as_hal::<wgpu::hal::api::Vulkan, _, Result<wgpu::hal::vulkan::Texture, ImportError>>(
            |hal_device| {
                let hal_device = hal_device.ok_or(ImportError::NotVulkan)?;

                let extensions = hal_device.enabled_device_extensions();
                if !extensions.contains(&EXT_EXTERNAL_MEMORY_DMA_BUF)
                    || !extensions.contains(&KHR_EXTERNAL_MEMORY_FD)
                {
                    return Err(ImportError::Unsupported(
                        "VK_EXT_external_memory_dma_buf not enabled".into(),
                    ));
                }

                let raw_device = hal_device.raw_device();
                let instance = hal_device.shared_instance().raw_instance();
                let physical_device = hal_device.raw_physical_device();

                let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
                    .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
                let image_info = vk::ImageCreateInfo::default()
                    .image_type(vk::ImageType::TYPE_2D)
                    .format(vk_format)
                    .extent(vk::Extent3D {
                        width,
                        height,
                        depth: 1,
                    })
                    .mip_levels(1)
                    .array_layers(1)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .tiling(vk::ImageTiling::LINEAR)
                    .usage(vk::ImageUsageFlags::SAMPLED)
                    .sharing_mode(vk::SharingMode::EXCLUSIVE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .push_next(&mut external_info);

                let image = raw_device
                    .create_image(&image_info, None)
                    .map_err(|e| ImportError::Vulkan(format!("vkCreateImage: {e:?}")))?;

                let requirements = raw_device.get_image_memory_requirements(image);
                let memory_type = find_memory_type(
                    instance,
                    physical_device,
                    requirements.memory_type_bits,
                )
                .ok_or_else(|| {
                    raw_device.destroy_image(image, None);
                    ImportError::Unsupported("no importable memory type".into())
                })?;

                // Vulkan takes ownership of the fd on success, so hand
                // it a duplicate.
                let fd = libc::dup(frame.fd.as_raw_fd());
                if fd < 0 {
                    raw_device.destroy_image(image, None);
                    return Err(ImportError::Vulkan("dup() failed".into()));
                }

                let mut import_info = vk::ImportMemoryFdInfoKHR::default()
                    .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
                    .fd(fd);
                let alloc_info = vk::MemoryAllocateInfo::default()
                    .allocation_size(requirements.size)
                    .memory_type_index(memory_type)
                    .push_next(&mut import_info);

                let memory = raw_device.allocate_memory(&alloc_info, None).map_err(|e| {
                    libc::close(fd);
                    raw_device.destroy_image(image, None);
                    ImportError::Vulkan(format!("vkAllocateMemory: {e:?}"))
                })?;

                raw_device.bind_image_memory(image, memory, 0).map_err(|e| {
                    raw_device.free_memory(memory, None);
                    raw_device.destroy_image(image, None);
                    ImportError::Vulkan(format!("vkBindImageMemory: {e:?}"))
                })?;

                let mut guard = Some(ImportGuard {
                    device: raw_device.clone(),
                    image,
                    memory,
                });
                let hal_desc = wgpu::hal::TextureDescriptor {
                    label: Some("video external dmabuf"),
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu_format,
                    usage: wgpu::hal::TextureUses::RESOURCE,
                    memory_flags: wgpu::hal::MemoryFlags::empty(),
                    view_formats: vec![],
                };
                Ok(wgpu::hal::vulkan::Device::texture_from_raw(
                    image,
                    &hal_desc,
                    Some(Box::new(move || {
                        guard.take();
                    })),
                ))
            },
        )
        .ok_or(ImportError::NotVulkan)?
    };

    let texture = unsafe {
        device.create_texture_from_hal::<wgpu::hal::api::Vulkan>(
            hal_texture?,
            &wgpu::TextureDescriptor {
                label: Some("video external dmabuf"),
                size: wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu_format,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            },
        )
    };
    debug!("imported {}x{} dmabuf frame", width, height);
    Ok(texture)
}

fn find_memory_type(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    type_bits: u32,
) -> Option<u32> {
    let properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
    (0..properties.memory_type_count).find(|&i| type_bits & (1 << i) != 0)
}

/// Read a hardware NV12 surface back into system memory as planar YUV.
/// One explicit download, then the frame proceeds through the ordinary
/// planar upload path.
pub fn readback_nv12_to_planar(
    frame: &DmaBufFrame,
    width: u32,
    height: u32,
) -> Option<[Plane; 3]> {
    if frame.planes.len() < 2 {
        warn!("readback surface has {} planes, expected 2", frame.planes.len());
        return None;
    }
    let mapping = match unsafe {
        memmap2::MmapOptions::new()
            .len(frame.size)
            .map(frame.fd.as_raw_fd())
    } {
        Ok(mapping) => mapping,
        Err(e) => {
            warn!("dmabuf mapping failed ({}), dropping frame", e);
            return None;
        }
    };

    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (width.div_ceil(2) as usize, height.div_ceil(2) as usize);
    let y_plane = frame.planes[0];
    let uv_plane = frame.planes[1];
    let y_end = y_plane.offset as usize + (h - 1) * y_plane.stride as usize + w;
    let uv_end = uv_plane.offset as usize + (ch - 1) * uv_plane.stride as usize + cw * 2;
    if mapping.len() < y_end.max(uv_end) {
        warn!("dmabuf mapping smaller than frame geometry, dropping frame");
        return None;
    }

    let y = Plane::copy_strided(
        &mapping[y_plane.offset as usize..],
        y_plane.stride as usize,
        w,
        h,
    );

    // Deinterleave the UV pairs into separate planes
    let mut u = vec![0u8; cw * ch];
    let mut v = vec![0u8; cw * ch];
    let uv_base = uv_plane.offset as usize;
    for row in 0..ch {
        let src = &mapping[uv_base + row * uv_plane.stride as usize..];
        for col in 0..cw {
            u[row * cw + col] = src[col * 2];
            v[row * cw + col] = src[col * 2 + 1];
        }
    }

    Some([
        y,
        Plane {
            data: u.into(),
            stride: cw,
        },
        Plane {
            data: v.into(),
            stride: cw,
        },
    ])
}
