// SPDX-License-Identifier: CEPL-1.0
//! Per-frame GPU work: one solid-colour staging buffer copied into the
//! acquired image, then handed to the presentation engine.
use ash::khr::swapchain;
use ash::vk;
use tracing::debug;

use crate::error::{GpuError, GpuResult};
use crate::swapchain::Swapchain;
use crate::sync::{AcquiredImage, FrameDevice};

/// Every format [`pack_pixel`] accepts is 8 bits per channel.
const BYTES_PER_PIXEL: vk::DeviceSize = 4;

/// Packs a linear RGBA colour into the byte order of `format`, or `None` when
/// `format` is not an 8-bit four-channel layout the staging copy can fill.
///
/// sRGB formats get the sRGB transfer curve on their colour channels, so a
/// copy yields the same result as clearing an sRGB attachment would.
pub fn pack_pixel(format: vk::Format, rgba: [f32; 4]) -> Option<[u8; 4]> {
    let (srgb, bgra) = match format {
        vk::Format::B8G8R8A8_SRGB => (true, true),
        vk::Format::B8G8R8A8_UNORM => (false, true),
        vk::Format::R8G8B8A8_SRGB | vk::Format::A8B8G8R8_SRGB_PACK32 => (true, false),
        // A8B8G8R8 packs alpha into the high byte, so memory order is RGBA
        vk::Format::R8G8B8A8_UNORM | vk::Format::A8B8G8R8_UNORM_PACK32 => (false, false),
        _ => return None,
    };
    let encode = |c: f32| -> u8 {
        let c = c.clamp(0.0, 1.0);
        let c = if srgb {
            if c <= 0.003_130_8 {
                c * 12.92
            } else {
                1.055 * c.powf(1.0 / 2.4) - 0.055
            }
        } else {
            c
        };
        (c * 255.0).round() as u8
    };
    let [r, g, b, a] = rgba;
    let (r, g, b) = (encode(r), encode(g), encode(b));
    let a = (a.clamp(0.0, 1.0) * 255.0).round() as u8;

    Some(if bgra { [b, g, r, a] } else { [r, g, b, a] })
}

/// [`pack_pixel`] for a swap chain that is about to be filled; an unpackable
/// format fails swap chain setup instead of uploading wrongly sized texels.
pub fn staging_pixel(format: vk::Format, rgba: [f32; 4]) -> GpuResult<[u8; 4]> {
    pack_pixel(format, rgba).ok_or(GpuError::SwapchainCreation(
        vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
    ))
}

pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    wanted: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0 && props.memory_types[i as usize].property_flags.contains(wanted)
    })
}

pub struct Commands {
    pub pool: vk::CommandPool,
    pub buffers: Vec<vk::CommandBuffer>,
}

impl Commands {
    /// One resettable primary command buffer per frame slot.
    ///
    /// # Safety
    /// `queue_family` must belong to `device`.
    pub unsafe fn create(device: &ash::Device, queue_family: u32, slots: usize) -> GpuResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(GpuError::submit("vkCreateCommandPool"))?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(slots as u32);
        match unsafe { device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => Ok(Self { pool, buffers }),
            Err(e) => {
                unsafe { device.destroy_command_pool(pool, None) };
                Err(GpuError::Submit {
                    what: "vkAllocateCommandBuffers",
                    result: e,
                })
            }
        }
    }

    /// # Safety
    /// No buffer from the pool may be pending execution.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        // destroying the pool frees its buffers
        unsafe { device.destroy_command_pool(self.pool, None) };
        self.pool = vk::CommandPool::null();
        self.buffers.clear();
    }
}

/// Host-visible buffer holding one full frame of a single colour.
pub struct StagingBuffer {
    pub buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

impl StagingBuffer {
    /// # Safety
    /// `device` must be created from `physical`.
    pub unsafe fn create(
        instance: &ash::Instance,
        physical: vk::PhysicalDevice,
        device: &ash::Device,
        extent: vk::Extent2D,
        pixel: [u8; 4],
    ) -> GpuResult<Self> {
        let size = vk::DeviceSize::from(extent.width)
            * vk::DeviceSize::from(extent.height)
            * BYTES_PER_PIXEL;

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None) }
            .map_err(GpuError::submit("vkCreateBuffer"))?;

        let req = unsafe { device.get_buffer_memory_requirements(buffer) };
        let props = unsafe { instance.get_physical_device_memory_properties(physical) };
        let Some(type_index) = find_memory_type(
            &props,
            req.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ) else {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(GpuError::Submit {
                what: "staging memory type lookup",
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            });
        };

        let alloc = vk::MemoryAllocateInfo::default()
            .allocation_size(req.size)
            .memory_type_index(type_index);
        let memory = match unsafe { device.allocate_memory(&alloc, None) } {
            Ok(m) => m,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(GpuError::submit("vkAllocateMemory")(e));
            }
        };

        let mut staging = Self {
            buffer,
            memory,
            size,
        };
        let filled = unsafe { device.bind_buffer_memory(buffer, memory, 0) }
            .map_err(GpuError::submit("vkBindBufferMemory"))
            .and_then(|()| unsafe { staging.fill(device, pixel) });
        if let Err(e) = filled {
            unsafe { staging.destroy(device) };
            return Err(e);
        }

        debug!(
            "vk: staging buffer {}x{} ({} bytes)",
            extent.width, extent.height, size
        );
        Ok(staging)
    }

    /// Overwrites every pixel with `pixel`.
    ///
    /// # Safety
    /// No pending copy may read the buffer.
    pub unsafe fn fill(&mut self, device: &ash::Device, pixel: [u8; 4]) -> GpuResult<()> {
        let pixels = vec![pixel; (self.size / BYTES_PER_PIXEL) as usize];
        let bytes: &[u8] = bytemuck::cast_slice(&pixels);

        let ptr = unsafe {
            device.map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
        }
        .map_err(GpuError::submit("vkMapMemory"))?;
        // SAFETY: the mapping covers `size` bytes and `bytes` has exactly that length.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// # Safety
    /// No pending copy may read the buffer.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

/// [`FrameDevice`] over the live Vulkan objects of one frame.
pub struct VkFrameDevice<'a> {
    pub device: &'a ash::Device,
    pub swapchain_loader: &'a swapchain::Device,
    pub swapchain: &'a Swapchain,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub commands: &'a Commands,
    pub staging: &'a StagingBuffer,
}

impl VkFrameDevice<'_> {
    unsafe fn record(&self, cmd: vk::CommandBuffer, image: vk::Image) -> Result<(), vk::Result> {
        let d = self.device;
        unsafe {
            d.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            d.begin_command_buffer(cmd, &begin)?;

            // previous contents are discarded
            let to_transfer = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(color_range());
            d.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&to_transfer),
            );

            let region = vk::BufferImageCopy::default()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1),
                )
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width: self.swapchain.extent().width,
                    height: self.swapchain.extent().height,
                    depth: 1,
                });
            d.cmd_copy_buffer_to_image(
                cmd,
                self.staging.buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            );

            let to_present = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::empty())
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(color_range());
            d.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&to_present),
            );

            d.end_command_buffer(cmd)
        }
    }
}

impl FrameDevice for VkFrameDevice<'_> {
    fn wait_for_fence(&mut self, fence: vk::Fence) -> GpuResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
            .map_err(GpuError::submit("vkWaitForFences"))
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> GpuResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }.map_err(GpuError::submit("vkResetFences"))
    }

    fn acquire_next_image(&mut self, signal: vk::Semaphore) -> GpuResult<AcquiredImage> {
        let (index, suboptimal) = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain.handle,
                u64::MAX,
                signal,
                vk::Fence::null(),
            )
        }
        .map_err(GpuError::Acquire)?;
        Ok(AcquiredImage { index, suboptimal })
    }

    fn submit(
        &mut self,
        slot: usize,
        image: u32,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> GpuResult<()> {
        let cmd = self.commands.buffers[slot];
        let target = self.swapchain.images[image as usize];
        unsafe { self.record(cmd, target) }.map_err(GpuError::submit("command recording"))?;

        let waits = [wait];
        let stages = [vk::PipelineStageFlags::TRANSFER];
        let cmds = [cmd];
        let signals = [signal];
        let info = vk::SubmitInfo::default()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signals);
        unsafe {
            self.device
                .queue_submit(self.graphics_queue, std::slice::from_ref(&info), fence)
        }
        .map_err(GpuError::submit("vkQueueSubmit"))
    }

    fn present(&mut self, image: u32, wait: vk::Semaphore) -> GpuResult<bool> {
        let waits = [wait];
        let swapchains = [self.swapchain.handle];
        let indices = [image];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        unsafe { self.swapchain_loader.queue_present(self.present_queue, &info) }
            .map_err(GpuError::Present)
    }

    fn wait_present_idle(&mut self) -> GpuResult<()> {
        unsafe { self.device.queue_wait_idle(self.present_queue) }
            .map_err(GpuError::submit("vkQueueWaitIdle"))
    }
}
