// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with optional validation layer
// - Window surface creation
// - Physical device selection (queue families, swapchain support, GPU type)
// - Logical device + queue creation
// - Memory type lookup for manual allocations

use anyhow::{Context, Result};
use ash::extensions::{ext::DebugUtils, khr};
use ash::vk::Handle;
use ash::{vk, Entry};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{CStr, CString};
use std::sync::Arc;
use thiserror::Error;
use winit::window::Window;

use super::debug::{DebugBridge, DebugStats};
use super::surface::SurfaceSupport;

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("There are no Vulkan capable devices")]
    NoVulkanDevice,
    #[error("There is no suitable device")]
    NoSuitableDevice,
    #[error("{0} layer is not present")]
    MissingLayer(String),
    #[error("Failed to find suitable memory type (filter {filter:#x}, flags {flags:?})")]
    NoMemoryType {
        filter: u32,
        flags: vk::MemoryPropertyFlags,
    },
}

/// Device creation settings
#[derive(Debug, Clone)]
pub struct DeviceDesc {
    pub app_name: String,
    pub enable_validation: bool,
    /// Request sampler anisotropy if the device has it.
    pub sampler_anisotropy: bool,
}

/// Queue family indices for graphics and presentation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Scan families in order, keeping the first graphics-capable family
    /// and the first family that can present.
    ///
    /// `supports_present[i]` says whether family `i` can present to the surface.
    pub fn find(families: &[vk::QueueFamilyProperties], supports_present: &[bool]) -> Self {
        let mut indices = Self::default();

        for (i, family) in families.iter().enumerate() {
            let index = i as u32;
            if indices.graphics.is_none()
                && family.queue_count > 0
                && family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            {
                indices.graphics = Some(index);
            }
            if indices.present.is_none() && supports_present.get(i).copied().unwrap_or(false) {
                indices.present = Some(index);
            }
            if indices.is_complete() {
                break;
            }
        }

        indices
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Distinct family indices, for queue creation.
    pub fn unique(&self) -> Vec<u32> {
        let mut families: Vec<u32> = self.graphics.into_iter().chain(self.present).collect();
        families.dedup();
        families
    }
}

/// Everything selection needs to know about one physical device.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: QueueFamilyIndices,
    pub extensions: Vec<String>,
}

impl PhysicalDeviceInfo {
    fn query(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
        handle: vk::PhysicalDevice,
    ) -> Result<Self> {
        unsafe {
            let properties = instance.get_physical_device_properties(handle);
            let features = instance.get_physical_device_features(handle);
            let memory_properties = instance.get_physical_device_memory_properties(handle);
            let families = instance.get_physical_device_queue_family_properties(handle);

            let supports_present = (0..families.len() as u32)
                .map(|i| surface_loader.get_physical_device_surface_support(handle, i, surface))
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to query present support")?;

            let extensions = instance
                .enumerate_device_extension_properties(handle)
                .context("Failed to enumerate device extensions")?
                .iter()
                .map(|ext| {
                    CStr::from_ptr(ext.extension_name.as_ptr())
                        .to_string_lossy()
                        .into_owned()
                })
                .collect();

            Ok(Self {
                handle,
                name: CStr::from_ptr(properties.device_name.as_ptr())
                    .to_string_lossy()
                    .into_owned(),
                properties,
                features,
                memory_properties,
                queue_families: QueueFamilyIndices::find(&families, &supports_present),
                extensions,
            })
        }
    }

    pub fn supports_extension(&self, name: &CStr) -> bool {
        let name = name.to_string_lossy();
        self.extensions.iter().any(|ext| *ext == name)
    }

    /// Selection score. Negative means unusable; discrete GPUs rank above
    /// integrated ones, which rank above everything else.
    pub fn rate(&self, required_extensions: &[&CStr]) -> i32 {
        if !self.queue_families.is_complete() {
            return -1;
        }
        if !required_extensions
            .iter()
            .all(|ext| self.supports_extension(ext))
        {
            return -1;
        }

        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 0,
        }
    }

    /// Highest sample count usable for both color and depth attachments,
    /// capped at `max_samples`.
    pub fn max_usable_sample_count(&self, max_samples: u32) -> vk::SampleCountFlags {
        let limits = &self.properties.limits;
        max_sample_count(
            limits.framebuffer_color_sample_counts & limits.framebuffer_depth_sample_counts,
            max_samples,
        )
    }
}

/// Pick the highest scoring candidate. Ties keep the earlier one; a
/// negative best score means nothing is usable.
pub fn pick_best<T>(
    candidates: impl IntoIterator<Item = T>,
    mut score: impl FnMut(&T) -> i32,
) -> Result<T, DeviceError> {
    let mut best: Option<(i32, T)> = None;
    let mut seen = 0usize;

    for candidate in candidates {
        seen += 1;
        let candidate_score = score(&candidate);
        if best
            .as_ref()
            .map_or(true, |(best_score, _)| candidate_score > *best_score)
        {
            best = Some((candidate_score, candidate));
        }
    }

    match best {
        None if seen == 0 => Err(DeviceError::NoVulkanDevice),
        Some((best_score, candidate)) if best_score >= 0 => Ok(candidate),
        _ => Err(DeviceError::NoSuitableDevice),
    }
}

/// Highest single sample-count bit in `supported`, no greater than `max_samples`.
pub fn max_sample_count(supported: vk::SampleCountFlags, max_samples: u32) -> vk::SampleCountFlags {
    const COUNTS: [(u32, vk::SampleCountFlags); 7] = [
        (64, vk::SampleCountFlags::TYPE_64),
        (32, vk::SampleCountFlags::TYPE_32),
        (16, vk::SampleCountFlags::TYPE_16),
        (8, vk::SampleCountFlags::TYPE_8),
        (4, vk::SampleCountFlags::TYPE_4),
        (2, vk::SampleCountFlags::TYPE_2),
        (1, vk::SampleCountFlags::TYPE_1),
    ];

    COUNTS
        .iter()
        .find(|(count, flag)| *count <= max_samples && supported.contains(*flag))
        .map(|&(_, flag)| flag)
        .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

/// Index of the first memory type allowed by `type_filter` that has all of `flags`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    flags: vk::MemoryPropertyFlags,
) -> Result<u32, DeviceError> {
    memory_properties.memory_types[..memory_properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .find(|(i, memory_type)| {
            type_filter & (1 << i) != 0 && memory_type.property_flags.contains(flags)
        })
        .map(|(i, _)| i as u32)
        .ok_or(DeviceError::NoMemoryType {
            filter: type_filter,
            flags,
        })
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical: PhysicalDeviceInfo,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue_family: u32,
    /// Whether sampler anisotropy was enabled on the logical device.
    pub sampler_anisotropy: bool,

    pub surface: vk::SurfaceKHR,
    pub surface_loader: khr::Surface,
    debug: Option<DebugBridge>,
    pub instance: ash::Instance,
    _entry: Entry,
}

impl VulkanDevice {
    /// Create the instance, surface and logical device for `window`.
    pub fn new(window: &Window, desc: &DeviceDesc) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", desc.app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance, with the debug messenger chained so
        // instance creation itself is covered
        let debug_stats = desc.enable_validation.then(Box::<DebugStats>::default);
        let instance = Self::create_instance(&entry, window, desc, debug_stats.as_deref())?;

        // Step 3: Install the persistent debug messenger
        let debug = match debug_stats {
            Some(stats) => Some(DebugBridge::new(&entry, &instance, stats)?),
            None => None,
        };

        // Step 4: Create window surface
        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;
        let surface_loader = khr::Surface::new(&entry, &instance);

        // Step 5: Pick physical device (GPU)
        let physical = Self::pick_physical_device(&instance, &surface_loader, surface)?;
        let graphics_queue_family = physical
            .queue_families
            .graphics
            .ok_or(DeviceError::NoSuitableDevice)?;
        let present_queue_family = physical
            .queue_families
            .present
            .ok_or(DeviceError::NoSuitableDevice)?;

        log::info!("Selected GPU: {}", physical.name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(physical.properties.api_version),
            vk::api_version_minor(physical.properties.api_version),
            vk::api_version_patch(physical.properties.api_version)
        );

        // Step 6: Create logical device
        let sampler_anisotropy =
            desc.sampler_anisotropy && physical.features.sampler_anisotropy == vk::TRUE;
        let device = Self::create_logical_device(&instance, &physical, sampler_anisotropy)?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_queue_family, 0) };

        Ok(Arc::new(Self {
            device,
            physical,
            graphics_queue,
            present_queue,
            graphics_queue_family,
            present_queue_family,
            sampler_anisotropy,
            surface,
            surface_loader,
            debug,
            instance,
            _entry: entry,
        }))
    }

    fn create_instance(
        entry: &Entry,
        window: &Window,
        desc: &DeviceDesc,
        debug_stats: Option<&DebugStats>,
    ) -> Result<ash::Instance> {
        let app_name = CString::new(desc.app_name.as_str())?;
        let engine_name = c"No Engine";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        // Surface extensions for this platform's windowing system
        let mut extensions = ash_window::enumerate_required_extensions(window.raw_display_handle())
            .context("Failed to query required surface extensions")?
            .to_vec();

        let mut layer_names = Vec::new();
        if desc.enable_validation {
            Self::check_layer_support(entry, VALIDATION_LAYER)?;
            layer_names.push(VALIDATION_LAYER.as_ptr());
            extensions.push(DebugUtils::name().as_ptr());
        }

        let mut debug_info = debug_stats.map(DebugStats::messenger_create_info);

        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);
        if let Some(debug_info) = debug_info.as_mut() {
            create_info = create_info.push_next(debug_info);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn check_layer_support(entry: &Entry, layer: &CStr) -> Result<()> {
        let available = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;

        let present = available
            .iter()
            .any(|props| unsafe { CStr::from_ptr(props.layer_name.as_ptr()) } == layer);

        if !present {
            return Err(DeviceError::MissingLayer(layer.to_string_lossy().into_owned()).into());
        }
        Ok(())
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<PhysicalDeviceInfo> {
        let handles = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;
        if handles.is_empty() {
            return Err(DeviceError::NoVulkanDevice.into());
        }

        let required_extensions = [khr::Swapchain::name()];
        let mut candidates = Vec::with_capacity(handles.len());

        for handle in handles {
            let info = PhysicalDeviceInfo::query(instance, surface_loader, surface, handle)?;

            // Surface checks only make sense once the swapchain extension is known
            let surface_ok = info.supports_extension(khr::Swapchain::name())
                && SurfaceSupport::query(surface_loader, handle, surface)?.is_adequate();

            let score = if surface_ok {
                info.rate(&required_extensions)
            } else {
                -1
            };
            log::debug!("GPU candidate {} scored {}", info.name, score);
            candidates.push((score, info));
        }

        let (_, best) = pick_best(candidates, |(score, _)| *score)?;
        Ok(best)
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical: &PhysicalDeviceInfo,
        sampler_anisotropy: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = physical
            .queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(sampler_anisotropy)
            .build();

        let extensions = [khr::Swapchain::name().as_ptr()];

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical.handle, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    pub fn find_memory_type(
        &self,
        type_filter: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<u32, DeviceError> {
        find_memory_type(&self.physical.memory_properties, type_filter, flags)
    }

    pub fn surface_support(&self) -> Result<SurfaceSupport> {
        SurfaceSupport::query(&self.surface_loader, self.physical.handle, self.surface)
    }

    /// Debug bridge, present only with validation enabled.
    pub fn debug(&self) -> Option<&DebugBridge> {
        self.debug.as_ref()
    }

    /// Name `handle` for validation messages and capture tools. No-op
    /// without validation.
    pub fn set_object_name<H: Handle>(&self, handle: H, name: &str) -> Result<()> {
        match &self.debug {
            Some(debug) => debug.set_object_name(self.device.handle(), handle, name),
            None => Ok(()),
        }
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

/// One step of `VulkanDevice` teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Device,
    Surface,
    Messenger,
    Instance,
    DebugStats,
}

/// The instance reports into the debug counters until it is destroyed.
const TEARDOWN_ORDER: [Teardown; 5] = [
    Teardown::Device,
    Teardown::Surface,
    Teardown::Messenger,
    Teardown::Instance,
    Teardown::DebugStats,
];

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        for step in TEARDOWN_ORDER {
            match step {
                Teardown::Device => unsafe { self.device.destroy_device(None) },
                Teardown::Surface => unsafe {
                    self.surface_loader.destroy_surface(self.surface, None)
                },
                Teardown::Messenger => {
                    if let Some(debug) = self.debug.as_mut() {
                        debug.destroy_messenger();
                    }
                }
                Teardown::Instance => unsafe { self.instance.destroy_instance(None) },
                Teardown::DebugStats => drop(self.debug.take()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    fn info(device_type: vk::PhysicalDeviceType, families: QueueFamilyIndices) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            handle: vk::PhysicalDevice::null(),
            name: format!("{device_type:?}"),
            properties: vk::PhysicalDeviceProperties {
                device_type,
                ..Default::default()
            },
            features: Default::default(),
            memory_properties: Default::default(),
            queue_families: families,
            extensions: vec!["VK_KHR_swapchain".to_string()],
        }
    }

    const COMPLETE: QueueFamilyIndices = QueueFamilyIndices {
        graphics: Some(0),
        present: Some(0),
    };

    #[test]
    fn queue_families_take_first_match_of_each_kind() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS),
        ];
        let indices = QueueFamilyIndices::find(&families, &[false, false, true]);
        assert_eq!(indices.graphics, Some(1));
        assert_eq!(indices.present, Some(2));
        assert_eq!(indices.unique(), vec![1, 2]);

        let shared = QueueFamilyIndices::find(&families, &[false, true, true]);
        assert_eq!(shared.unique(), vec![1]);
    }

    #[test]
    fn queue_families_can_be_incomplete() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        let indices = QueueFamilyIndices::find(&families, &[true]);
        assert!(!indices.is_complete());
        assert_eq!(indices.present, Some(0));
    }

    #[test]
    fn rating_prefers_discrete_then_integrated() {
        let required = [khr::Swapchain::name()];
        assert_eq!(info(vk::PhysicalDeviceType::DISCRETE_GPU, COMPLETE).rate(&required), 1000);
        assert_eq!(info(vk::PhysicalDeviceType::INTEGRATED_GPU, COMPLETE).rate(&required), 100);
        assert_eq!(info(vk::PhysicalDeviceType::CPU, COMPLETE).rate(&required), 0);
    }

    #[test]
    fn rating_rejects_missing_queues_or_extensions() {
        let required = [khr::Swapchain::name()];
        let no_present = QueueFamilyIndices {
            graphics: Some(0),
            present: None,
        };
        assert!(info(vk::PhysicalDeviceType::DISCRETE_GPU, no_present).rate(&required) < 0);

        let mut no_swapchain = info(vk::PhysicalDeviceType::DISCRETE_GPU, COMPLETE);
        no_swapchain.extensions.clear();
        assert!(no_swapchain.rate(&required) < 0);
    }

    #[test]
    fn pick_best_keeps_first_on_ties() {
        let picked = pick_best(vec![("a", 100), ("b", 1000), ("c", 1000)], |c| c.1).unwrap();
        assert_eq!(picked.0, "b");
    }

    #[test]
    fn pick_best_reports_why_nothing_was_picked() {
        let none: Vec<i32> = vec![];
        assert_eq!(pick_best(none, |s| *s), Err(DeviceError::NoVulkanDevice));
        assert_eq!(pick_best(vec![-1, -1], |s| *s), Err(DeviceError::NoSuitableDevice));
        assert_eq!(pick_best(vec![-1, 0], |s| *s), Ok(0));
    }

    #[test]
    fn sample_count_is_capped_by_config_and_support() {
        let supported = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4
            | vk::SampleCountFlags::TYPE_8;
        assert_eq!(max_sample_count(supported, 64), vk::SampleCountFlags::TYPE_8);
        assert_eq!(max_sample_count(supported, 4), vk::SampleCountFlags::TYPE_4);
        assert_eq!(max_sample_count(supported, 3), vk::SampleCountFlags::TYPE_2);
        assert_eq!(max_sample_count(supported, 1), vk::SampleCountFlags::TYPE_1);
        assert_eq!(
            max_sample_count(vk::SampleCountFlags::empty(), 8),
            vk::SampleCountFlags::TYPE_1
        );
    }

    #[test]
    fn usable_samples_intersect_color_and_depth() {
        let mut device = info(vk::PhysicalDeviceType::DISCRETE_GPU, COMPLETE);
        device.properties.limits.framebuffer_color_sample_counts =
            vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_4 | vk::SampleCountFlags::TYPE_8;
        device.properties.limits.framebuffer_depth_sample_counts =
            vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_4;
        assert_eq!(device.max_usable_sample_count(8), vk::SampleCountFlags::TYPE_4);
    }

    #[test]
    fn memory_type_must_match_filter_and_flags() {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::HOST_CACHED;

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&props, 0b111, host), Ok(1));
        assert_eq!(find_memory_type(&props, 0b100, host), Ok(2));
        assert_eq!(
            find_memory_type(&props, 0b001, host),
            Err(DeviceError::NoMemoryType {
                filter: 0b001,
                flags: host
            })
        );
    }

    #[test]
    fn debug_counters_outlive_the_instance() {
        let position = |step| TEARDOWN_ORDER.iter().position(|s| *s == step).unwrap();
        assert!(position(Teardown::Device) < position(Teardown::Instance));
        assert!(position(Teardown::Surface) < position(Teardown::Instance));
        assert!(position(Teardown::Messenger) < position(Teardown::Instance));
        assert!(position(Teardown::Instance) < position(Teardown::DebugStats));
        assert_eq!(TEARDOWN_ORDER.last(), Some(&Teardown::DebugStats));
    }

    #[test]
    fn memory_types_past_the_count_are_ignored() {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 1,
            ..Default::default()
        };
        props.memory_types[1].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert!(find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL).is_err());
    }
}
