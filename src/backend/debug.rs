// Validation layer bridge
//
// The debug-utils callback is a plain function pointer. Its user data points
// at a boxed `DebugStats`, which lives as long as the instance does and
// counts what the layers reported. The same extension provides command
// buffer labels and object names for capture tools.

use anyhow::{Context, Result};
use ash::extensions::ext::DebugUtils;
use ash::vk::Handle;
use ash::{vk, Entry};
use std::ffi::{c_void, CStr, CString};
use std::sync::atomic::{AtomicU32, Ordering};

/// Message counters shared with the debug callback.
#[derive(Debug, Default)]
pub struct DebugStats {
    warnings: AtomicU32,
    errors: AtomicU32,
}

impl DebugStats {
    pub fn warnings(&self) -> u32 {
        self.warnings.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u32 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Messenger settings pointing at this counter object.
    ///
    /// The returned struct borrows `self` through a raw pointer, so `self`
    /// must stay alive (and unmoved) until both the messenger and any
    /// instance created with this info are destroyed.
    pub fn messenger_create_info(&self) -> vk::DebugUtilsMessengerCreateInfoEXT {
        vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback))
            .user_data(self as *const DebugStats as *mut c_void)
            .build()
    }
}

/// Installed debug messenger plus the counters it writes to.
pub struct DebugBridge {
    loader: DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
    stats: Box<DebugStats>,
}

impl DebugBridge {
    /// Register the messenger. `stats` must be the same box whose
    /// create info was chained into instance creation, if any.
    pub fn new(entry: &Entry, instance: &ash::Instance, stats: Box<DebugStats>) -> Result<Self> {
        let loader = DebugUtils::new(entry, instance);
        let create_info = stats.messenger_create_info();

        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok(Self {
            loader,
            messenger,
            stats,
        })
    }

    /// Destroy the messenger but keep the counters.
    ///
    /// The messenger chained into instance creation keeps reporting into
    /// the counters until the instance is gone, so the bridge itself must
    /// outlive the instance.
    pub fn destroy_messenger(&mut self) {
        if self.messenger != vk::DebugUtilsMessengerEXT::null() {
            unsafe {
                self.loader
                    .destroy_debug_utils_messenger(self.messenger, None);
            }
            self.messenger = vk::DebugUtilsMessengerEXT::null();
        }
    }

    pub fn begin_label(&self, cmd: vk::CommandBuffer, name: &CStr, color: LabelColor) {
        let label = label(name, color);
        unsafe { self.loader.cmd_begin_debug_utils_label(cmd, &label) };
    }

    pub fn end_label(&self, cmd: vk::CommandBuffer) {
        unsafe { self.loader.cmd_end_debug_utils_label(cmd) };
    }

    /// Attach a readable name to a handle owned by `device`.
    pub fn set_object_name<H: Handle>(&self, device: vk::Device, handle: H, name: &str) -> Result<()> {
        let name = CString::new(name)?;
        let name_info = object_name_info(handle, &name);
        unsafe { self.loader.set_debug_utils_object_name(device, &name_info) }
            .with_context(|| format!("Failed to name {:?} object", H::TYPE))
    }
}

impl Drop for DebugBridge {
    fn drop(&mut self) {
        self.destroy_messenger();
        log::info!(
            "Validation layers reported {} error(s), {} warning(s)",
            self.stats.errors(),
            self.stats.warnings()
        );
    }
}

/// Label color as RGBA.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelColor(pub [f32; 4]);

impl LabelColor {
    pub const GREEN: Self = Self([0.0, 1.0, 0.0, 1.0]);
}

/// The returned label borrows `name` through a raw pointer.
pub fn label(name: &CStr, color: LabelColor) -> vk::DebugUtilsLabelEXT {
    vk::DebugUtilsLabelEXT::builder()
        .label_name(name)
        .color(color.0)
        .build()
}

/// The returned info borrows `name` through a raw pointer.
pub fn object_name_info<H: Handle>(handle: H, name: &CStr) -> vk::DebugUtilsObjectNameInfoEXT {
    vk::DebugUtilsObjectNameInfoEXT::builder()
        .object_type(H::TYPE)
        .object_handle(handle.as_raw())
        .object_name(name)
        .build()
}

/// Closes a command buffer label when dropped. Does nothing without
/// validation.
pub struct ScopedLabel<'a> {
    bridge: Option<&'a DebugBridge>,
    cmd: vk::CommandBuffer,
}

impl<'a> ScopedLabel<'a> {
    pub fn begin(
        bridge: Option<&'a DebugBridge>,
        cmd: vk::CommandBuffer,
        name: &CStr,
        color: LabelColor,
    ) -> Self {
        if let Some(bridge) = bridge {
            bridge.begin_label(cmd, name, color);
        }
        Self { bridge, cmd }
    }
}

impl Drop for ScopedLabel<'_> {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge {
            bridge.end_label(self.cmd);
        }
    }
}

fn log_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::Level::Info
    } else {
        log::Level::Trace
    }
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    let level = log_level(message_severity);

    if let Some(stats) = (p_user_data as *const DebugStats).as_ref() {
        match level {
            log::Level::Error => stats.errors.fetch_add(1, Ordering::Relaxed),
            log::Level::Warn => stats.warnings.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    }

    if let Some(data) = p_callback_data.as_ref() {
        if !data.p_message.is_null() {
            let message = CStr::from_ptr(data.p_message);
            log::log!(level, "validation layer: {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_map_to_log_levels() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        assert_eq!(log_level(S::ERROR), log::Level::Error);
        assert_eq!(log_level(S::WARNING), log::Level::Warn);
        assert_eq!(log_level(S::INFO), log::Level::Info);
        assert_eq!(log_level(S::VERBOSE), log::Level::Trace);
    }

    #[test]
    fn callback_counts_through_user_data() {
        let stats = Box::<DebugStats>::default();
        let info = stats.messenger_create_info();
        let message = c"something went wrong";
        let data = vk::DebugUtilsMessengerCallbackDataEXT {
            p_message: message.as_ptr(),
            ..Default::default()
        };

        let callback = info.pfn_user_callback.unwrap();
        unsafe {
            let ret = callback(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
                &data,
                info.p_user_data,
            );
            assert_eq!(ret, vk::FALSE);
            callback(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                &data,
                info.p_user_data,
            );
            callback(
                vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL,
                &data,
                info.p_user_data,
            );
        }

        assert_eq!(stats.errors(), 1);
        assert_eq!(stats.warnings(), 1);
    }

    #[test]
    fn draw_label_carries_name_and_color() {
        let name = c"draw frame";
        let label = label(name, LabelColor::GREEN);
        assert_eq!(label.s_type, vk::StructureType::DEBUG_UTILS_LABEL_EXT);
        assert_eq!(unsafe { CStr::from_ptr(label.p_label_name) }, name);
        assert_eq!(label.color, [0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn object_name_uses_handle_type_and_raw_value() {
        let buffer = vk::Buffer::from_raw(0x42);
        let name = c"vertex buffer";
        let info = object_name_info(buffer, name);
        assert_eq!(info.object_type, vk::ObjectType::BUFFER);
        assert_eq!(info.object_handle, 0x42);
        assert_eq!(unsafe { CStr::from_ptr(info.p_object_name) }, name);
    }

    #[test]
    fn callback_tolerates_missing_user_data() {
        let data = vk::DebugUtilsMessengerCallbackDataEXT::default();
        let ret = unsafe {
            debug_callback(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL,
                &data,
                std::ptr::null_mut(),
            )
        };
        assert_eq!(ret, vk::FALSE);
    }
}
