use ash::vk;
use thiserror::Error;

/// Errors produced by the Vulkan-facing core.
///
/// API runtimes convert these into [`Status`] codes at the boundary; inside
/// the core they propagate with `?`.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("device memory allocation failed ({size} bytes, type mask {type_mask:#x})")]
    OutOfDeviceMemory { size: u64, type_mask: u32 },

    #[error("the device has been lost")]
    DeviceLost,

    #[error("resource is not host-visible")]
    NotMapped,

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("Vulkan call failed: {0:?}")]
    Vulkan(#[from] vk::Result),
}

/// A 32-bit signed status code shaped like the legacy APIs' result codes.
///
/// Zero and positive values are successes; negative values are failures.
/// Only the values the core actually reports are defined here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status(pub i32);

impl Status {
    /// The call succeeded.
    pub const OK: Self = Self(0);
    /// The call succeeded but produced no object or no data.
    pub const FALSE: Self = Self(1);
    /// Invalid argument or call sequence.
    pub const INVALID_CALL: Self = Self(0x8876_086Cu32 as i32);
    /// The allocator could not satisfy a resource creation request.
    pub const OUT_OF_VIDEO_MEMORY: Self = Self(0x8876_017Cu32 as i32);
    /// The entry point is not modeled by the core.
    pub const NOT_IMPLEMENTED: Self = Self(0x8000_4001u32 as i32);
    /// The resource is still in use by the GPU and DO_NOT_WAIT was set.
    pub const WAS_STILL_DRAWING: Self = Self(0x8876_021Cu32 as i32);
    /// A worker-side failure has put the device into the removed state.
    pub const DEVICE_REMOVED: Self = Self(0x887A_0005u32 as i32);

    pub fn is_ok(self) -> bool {
        self.0 >= 0
    }

    pub fn is_err(self) -> bool {
        self.0 < 0
    }
}

impl From<&GpuError> for Status {
    fn from(err: &GpuError) -> Self {
        match err {
            GpuError::OutOfDeviceMemory { .. } => Status::OUT_OF_VIDEO_MEMORY,
            GpuError::DeviceLost => Status::DEVICE_REMOVED,
            GpuError::NotMapped | GpuError::InvalidParameter(_) => Status::INVALID_CALL,
            GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST) => Status::DEVICE_REMOVED,
            GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY) => Status::OUT_OF_VIDEO_MEMORY,
            GpuError::Vulkan(_) => Status::INVALID_CALL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_codes_are_non_negative() {
        assert!(Status::OK.is_ok());
        assert!(Status::FALSE.is_ok());
        assert!(Status::INVALID_CALL.is_err());
        assert!(Status::WAS_STILL_DRAWING.is_err());
    }

    #[test]
    fn errors_map_to_legacy_codes() {
        let err = GpuError::OutOfDeviceMemory {
            size: 4096,
            type_mask: 0xFF,
        };
        assert_eq!(Status::from(&err), Status::OUT_OF_VIDEO_MEMORY);
        assert_eq!(Status::from(&GpuError::DeviceLost), Status::DEVICE_REMOVED);
    }
}
