use serde::Deserialize;

/// Version-9 runtime options.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options9 {
    /// Accept a clear whose height falls 4 rows short of the render target
    /// as a full clear. Works around one known application with an
    /// oversized render-target height.
    pub lenient_clear: bool,

    /// Honor the read-only lock flag (else it is silently cleared).
    pub allow_lock_flag_readonly: bool,

    /// Honor the DO_NOT_WAIT lock flag (else it is silently cleared).
    pub allow_lock_flag_no_wait: bool,

    /// Free the managed-pool host shadow after unlock once no further
    /// locks are outstanding.
    pub evict_managed_on_unlock: bool,

    /// Enable the render-target-vs-texture hazard scan before draws.
    pub has_hazards: bool,

    /// Tessellation-factor clamp handed to the external compiler when hull
    /// shaders are translated.
    pub max_tess_factor: u32,
}

impl Default for Options9 {
    fn default() -> Self {
        Self {
            lenient_clear: false,
            allow_lock_flag_readonly: true,
            allow_lock_flag_no_wait: false,
            evict_managed_on_unlock: false,
            has_hazards: false,
            max_tess_factor: 0,
        }
    }
}
