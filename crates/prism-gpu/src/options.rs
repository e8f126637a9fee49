use serde::Deserialize;

/// Core options consulted at device creation.
///
/// The embedder deserializes these from its per-application configuration
/// bag; unrecognized keys are ignored there, and every field here has the
/// documented default.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GpuOptions {
    /// Relax the worker's barrier policy to ignore write-after-write hazards.
    pub relaxed_barriers: bool,

    /// Enable the render-target-vs-texture hazard scan before draws.
    pub has_hazards: bool,
}

impl Default for GpuOptions {
    fn default() -> Self {
        Self {
            relaxed_barriers: false,
            has_hazards: false,
        }
    }
}
