use serde::Deserialize;

/// Version-11 runtime options, deserialized from the embedder's
/// per-application configuration bag at device creation.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Options11 {
    /// Honor the DO_NOT_WAIT map flag. Some applications spin on `map`
    /// until the resource is idle and never recover from the failure path,
    /// so the flag is cleared unless this is set.
    pub allow_map_flag_no_wait: bool,

    /// Relax the worker's barrier policy to ignore write-after-write.
    pub relaxed_barriers: bool,

    /// Cap on frame events per swap chain, forwarded to the presenter.
    pub max_frame_latency: u32,

    /// Cap on the advertised feature level, encoded as `(major, minor)`.
    pub max_feature_level: Option<(u32, u32)>,
}

impl Default for Options11 {
    fn default() -> Self {
        Self {
            allow_map_flag_no_wait: false,
            relaxed_barriers: false,
            max_frame_latency: 0,
            max_feature_level: None,
        }
    }
}
