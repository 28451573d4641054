//! Host elevation detection and the admin-requirement policy
//!
//! Detection fails closed: any query error means "not elevated". The policy
//! flag is derived from platform, build mode and configuration only, never
//! from runtime state.

use once_cell::sync::OnceCell;

use crate::config::{BuildMode, SupervisorConfig};
use crate::platform;

static HOST_ELEVATED: OnceCell<bool> = OnceCell::new();

/// Whether this process currently holds administrator/root rights.
pub fn is_elevated() -> bool {
    match platform::query_elevation() {
        Ok(elevated) => {
            log::debug!("Host elevation query: elevated={elevated}");
            elevated
        }
        Err(e) => {
            log::warn!("Elevation check failed, assuming not elevated: {e:#}");
            false
        }
    }
}

/// `is_elevated`, computed once per process.
pub fn host_is_elevated() -> bool {
    *HOST_ELEVATED.get_or_init(is_elevated)
}

/// Whether full monitoring functionality is gated behind elevation.
///
/// An explicit `require_admin` wins. Otherwise Windows production builds
/// require it; development builds and other platforms do not.
pub fn admin_required_by_policy(cfg: &SupervisorConfig) -> bool {
    if let Some(explicit) = cfg.require_admin {
        return explicit;
    }
    cfg!(windows) && cfg.build_mode == BuildMode::Production
}
