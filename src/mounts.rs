//! Bind-mount planning for tenant workloads

use std::path::Path;
use tracing::warn;

/// Suffix marking an extra directory as read-only
const READ_ONLY_SUFFIX: &str = "::ro";

/// Root under which every tenant's home mount appears inside the workload
pub const HOME_MOUNT_ROOT: &str = "/users";

/// A single bind mount from the host into a workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Target path of a tenant's primary directory inside its workload
pub fn home_target(identity: &str) -> String {
    format!("{}/{}/public_html", HOME_MOUNT_ROOT, identity)
}

/// Split `path[::ro]` into the path and its read-only flag
fn parse_extra(entry: &str) -> (&str, bool) {
    match entry.strip_suffix(READ_ONLY_SUFFIX) {
        Some(path) => (path, true),
        None => (entry, false),
    }
}

/// Build the ordered mount list for a tenant.
///
/// The primary directory is mounted read-write at [`home_target`]. Extras keep their
/// host path as the target. Any source missing on the host is skipped with a warning.
pub fn plan_mounts(identity: &str, primary: &str, extras: &[String]) -> Vec<MountSpec> {
    let mut mounts = Vec::with_capacity(extras.len() + 1);

    if Path::new(primary).exists() {
        mounts.push(MountSpec {
            source: primary.to_string(),
            target: home_target(identity),
            read_only: false,
        });
    } else {
        warn!(identity, path = primary, "Home directory not found, not mounting");
    }

    for entry in extras {
        let (path, read_only) = parse_extra(entry.trim());
        if path.is_empty() {
            continue;
        }
        if !Path::new(path).exists() {
            warn!(identity, path, "Extra directory not found, skipping");
            continue;
        }
        mounts.push(MountSpec {
            source: path.to_string(),
            target: path.to_string(),
            read_only,
        });
    }

    mounts
}
