//! Routing asset provisioning
//!
//! The engine resolves `geosite:` and `geoip:` rules from data files in
//! its asset directory. Missing files are copied in from the bundled
//! assets; existing files are never overwritten.

use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

pub const ASSET_FILES: [&str; 2] = ["geosite.dat", "geoip.dat"];

/// Copy absent asset files from `source` into `data_dir`
///
/// Returns how many files were copied. Failures are logged, never fatal.
pub fn ensure_assets(source: Option<&Path>, data_dir: &Path) -> usize {
    let mut copied = 0;

    for name in ASSET_FILES {
        let target = data_dir.join(name);
        if target.exists() {
            debug!("Asset {} already present", name);
            continue;
        }
        let Some(source) = source else {
            warn!("Asset {} missing and no assets_dir configured", name);
            continue;
        };

        match fs::copy(source.join(name), &target) {
            Ok(bytes) => {
                info!("Copied {} ({} bytes) to {}", name, bytes, data_dir.display());
                copied += 1;
            }
            Err(e) => warn!("Failed to copy {}: {}", name, e),
        }
    }

    copied
}
