pub mod gc;
pub mod unpack;

pub use gc::{ActiveBundleSet, GcHandle};
pub use unpack::unzip;

/// Default maximum uncompressed size accepted by [`unzip`]: 1 GiB.
pub const DEFAULT_MAX_UNCOMPRESSED_BYTES: u64 = 1024 * 1024 * 1024;

/// Compute the per-service staging directory, `<base_dir>/<service_id>`.
pub fn staging_dir(base_dir: &std::path::Path, service_id: &str) -> std::path::PathBuf {
    base_dir.join(service_id)
}
