/// Build identity of the running binary, reported by `/health` and at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl AppInfo {
    pub const fn new(name: &'static str, version: &'static str) -> Self {
        Self { name, version }
    }
}

/// Capture the calling crate's package name and version.
///
/// ```ignore
/// let info = core_config::app_info!();
/// tracing::info!(name = %info.name, version = %info.version, "starting");
/// ```
#[macro_export]
macro_rules! app_info {
    () => {
        $crate::AppInfo::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    };
}
