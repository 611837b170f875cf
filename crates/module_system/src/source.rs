//! Module code sources: dynamic libraries and in-process factories.

use libloading::{Library, Symbol};
use spyglass_event_system::{Module, ModuleError, ABI_VERSION};
use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Symbol reporting the ABI version the module was compiled against.
pub const VERSION_SYMBOL: &[u8] = b"spyglass_module_version";
/// Symbol constructing the module instance.
pub const ENTRY_SYMBOL: &[u8] = b"spyglass_module_entry";

/// In-process constructor for a module. Built-ins and tests register these
/// instead of shipping a dynamic library; reload re-invokes the factory.
pub trait ModuleFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn Module>, ModuleError>;
}

impl<F> ModuleFactory for F
where
    F: Fn() -> Result<Arc<dyn Module>, ModuleError> + Send + Sync,
{
    fn create(&self) -> Result<Arc<dyn Module>, ModuleError> {
        self()
    }
}

pub(crate) fn open_library(path: &Path) -> Result<Library, ModuleError> {
    // SAFETY: loading a module library runs its initializers; modules are
    // trusted in-process code by design.
    unsafe { Library::new(path) }.map_err(|e| {
        ModuleError::LoadFailure(format!("failed to open {}: {e}", path.display()))
    })
}

/// Checks the library's reported ABI version against ours. Major and minor
/// must match; patch differences are tolerated.
pub(crate) fn check_abi(library: &Library, path: &Path) -> Result<(), ModuleError> {
    let version_fn: Symbol<unsafe extern "C" fn() -> *const c_char> =
        unsafe { library.get(VERSION_SYMBOL) }.map_err(|e| {
            ModuleError::LoadFailure(format!(
                "{} does not export spyglass_module_version: {e}",
                path.display()
            ))
        })?;

    let ptr = unsafe { version_fn() };
    if ptr.is_null() {
        return Err(ModuleError::LoadFailure(format!(
            "{} returned a null version string",
            path.display()
        )));
    }
    let version = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().to_string();

    if !versions_compatible(&version, ABI_VERSION) {
        return Err(ModuleError::LoadFailure(format!(
            "{}: ABI mismatch (module {version}, host {ABI_VERSION})",
            path.display()
        )));
    }
    debug!(path = %path.display(), %version, "module ABI accepted");
    Ok(())
}

pub(crate) fn instantiate(library: &Library, path: &Path) -> Result<Arc<dyn Module>, ModuleError> {
    let entry_fn: Symbol<unsafe extern "C" fn() -> *mut dyn Module> =
        unsafe { library.get(ENTRY_SYMBOL) }.map_err(|e| {
            ModuleError::LoadFailure(format!(
                "{} does not export spyglass_module_entry: {e}",
                path.display()
            ))
        })?;

    let raw = unsafe { entry_fn() };
    if raw.is_null() {
        return Err(ModuleError::LoadFailure(format!(
            "{} returned a null module instance",
            path.display()
        )));
    }
    let module: Box<dyn Module> = unsafe { Box::from_raw(raw) };
    Ok(Arc::from(module))
}

/// Relaxed compatibility: major.minor must match, patch may differ. Falls
/// back to exact comparison when a version string does not parse.
pub(crate) fn versions_compatible(module_version: &str, host_version: &str) -> bool {
    let major_minor = |version: &str| -> Option<(u32, u32)> {
        let mut parts = version.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some((major, minor))
    };

    match (major_minor(module_version), major_minor(host_version)) {
        (Some(a), Some(b)) => a == b,
        _ => module_version == host_version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_differences_are_compatible() {
        assert!(versions_compatible("0.4.0", "0.4.9"));
        assert!(versions_compatible("1.2.3", "1.2.0"));
    }

    #[test]
    fn major_or_minor_differences_are_not() {
        assert!(!versions_compatible("0.3.0", "0.4.0"));
        assert!(!versions_compatible("1.4.0", "0.4.0"));
    }

    #[test]
    fn unparseable_versions_fall_back_to_exact_match() {
        assert!(versions_compatible("dev", "dev"));
        assert!(!versions_compatible("dev", "0.4.0"));
    }
}
