//! # Module System
//!
//! Runtime loading, lifecycle management and hot reload for proxy modules.
//!
//! Modules arrive from two kinds of source: platform dynamic libraries
//! exporting the `spyglass_module_entry`/`spyglass_module_version` C entry
//! points (see `declare_module!` in the event-system crate), or in-process
//! factories registered by the host. The proxy's built-in core module and
//! test modules use the latter.
//!
//! The registry keeps one entry per module name. A hot reload re-imports the
//! module from its recorded origin, migrates the state entries the new
//! version asks to preserve, and links the superseded entry into a version
//! chain so callbacks bound against the old instance dispatch to the new
//! one. The chain is collapsed on every reload: only the direct predecessor
//! is held strongly, so retired generations become collectible as soon as
//! their last in-flight callback is gone.

pub mod registry;
pub mod source;

pub use registry::{ModuleEntry, ModuleOrigin, ModuleRegistry};
pub use source::ModuleFactory;
