// Copyright 2026 privload contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! # privload
//!
//! A private dynamic-library loader for the Windows Portable Executable
//! format. `privload` lives inside a process that is also running the
//! operating system's own loader and maps, relocates, resolves, and
//! initializes DLL images that must remain invisible to, and isolated
//! from, the host loader's bookkeeping: no module-list entry, no loader
//! notifications, and no accidental sharing of the process heap or FLS
//! callback dispatch with the host.
//!
//! The intended consumer is an instrumentation or virtualization runtime
//! that wants to load auxiliary libraries (its own extensions plus whatever
//! they depend on) without polluting the host process. The runtime plugs in
//! through the [`LoaderHost`] trait (file access, system root, entry-point
//! execution, native forwarding targets) and shares the loader's modeled
//! [`memory::AddressSpace`] with its execution engine.
//!
//! # Architecture
//!
//! - [`memory`] - The address-space model: regions, section-aware
//!   protection, page-granular protection overrides
//! - [`pe`] - Bounds-checked directory readers for mapped images: headers,
//!   import descriptors, exports with forwarder detection
//! - [`loader`] - The lifecycle driver: mapping + relocation, the
//!   reverse-dependency-ordered module registry, search paths, the
//!   bootstrap window, and recursive import resolution
//! - [`redirect`] - The import redirection shim: a closed table of system
//!   routines substituted with loader-provided stand-ins (private heap,
//!   string frees, FLS callback capture, module-handle and
//!   procedure-address lookups)
//! - [`host`] - The collaborator contract with the embedding runtime
//!
//! # Usage
//!
//! ```rust,no_run
//! use privload::{Arch, Loader, LoaderHost};
//! use std::path::Path;
//!
//! # fn run(host: &mut dyn LoaderHost) -> privload::Result<()> {
//! let mut loader = Loader::new(Arch::X64);
//!
//! // Client libraries may load before init (the bootstrap window)
//! loader.load(host, Path::new("c:/clients/instrument.dll"))?;
//!
//! // Init wires the redirection stubs and heap, references the host's
//! // modules, and finalizes everything from the bootstrap window
//! loader.init(host)?;
//!
//! let base = loader.load(host, Path::new("extra.dll"))?;
//! assert!(loader.contains(base));
//! loader.unload(host, base);
//! # Ok(())
//! # }
//! ```
//!
//! # Reentrancy and locking
//!
//! Import resolution can run a library's entry point, which may call the
//! substitute `GetProcAddress`, `GetModuleHandleA`, or `FlsAlloc`, all of
//! which re-enter the loader. The state a recursive loader lock would guard
//! is expressed here with exclusive borrows instead: host callbacks receive
//! `&mut Loader` and nested re-entry is plain method calls under the one
//! outstanding borrow. A runtime that needs cross-thread access wraps the
//! [`Loader`] in its own mutex.
//!
//! # Scope
//!
//! Import-by-ordinal, delay-load imports, bound-import tables, TLS
//! directories, and non-DLL images are out of scope and fail loudly with
//! [`Error::Unsupported`] rather than degrading silently.

#[macro_use]
pub(crate) mod error;

pub mod host;
pub mod loader;
pub mod memory;
pub mod pe;
pub mod redirect;

/// `privload` Result type.
///
/// A type alias for `std::result::Result<T, Error>` where the error type is
/// always [`crate::Error`], used consistently for all fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `privload` Error type.
///
/// Covers the full failure taxonomy: mapping failures, malformed
/// directories, unsupported-feature rejections, and resolution errors.
pub use error::Error;

pub use host::{LoaderHost, PreloadedImage};
pub use loader::{registry::PrivateModule, Arch, EntryReason, Loader};
pub use redirect::{MachineContext, Shim, StringKind};
