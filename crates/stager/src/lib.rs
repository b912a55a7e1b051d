//! Core library for the image stager CSI node plugin.
//!
//! The plugin materializes an OCI container image as a writable root
//! directory bind-mounted into a pod's volume target path ("stage-in"),
//! lets the workload mutate that directory for the life of the volume, and
//! on teardown optionally commits the directory back into a new image and
//! pushes it to a registry ("stage-out"). Image pulls, mounts, commits and
//! pushes are delegated to an external buildah executable.
//!
//! The [`driver`] module exposes the node half of the Container Storage
//! Interface over a local socket; [`image`] holds the per-volume
//! stage-in/stage-out state machine; [`buildah`] wraps the builder
//! executable; [`mount`] performs the bind mounts.

pub mod buildah;
#[cfg(feature = "cli")]
pub mod config;
pub mod driver;
pub mod grpc_sock;
pub mod image;
pub mod mount;
