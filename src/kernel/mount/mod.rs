//! Filesystem isolation: the read-only chroot jail.

pub mod filesystem;

pub use filesystem::{jail_mount_points, FilesystemSecurity};
