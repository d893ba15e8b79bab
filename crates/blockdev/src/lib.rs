//! Block-storage driver for the volprov daemon.
//!
//! Volumes live in one named LVM volume group; the driver shells out to
//! the host tooling (`lvcreate`, `lvremove`, `lvs`, `qemu-img`, `dd`)
//! with validated identifiers and argument arrays, never a shell string.

pub mod driver;
pub mod error;
pub mod lvm;

pub use driver::{BlockDriver, VolumeInfo};
pub use error::{BlockError, BlockResult};
pub use lvm::LvmDriver;
