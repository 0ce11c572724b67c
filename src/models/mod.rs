//! Data models owned by the controller.

mod assignment;
#[cfg(test)]
mod assignment_test;
mod operation;
mod ticket;
mod topology;
mod version;

pub use assignment::*;
pub use operation::*;
pub use ticket::*;
pub use topology::*;
pub use version::*;

pub type ClusterId = u64;
pub type DcId = u64;
pub type GroupId = u64;
pub type NodeId = u64;
pub type TableId = u64;
pub type AnsibleConfigId = u64;
pub type ShardId = u32;
