//! Data models shared by every reelsync component.

mod classification;
mod remote;
mod tracked_file;

pub use classification::*;
pub use remote::*;
pub use tracked_file::*;
