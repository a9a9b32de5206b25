//! Space allocation
//!
//! Each block group carries two [`Bitmap`]s: one over its blocks and one
//! over its inode table. Both share the same fragment index machinery.

pub mod bitmap;
pub mod extent;

pub use bitmap::Bitmap;
pub use extent::{Extent, FragmentList};
