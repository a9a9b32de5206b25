pub mod allocator;
pub mod block_group;
pub mod config;
pub mod directory;
pub mod error;
pub mod fsman;
pub mod head_window;
pub mod header;
pub mod inode;
pub mod io;
pub mod stream;
pub mod transaction;
