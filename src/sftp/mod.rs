//! SFTP file management module
//!
//! Remote file browsing plus a bounded upload/download queue with live
//! progress and cancellation.

pub mod browser;
pub mod path_utils;
mod remote_fs;
pub mod transfer;
pub mod types;

pub use browser::{BrowserError, FileBrowser};
pub use remote_fs::SftpFs;
pub use transfer::{TransferError, TransferQueue};
pub use types::*;
