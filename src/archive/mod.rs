//! cbz 归档：`ComicInfo.xml` 生成与原子提交。

pub mod manifest;
pub mod writer;

pub use manifest::ArchiveManifest;
pub use writer::{ArchiveError, commit};
