mod archive;
mod fs;

pub use fs::FsSource;

use std::io::{self, Read};

/// Metadata of one live node, as seen during enumeration. Archive members
/// carry no modification time (`modified` stays 0); mismatch detection for
/// them relies on sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveNode {
    pub name: String,
    pub folder: bool,
    pub size: i64,
    pub compressed_size: i64,
    pub modified: i64,
}

/// Identifies one archive on the way down a compression stack: the real
/// file on disk plus the chain of nested archive members that must be
/// unpacked to reach the innermost archive. An empty `layers` means the
/// real file itself is the archive of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionStack {
    pub real_path: String,
    pub layers: Vec<String>,
}

impl CompressionStack {
    pub fn new(real_path: impl Into<String>) -> Self {
        CompressionStack {
            real_path: real_path.into(),
            layers: Vec::new(),
        }
    }

    pub fn descend(&self, member: impl Into<String>) -> Self {
        let mut layers = self.layers.clone();
        layers.push(member.into());
        CompressionStack {
            real_path: self.real_path.clone(),
            layers,
        }
    }
}

/// Lazy, restartable enumeration of the live tree, plain directories and
/// archive layers alike. Implementations must be cheap to call repeatedly;
/// every operation re-reads the live state.
pub trait TreeSource: Send + Sync {
    /// Metadata of a real filesystem path.
    fn probe(&self, path: &str) -> io::Result<LiveNode>;

    /// Immediate children of a real directory.
    fn list_dir(&self, path: &str) -> io::Result<Vec<LiveNode>>;

    /// Immediate children of a directory inside an archive. `dir` is the
    /// slash-separated path within the innermost archive of `stack`, empty
    /// for the archive root.
    fn list_archive(&self, stack: &CompressionStack, dir: &str) -> io::Result<Vec<LiveNode>>;

    /// Metadata of a single member inside an archive, `None` when the
    /// member no longer exists.
    fn probe_archive(
        &self,
        stack: &CompressionStack,
        member: &str,
    ) -> io::Result<Option<LiveNode>>;

    /// Byte stream of a real file.
    fn open_file(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;

    /// Byte stream of an archive member reached through `stack`.
    fn open_member(
        &self,
        stack: &CompressionStack,
        member: &str,
    ) -> io::Result<Box<dyn Read + Send>>;
}
