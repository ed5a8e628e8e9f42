use super::{archive, CompressionStack, LiveNode, TreeSource};
use glob::Pattern;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::error;

/// Production tree source: std::fs for real paths, zip for archive layers,
/// glob patterns to keep ignored paths out of the catalog.
pub struct FsSource {
    ignore: Vec<Pattern>,
}

impl FsSource {
    pub fn new(ignore_globs: &[String]) -> Self {
        let ignore = ignore_globs
            .iter()
            .filter_map(|glob| match Pattern::new(glob) {
                Ok(pattern) => Some(pattern),
                Err(err) => {
                    error!("Invalid glob pattern '{}': {}", glob, err);
                    None
                }
            })
            .collect();
        FsSource { ignore }
    }

    fn is_ignored(&self, path: &Path) -> bool {
        self.ignore.iter().any(|pattern| pattern.matches_path(path))
    }
}

fn node_from_metadata(name: String, metadata: &fs::Metadata) -> LiveNode {
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    LiveNode {
        name,
        folder: metadata.is_dir(),
        size: if metadata.is_dir() {
            0
        } else {
            metadata.len() as i64
        },
        compressed_size: 0,
        modified,
    }
}

impl TreeSource for FsSource {
    fn probe(&self, path: &str) -> io::Result<LiveNode> {
        let metadata = fs::symlink_metadata(path)?;
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        Ok(node_from_metadata(name, &metadata))
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<LiveNode>> {
        let mut nodes = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let entry_path = entry.path();
            if self.is_ignored(&entry_path) {
                continue;
            }
            let metadata = entry.metadata()?;
            if metadata.file_type().is_symlink() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            nodes.push(node_from_metadata(name, &metadata));
        }
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    fn list_archive(&self, stack: &CompressionStack, dir: &str) -> io::Result<Vec<LiveNode>> {
        archive::list_members(stack, dir)
    }

    fn probe_archive(
        &self,
        stack: &CompressionStack,
        member: &str,
    ) -> io::Result<Option<LiveNode>> {
        archive::probe_member(stack, member)
    }

    fn open_file(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(path)?))
    }

    fn open_member(
        &self,
        stack: &CompressionStack,
        member: &str,
    ) -> io::Result<Box<dyn Read + Send>> {
        let buf = archive::read_member(stack, member)?;
        Ok(Box::new(Cursor::new(buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            if name.ends_with('/') {
                writer.add_directory(name.trim_end_matches('/'), options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    #[test]
    fn lists_directory_children_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let source = FsSource::new(&[]);
        let nodes = source.list_dir(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "a.txt");
        assert!(!nodes[0].folder);
        assert_eq!(nodes[0].size, 5);
        assert_eq!(nodes[1].name, "sub");
        assert!(nodes[1].folder);
    }

    #[test]
    fn ignore_patterns_filter_children() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep.txt"), b"k").unwrap();
        fs::write(dir.path().join("skip.tmp"), b"s").unwrap();

        let source = FsSource::new(&["*.tmp".to_string()]);
        let nodes = source.list_dir(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "keep.txt");
    }

    #[test]
    fn lists_archive_root_and_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("pack.zip");
        write_zip(
            &zip_path,
            &[
                ("top.txt", b"top" as &[u8]),
                ("inner/nested.txt", b"nested"),
            ],
        );

        let source = FsSource::new(&[]);
        let stack = CompressionStack::new(zip_path.to_str().unwrap());
        let root = source.list_archive(&stack, "").unwrap();
        let names: Vec<&str> = root.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["inner", "top.txt"]);
        assert!(root[0].folder);

        let inner = source.list_archive(&stack, "inner").unwrap();
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].name, "nested.txt");
        assert_eq!(inner[0].size, 6);
    }

    #[test]
    fn probes_and_reads_members_through_nested_archives() {
        let dir = tempfile::tempdir().unwrap();

        let inner_path = dir.path().join("inner.zip");
        write_zip(&inner_path, &[("deep.txt", b"deep payload" as &[u8])]);
        let inner_bytes = fs::read(&inner_path).unwrap();

        let outer_path = dir.path().join("outer.zip");
        write_zip(&outer_path, &[("inner.zip", inner_bytes.as_slice())]);

        let source = FsSource::new(&[]);
        let stack = CompressionStack::new(outer_path.to_str().unwrap()).descend("inner.zip");

        let node = source.probe_archive(&stack, "deep.txt").unwrap().unwrap();
        assert_eq!(node.size, 12);
        assert!(source.probe_archive(&stack, "gone.txt").unwrap().is_none());

        let mut reader = source.open_member(&stack, "deep.txt").unwrap();
        let mut contents = String::new();
        reader.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "deep payload");
    }
}
