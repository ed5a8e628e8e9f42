use super::{CompressionStack, LiveNode};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek};
use zip::ZipArchive;

pub(super) trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

fn zip_err(err: zip::result::ZipError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// Open the innermost archive of a stack, unpacking each nested layer into
/// memory on the way down.
pub(super) fn open_innermost(
    stack: &CompressionStack,
) -> io::Result<ZipArchive<Box<dyn ReadSeek>>> {
    let file = File::open(&stack.real_path)?;
    let mut archive =
        ZipArchive::new(Box::new(file) as Box<dyn ReadSeek>).map_err(zip_err)?;
    for layer in &stack.layers {
        let buf = {
            let mut member = archive.by_name(layer).map_err(zip_err)?;
            let mut buf = Vec::with_capacity(member.size() as usize);
            member.read_to_end(&mut buf)?;
            buf
        };
        archive =
            ZipArchive::new(Box::new(Cursor::new(buf)) as Box<dyn ReadSeek>).map_err(zip_err)?;
    }
    Ok(archive)
}

/// Immediate children of `dir` within the innermost archive. Directories
/// implied by member paths are reported even when the archive carries no
/// explicit directory entry for them.
pub(super) fn list_members(stack: &CompressionStack, dir: &str) -> io::Result<Vec<LiveNode>> {
    let mut archive = open_innermost(stack)?;
    let prefix = dir_prefix(dir);

    let mut folders: BTreeSet<String> = BTreeSet::new();
    let mut files: Vec<LiveNode> = Vec::new();
    for index in 0..archive.len() {
        let member = archive.by_index(index).map_err(zip_err)?;
        let name = member.name().trim_end_matches('/').to_string();
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        match rest.split_once('/') {
            Some((first, _)) => {
                folders.insert(first.to_string());
            }
            None => {
                if member.is_dir() {
                    folders.insert(rest.to_string());
                } else {
                    files.push(LiveNode {
                        name: rest.to_string(),
                        folder: false,
                        size: member.size() as i64,
                        compressed_size: member.compressed_size() as i64,
                        modified: 0,
                    });
                }
            }
        }
    }

    let mut nodes: Vec<LiveNode> = folders
        .into_iter()
        .map(|name| LiveNode {
            name,
            folder: true,
            size: 0,
            compressed_size: 0,
            modified: 0,
        })
        .collect();
    nodes.extend(files);
    Ok(nodes)
}

/// Metadata of one member, `None` when it no longer exists in the archive.
pub(super) fn probe_member(
    stack: &CompressionStack,
    member_path: &str,
) -> io::Result<Option<LiveNode>> {
    let mut archive = open_innermost(stack)?;
    let target = member_path.trim_end_matches('/');
    let implied_prefix = format!("{target}/");
    let mut implied_folder = false;
    for index in 0..archive.len() {
        let member = archive.by_index(index).map_err(zip_err)?;
        let name = member.name().trim_end_matches('/').to_string();
        if name == target {
            let node = LiveNode {
                name: leaf_name(target),
                folder: member.is_dir(),
                size: member.size() as i64,
                compressed_size: member.compressed_size() as i64,
                modified: 0,
            };
            return Ok(Some(node));
        }
        if name.starts_with(&implied_prefix) {
            implied_folder = true;
        }
    }
    if implied_folder {
        return Ok(Some(LiveNode {
            name: leaf_name(target),
            folder: true,
            size: 0,
            compressed_size: 0,
            modified: 0,
        }));
    }
    Ok(None)
}

/// Full contents of one member, buffered. Nested layers are already
/// buffered by `open_innermost`, so this bounds memory to the unpacked
/// layer sizes.
pub(super) fn read_member(stack: &CompressionStack, member_path: &str) -> io::Result<Vec<u8>> {
    let mut archive = open_innermost(stack)?;
    let mut member = archive.by_name(member_path).map_err(zip_err)?;
    let mut buf = Vec::with_capacity(member.size() as usize);
    member.read_to_end(&mut buf)?;
    Ok(buf)
}

fn dir_prefix(dir: &str) -> String {
    let trimmed = dir.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

fn leaf_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}
