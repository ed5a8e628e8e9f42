use crate::error::{Error, Result};

/// What a catalog row represents. `Folder`/`File` are real filesystem
/// objects; the `Compressed*` kinds live inside an archive and only exist
/// through a resolvable compression stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Folder,
    File,
    CompressedFolder,
    CompressedFile,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Folder => "folder",
            EntryKind::File => "file",
            EntryKind::CompressedFolder => "compressed_folder",
            EntryKind::CompressedFile => "compressed_file",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "folder" => Ok(EntryKind::Folder),
            "file" => Ok(EntryKind::File),
            "compressed_folder" => Ok(EntryKind::CompressedFolder),
            "compressed_file" => Ok(EntryKind::CompressedFile),
            other => Err(Error::invariant(format!("unknown entry kind '{other}'"))),
        }
    }

    pub fn is_folder_like(self) -> bool {
        matches!(self, EntryKind::Folder | EntryKind::CompressedFolder)
    }

    pub fn is_file_like(self) -> bool {
        matches!(self, EntryKind::File | EntryKind::CompressedFile)
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, EntryKind::CompressedFolder | EntryKind::CompressedFile)
    }
}

/// Reconciliation state of a row. Clean→Dirty on detected mismatch,
/// Dirty→Clean after a successful re-crawl, either→NoAccess on I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Clean,
    Dirty,
    NoAccess,
}

impl EntryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Clean => "clean",
            EntryStatus::Dirty => "dirty",
            EntryStatus::NoAccess => "no_access",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "clean" => Ok(EntryStatus::Clean),
            "dirty" => Ok(EntryStatus::Dirty),
            "no_access" => Ok(EntryStatus::NoAccess),
            other => Err(Error::invariant(format!("unknown entry status '{other}'"))),
        }
    }
}

/// A persisted catalog row. `parent_id == 0` marks a root; `root_id` is
/// constant within a subtree (a root's root_id is its own id).
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub id: i64,
    pub parent_id: i64,
    pub root_id: i64,
    pub kind: EntryKind,
    pub status: EntryStatus,
    pub size: i64,
    pub compressed_size: i64,
    pub checksum: Option<i64>,
    pub path: String,
    pub name: String,
    pub extension: String,
    pub modified: i64,
}

impl CatalogEntry {
    pub fn is_root(&self) -> bool {
        self.parent_id == 0
    }
}

/// A candidate duplicate pair. `id1 < id2`; size and checksum were equal
/// when the record was written; re-verified oldest-first.
#[derive(Debug, Clone)]
pub struct EqualityRecord {
    pub id1: i64,
    pub id2: i64,
    pub size: i64,
    pub checksum: i64,
    pub last_tested: String,
}

/// Materialized transitive containment: `upper` is an ancestor of `lower`
/// at the given distance (1 = direct parent).
#[derive(Debug, Clone)]
pub struct AncestryEdge {
    pub upper: i64,
    pub lower: i64,
    pub distance: i64,
}

/// Per-kind/status row counts for the status report.
#[derive(Debug, Clone)]
pub struct SummaryRow {
    pub kind: EntryKind,
    pub status: EntryStatus,
    pub entries: i64,
    pub bytes: i64,
}

/// Derive the lowercase extension from an entry name, the way the catalog
/// denormalizes it.
pub fn extension_of(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips() {
        for kind in [
            EntryKind::Folder,
            EntryKind::File,
            EntryKind::CompressedFolder,
            EntryKind::CompressedFile,
        ] {
            assert_eq!(EntryKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(EntryKind::parse("socket").is_err());
    }

    #[test]
    fn extension_is_lowercased_and_dotfiles_have_none() {
        assert_eq!(extension_of("Photo.JPG"), "jpg");
        assert_eq!(extension_of("archive.tar.gz"), "gz");
        assert_eq!(extension_of(".bashrc"), "");
        assert_eq!(extension_of("README"), "");
    }
}
