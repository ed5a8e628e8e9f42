use crate::error::Result;
use crate::listing::CompressionStack;
use crate::storage::models::{CatalogEntry, EntryKind};
use crate::storage::Store;

/// Where a compressed entry lives: the innermost enclosing archive plus
/// the entry's member path within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackView {
    pub stack: CompressionStack,
    pub member: String,
}

/// Resolve the ordered containment chain from a compressed entry up to
/// the real archive file on disk. Returns `None` when the chain is broken
/// (a parent row is missing, or the chain never reaches a real file) —
/// the entry is then an orphan.
pub fn resolve_stack(store: &Store, entry: &CatalogEntry) -> Result<Option<StackView>> {
    debug_assert!(entry.kind.is_compressed());

    let mut chain: Vec<CatalogEntry> = vec![entry.clone()];
    let mut cursor = entry.parent_id;
    loop {
        if cursor == 0 {
            return Ok(None);
        }
        let Some(parent) = store.entry(cursor)? else {
            return Ok(None);
        };
        match parent.kind {
            EntryKind::File => {
                chain.push(parent);
                break;
            }
            // Compressed rows can only hang below an archive; a plain
            // folder in the chain means the recorded tree is broken.
            EntryKind::Folder => return Ok(None),
            EntryKind::CompressedFolder | EntryKind::CompressedFile => {
                cursor = parent.parent_id;
                chain.push(parent);
            }
        }
    }
    chain.reverse();

    let mut stack = CompressionStack::new(chain[0].path.clone());
    let mut member_parts: Vec<String> = Vec::new();
    for (index, node) in chain.iter().enumerate().skip(1) {
        member_parts.push(node.name.clone());
        let is_target = index == chain.len() - 1;
        if !is_target && node.kind == EntryKind::CompressedFile {
            // A compressed file with recorded descendants is itself a
            // nested archive: everything accumulated so far becomes one
            // layer of the stack.
            stack = stack.descend(member_parts.join("/"));
            member_parts.clear();
        }
    }
    Ok(Some(StackView {
        stack,
        member: member_parts.join("/"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::EntryKind;

    fn insert(
        store: &Store,
        parent_id: i64,
        root_id: i64,
        kind: EntryKind,
        path: &str,
        name: &str,
    ) -> i64 {
        store
            .insert_child(parent_id, root_id, kind, path, name, 0, 0, 0)
            .unwrap()
    }

    #[test]
    fn resolves_member_within_a_single_archive() {
        let store = Store::open_in_memory().unwrap();
        let root = store.register_root("/data").unwrap();
        let zip = insert(&store, root, root, EntryKind::File, "/data/a.zip", "a.zip");
        let dir = insert(
            &store,
            zip,
            root,
            EntryKind::CompressedFolder,
            "/data/a.zip!/docs",
            "docs",
        );
        let file = insert(
            &store,
            dir,
            root,
            EntryKind::CompressedFile,
            "/data/a.zip!/docs/x.txt",
            "x.txt",
        );

        let entry = store.entry(file).unwrap().unwrap();
        let view = resolve_stack(&store, &entry).unwrap().unwrap();
        assert_eq!(view.stack.real_path, "/data/a.zip");
        assert!(view.stack.layers.is_empty());
        assert_eq!(view.member, "docs/x.txt");
    }

    #[test]
    fn nested_archives_become_stack_layers() {
        let store = Store::open_in_memory().unwrap();
        let root = store.register_root("/data").unwrap();
        let outer = insert(&store, root, root, EntryKind::File, "/d/outer.zip", "outer.zip");
        let inner = insert(
            &store,
            outer,
            root,
            EntryKind::CompressedFile,
            "/d/outer.zip!/inner.zip",
            "inner.zip",
        );
        let deep = insert(
            &store,
            inner,
            root,
            EntryKind::CompressedFile,
            "/d/outer.zip!/inner.zip!/deep.txt",
            "deep.txt",
        );

        let entry = store.entry(deep).unwrap().unwrap();
        let view = resolve_stack(&store, &entry).unwrap().unwrap();
        assert_eq!(view.stack.real_path, "/d/outer.zip");
        assert_eq!(view.stack.layers, vec!["inner.zip".to_string()]);
        assert_eq!(view.member, "deep.txt");
    }

    #[test]
    fn broken_chains_are_unresolvable() {
        let store = Store::open_in_memory().unwrap();
        let root = store.register_root("/data").unwrap();
        // Compressed row hanging directly below a plain folder.
        let stray = insert(
            &store,
            root,
            root,
            EntryKind::CompressedFile,
            "/data/ghost",
            "ghost",
        );
        let entry = store.entry(stray).unwrap().unwrap();
        assert!(resolve_stack(&store, &entry).unwrap().is_none());

        // Parent id that no longer resolves at all.
        let orphan = insert(
            &store,
            9999,
            root,
            EntryKind::CompressedFile,
            "/data/lost",
            "lost",
        );
        let entry = store.entry(orphan).unwrap().unwrap();
        assert!(resolve_stack(&store, &entry).unwrap().is_none());
    }
}
