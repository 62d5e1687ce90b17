use proptest::prelude::*;
use sitepack_core::bucket::{Bucket, MemoryBucketFactory};
use sitepack_core::metadata::{decode, Document, EncodeLimits, Encoded, MetadataArena, MetadataNode, NodeId};
use sitepack_core::resolve::{aux_metadata_name, resolve, ROOT_METADATA_NAME};

/// A root with one chain of composites per depth, each ending in a redirect
/// too large to inline under a 128 byte limit.
fn build(depths: &[usize]) -> (MetadataArena, NodeId) {
    let mut a = MetadataArena::new();
    let mut top = Vec::new();
    for (i, &depth) in depths.iter().enumerate() {
        let mut node = a.push(MetadataNode::SimpleRedirect { address: format!("addr://{i}/{}", "x".repeat(200)), content_type: None });
        let mut name = format!("big{i}");
        for d in 0..depth {
            node = a.push_composite(vec![(name, node)]);
            name = format!("c{i}_{d}");
        }
        // A small sibling that always stays inline.
        let small = a.push(MetadataNode::ArchiveInternalRedirect { path: format!("s{i}"), content_type: None });
        top.push((name, node));
        top.push((format!("s{i}"), small));
    }
    let root = a.push_composite(top);
    (a, root)
}

proptest! {
    #[test]
    fn k_unresolvable_nodes_give_k_aux_entries(depths in prop::collection::vec(0usize..5, 0..8)) {
        let (mut arena, root) = build(&depths);
        let limits = EncodeLimits::new(128);
        let mut entries = Vec::new();
        let report = resolve(&mut arena, root, limits, &MemoryBucketFactory, &mut entries).unwrap();

        let k = depths.len();
        prop_assert_eq!(report.aux_entries, k);
        prop_assert_eq!(report.attempts, if k == 0 { 1 } else { 2 });
        let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        let mut expected: Vec<_> = (0..k).map(aux_metadata_name).collect();
        expected.push(ROOT_METADATA_NAME.to_string());
        prop_assert_eq!(names, expected);

        // The patched tree now encodes, and every aux entry holds one big redirect.
        prop_assert!(matches!(arena.encode(root, &limits).unwrap(), Encoded::Bytes(_)));
        for e in &entries[..k] {
            let doc = decode(&e.payload.read_all().unwrap()).unwrap();
            prop_assert!(matches!(doc, Document::SimpleRedirect { .. }), "expected SimpleRedirect");
        }
        prop_assert!(decode(&entries[k].payload.read_all().unwrap()).is_ok());
    }
}

#[test]
fn split_descriptors_are_reachable_from_the_root() {
    let (mut arena, root) = build(&[0, 2]);
    let mut entries = Vec::new();
    resolve(&mut arena, root, EncodeLimits::new(128), &MemoryBucketFactory, &mut entries).unwrap();
    let root_doc = decode(&entries.last().unwrap().payload.read_all().unwrap()).unwrap();

    let Some(Document::ArchiveInternalRedirect { path, .. }) = root_doc.lookup("big0") else {
        panic!("big0 was not redirected");
    };
    assert!(path.starts_with(".metadata-"));
    assert!(matches!(root_doc.lookup("c1_1/c1_0"), Some(Document::Composite { .. })));
    assert!(matches!(
        root_doc.lookup("c1_1/c1_0/big1"),
        Some(Document::ArchiveInternalRedirect { .. })
    ));
    assert!(matches!(root_doc.lookup("s1"), Some(Document::ArchiveInternalRedirect { .. })));
}

#[test]
fn oversized_string_is_not_splittable() {
    let mut a = MetadataArena::new();
    let huge = a.push(MetadataNode::SimpleRedirect { address: "h".repeat(70_000), content_type: None });
    let root = a.push_composite(vec![("h".into(), huge)]);
    let mut entries = Vec::new();
    let err = resolve(&mut a, root, EncodeLimits::default(), &MemoryBucketFactory, &mut entries).unwrap_err();
    assert!(format!("{:#}", err).contains("longer than a descriptor field allows"), "{err:#}");
}
