use proptest::prelude::*;
use sitepack_core::archive::{read_container_bucket, ArchiveType, ExtractedEntry};
use sitepack_core::bucket::{Bucket, MemoryBucket, MemoryBucketFactory};
use sitepack_core::container::{build_entries, pack_to_bucket};
use sitepack_core::manifest::{Directory, ManifestNode};
use sitepack_core::metadata::{decode, Document, EncodeLimits};
use std::collections::BTreeMap;

#[derive(Default)]
struct Tree {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeMap<String, Tree>,
}

impl Tree {
    fn insert(&mut self, path: &[String], data: Vec<u8>) {
        match path {
            [name] => {
                self.files.insert(name.clone(), data);
            }
            [dir, rest @ ..] => self.dirs.entry(dir.clone()).or_default().insert(rest, data),
            [] => unreachable!(),
        }
    }

    fn to_manifest(&self) -> Directory {
        let mut d = Directory::new();
        for (name, data) in &self.files {
            d.insert(name.clone(), ManifestNode::data(MemoryBucket::shared(data.clone()))).unwrap();
        }
        for (name, sub) in &self.dirs {
            d.insert(name.clone(), sub.to_manifest()).unwrap();
        }
        d
    }
}

prop_compose! {
    fn arb_path()(
        dirs in prop::collection::vec("d[a-c]", 0..3),
        file in "f[a-z0-9]{1,8}(\\.txt)?",
    ) -> Vec<String> {
        let mut p = dirs;
        p.push(file);
        p
    }
}

fn arb_files() -> impl Strategy<Value = BTreeMap<Vec<String>, Vec<u8>>> {
    prop::collection::btree_map(arb_path(), prop::collection::vec(any::<u8>(), 0..300), 0..24)
}

/// Follow `path` from the root descriptor, loading split-out descriptors as
/// they are met.
fn lookup(entries: &BTreeMap<String, Vec<u8>>, path: &[String]) -> Document {
    let mut doc = decode(&entries[".metadata"]).unwrap();
    for part in path {
        doc = follow_aux(entries, doc);
        doc = doc.lookup(part).cloned().unwrap_or_else(|| panic!("missing {part} in {path:?}"));
    }
    follow_aux(entries, doc)
}

fn follow_aux(entries: &BTreeMap<String, Vec<u8>>, doc: Document) -> Document {
    match &doc {
        Document::ArchiveInternalRedirect { path, .. } if path.starts_with(".metadata-") => {
            follow_aux(entries, decode(&entries[path]).unwrap())
        }
        _ => doc,
    }
}

fn check(files: &BTreeMap<Vec<String>, Vec<u8>>, format: ArchiveType, limit: usize) {
    let mut tree = Tree::default();
    for (path, data) in files {
        tree.insert(path, data.clone());
    }
    let manifest = tree.to_manifest();

    let (entries, report) = build_entries(&manifest, EncodeLimits::new(limit), &MemoryBucketFactory).unwrap();
    let (packed, content_type) = pack_to_bucket(&entries, format, &MemoryBucketFactory).unwrap();
    assert_eq!(content_type, format.content_type());

    let got: Vec<ExtractedEntry> = read_container_bucket(packed.as_ref(), format).unwrap();
    assert_eq!(got.len(), files.len() + report.aux_entries + 1);
    let by_name: BTreeMap<String, Vec<u8>> = got.into_iter().map(|e| (e.name, e.data)).collect();
    assert_eq!(by_name.len(), files.len() + report.aux_entries + 1, "duplicate entry names");

    for (path, data) in files {
        let name = path.join("/");
        assert_eq!(by_name.get(&name), Some(data), "payload of {name}");
        assert_eq!(
            lookup(&by_name, path),
            Document::ArchiveInternalRedirect { path: name.clone(), content_type: None }
        );
    }
    for name in by_name.keys() {
        let is_payload = files.keys().any(|p| p.join("/") == *name);
        assert!(is_payload || name.starts_with(".metadata"), "extraneous entry {name}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn tar_round_trip(files in arb_files(), limit in 64usize..512) {
        check(&files, ArchiveType::Tar, limit);
    }

    #[test]
    fn zip_round_trip(files in arb_files(), limit in 64usize..512) {
        check(&files, ArchiveType::Zip, limit);
    }
}

#[test]
fn site_scenario_tar() {
    let sub = Directory::new().with("b.txt", ManifestNode::data(MemoryBucket::shared(b"yo".to_vec()))).unwrap();
    let manifest = Directory::new()
        .with("a.txt", ManifestNode::data(MemoryBucket::shared(b"hi".to_vec())))
        .unwrap()
        .with("sub", sub)
        .unwrap();

    let (entries, report) = build_entries(&manifest, EncodeLimits::default(), &MemoryBucketFactory).unwrap();
    assert_eq!(report.aux_entries, 0);
    let (packed, _) = pack_to_bucket(&entries, ArchiveType::Tar, &MemoryBucketFactory).unwrap();
    let got = read_container_bucket(packed.as_ref(), ArchiveType::Tar).unwrap();

    let mut names: Vec<_> = got.iter().map(|e| (e.name.as_str(), e.data.len())).collect();
    names.sort();
    assert_eq!(names[1..], [("a.txt", 2), ("sub/b.txt", 2)]);
    assert_eq!(names[0].0, ".metadata");

    let root = decode(&got.iter().find(|e| e.name == ".metadata").unwrap().data).unwrap();
    let expected = Document::Composite {
        children: BTreeMap::from([
            ("a.txt".into(), Document::ArchiveInternalRedirect { path: "a.txt".into(), content_type: None }),
            (
                "sub".into(),
                Document::Composite {
                    children: BTreeMap::from([(
                        "b.txt".into(),
                        Document::ArchiveInternalRedirect { path: "sub/b.txt".into(), content_type: None },
                    )]),
                },
            ),
        ]),
    };
    assert_eq!(root, expected);
}

#[test]
fn redirect_scenario() {
    let manifest = Directory::new().with("x", ManifestNode::redirect("addr://X")).unwrap();
    let (entries, _) = build_entries(&manifest, EncodeLimits::default(), &MemoryBucketFactory).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, ".metadata");
    let root = decode(&entries[0].payload.read_all().unwrap()).unwrap();
    let Document::Composite { children } = root else { panic!("root is not a composite") };
    assert_eq!(children.len(), 1);
    assert_eq!(children["x"], Document::SimpleRedirect { address: "addr://X".into(), content_type: None });
}

#[test]
fn reserved_top_level_names_are_refused() {
    for name in [".metadata", ".metadata-0"] {
        let manifest =
            Directory::new().with(name, ManifestNode::data(MemoryBucket::shared(b"user".to_vec()))).unwrap();
        let err = build_entries(&manifest, EncodeLimits::new(40), &MemoryBucketFactory).unwrap_err();
        assert!(err.to_string().contains("reserved"), "{name}: {err:#}");
    }
}

#[test]
fn nested_metadata_names_keep_entries_unique() {
    let sub = Directory::new()
        .with(".metadata", ManifestNode::data(MemoryBucket::shared(b"user".to_vec())))
        .unwrap()
        .with(".metadata-0", ManifestNode::data(MemoryBucket::shared(b"more".to_vec())))
        .unwrap();
    let manifest = Directory::new().with("sub", sub).unwrap();
    let (entries, _) = build_entries(&manifest, EncodeLimits::default(), &MemoryBucketFactory).unwrap();
    let (bucket, _) = pack_to_bucket(&entries, ArchiveType::Tar, &MemoryBucketFactory).unwrap();
    let names: Vec<String> = read_container_bucket(bucket.as_ref(), ArchiveType::Tar)
        .unwrap()
        .into_iter()
        .map(|e: ExtractedEntry| e.name)
        .collect();
    assert_eq!(names, ["sub/.metadata", "sub/.metadata-0", ".metadata"]);
}
