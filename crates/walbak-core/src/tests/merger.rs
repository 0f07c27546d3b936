use walbak_types::gid::Snap;
use walbak_types::uuid::Uuid;
use walbak_types::LOGICAL_BLOCK_SIZE;

use crate::diff::{DiffMerger, DiffReader, DiffRecord, RecIo};
use crate::testutil::{apply_records, normal_rec, random_blocks, write_wdiff_file};

const LBS: usize = LOGICAL_BLOCK_SIZE;

#[test]
fn merging_two_diffs_equals_sequential_application() {
    let dir = tempfile::tempdir().unwrap();
    let uuid = Uuid::generate();

    let d1_records = vec![
        normal_rec(0, random_blocks(4)),
        normal_rec(16, random_blocks(8)),
        normal_rec(40, random_blocks(2)),
    ];
    let d2_records = vec![
        normal_rec(2, random_blocks(4)), // overlaps d1's first record
        RecIo::new(DiffRecord::discard(18, 2), Vec::new()), // punches d1's middle
        normal_rec(50, random_blocks(1)),
    ];

    let p1 = dir.path().join("0-2.wdiff");
    let p2 = dir.path().join("2-4.wdiff");
    write_wdiff_file(&p1, uuid, Snap::clean(0), Snap::clean(2), &d1_records);
    write_wdiff_file(&p2, uuid, Snap::clean(2), Snap::clean(4), &d2_records);

    let mut merger = DiffMerger::new();
    merger.add_wdiff(&p1).unwrap();
    merger.add_wdiff(&p2).unwrap();
    let merged = merger.merged_diff().unwrap();
    assert_eq!(merged.snap_b, Snap::clean(0));
    assert_eq!(merged.snap_e, Snap::clean(4));
    let compacted = merger.into_records();

    // Equivalence on an arbitrary base, for every address.
    let base = random_blocks(64);
    let mut sequential = base.clone();
    apply_records(&mut sequential, &d1_records);
    apply_records(&mut sequential, &d2_records);
    let mut via_merge = base;
    apply_records(&mut via_merge, &compacted);
    assert_eq!(sequential, via_merge);

    // Compaction emits ascending, non-overlapping records.
    let mut prev_end = 0u64;
    for rio in &compacted {
        assert!(rio.start() >= prev_end);
        prev_end = rio.end();
    }
}

#[test]
fn merge_output_file_reloads_identically() {
    let dir = tempfile::tempdir().unwrap();
    let uuid = Uuid::generate();
    let d1 = vec![normal_rec(0, random_blocks(2))];
    let d2 = vec![normal_rec(1, random_blocks(2))];
    let p1 = dir.path().join("0-2.wdiff");
    let p2 = dir.path().join("2-4.wdiff");
    write_wdiff_file(&p1, uuid, Snap::clean(0), Snap::clean(2), &d1);
    write_wdiff_file(&p2, uuid, Snap::clean(2), Snap::clean(4), &d2);

    let mut merger = DiffMerger::new();
    merger.add_wdiff(&p1).unwrap();
    merger.add_wdiff(&p2).unwrap();
    let out_path = dir.path().join("0-4.wdiff");
    let out = std::fs::File::create(&out_path).unwrap();
    let merged = merger.write_to(out).unwrap();
    assert_eq!(merged.snap_b, Snap::clean(0));
    assert_eq!(merged.snap_e, Snap::clean(4));

    let size = std::fs::metadata(&out_path).unwrap().len();
    let mut reader = DiffReader::new(std::fs::File::open(&out_path).unwrap(), size).unwrap();
    assert_eq!(reader.header().uuid, uuid);
    assert_eq!(reader.header().diff.snap_b, Snap::clean(0));
    assert_eq!(reader.header().diff.snap_e, Snap::clean(4));

    let mut total_blocks = 0u64;
    while let Some((rec, data)) = reader.read_record().unwrap() {
        assert_eq!(data.len(), rec.io_blocks as usize * LBS);
        total_blocks += rec.io_blocks as u64;
    }
    // blocks 0..3 once each: record 0 trimmed to one block plus two new.
    assert_eq!(total_blocks, 3);
}

#[test]
fn broken_chain_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let uuid = Uuid::generate();
    let d = vec![normal_rec(0, random_blocks(1))];
    let p1 = dir.path().join("0-2.wdiff");
    let p2 = dir.path().join("4-6.wdiff");
    write_wdiff_file(&p1, uuid, Snap::clean(0), Snap::clean(2), &d);
    write_wdiff_file(&p2, uuid, Snap::clean(4), Snap::clean(6), &d);

    let mut merger = DiffMerger::new();
    merger.add_wdiff(&p1).unwrap();
    assert!(merger.add_wdiff(&p2).is_err());
}
