use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::process::Command;

use patchwire::{
    apply_patch, write_patch, BsdiffHeader, CompressionAlgorithm, CompressionSettings,
    Container, DiffOptions, NoProgress, PatchError, PatchHeader, PatchOptions, SyncHeader,
    SyncOp, SyncType, WireWriter, PATCH_MAGIC,
};
use proptest::prelude::*;

fn patcher_exe() -> &'static str {
    env!("CARGO_BIN_EXE_patchwire")
}

fn pattern(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

fn make_patch(
    target: &Container,
    target_data: &[u8],
    source: &Container,
    source_data: &[u8],
    options: &PatchOptions,
) -> Vec<u8> {
    let (patch, _) = write_patch(
        Vec::new(),
        target,
        target_data,
        source,
        source_data,
        options,
        &mut NoProgress,
    )
    .unwrap();
    patch
}

fn single_file_patch(old: &[u8], new: &[u8], options: &PatchOptions) -> Vec<u8> {
    make_patch(
        &Container::single_file("old.bin", old.len() as u64),
        old,
        &Container::single_file("new.bin", new.len() as u64),
        new,
        options,
    )
}

/// Write a single-file patch by hand, for feeding malformed op streams.
fn hand_written_patch(old_len: u64, new_len: u64, ops: &[SyncOp]) -> Vec<u8> {
    let compression = CompressionSettings::none();
    let mut raw = WireWriter::new(Vec::new());
    raw.write_magic(PATCH_MAGIC).unwrap();
    raw.write_message(&PatchHeader { compression }).unwrap();
    let mut wire = raw.compress(&compression).unwrap();
    wire.write_message(&Container::single_file("old.bin", old_len))
        .unwrap();
    wire.write_message(&Container::single_file("new.bin", new_len))
        .unwrap();
    wire.write_message(&SyncHeader {
        file_index: 0,
        kind: SyncType::Bsdiff,
    })
    .unwrap();
    wire.write_message(&BsdiffHeader { target_index: 0 })
        .unwrap();
    for op in ops {
        wire.write_message(op).unwrap();
    }
    wire.finish().unwrap()
}

#[test]
fn test_single_file_round_trip_all_codecs() {
    let old = pattern(200_000, 1);
    let mut new = old.clone();
    new[5000..5100].copy_from_slice(&pattern(100, 2));
    new.splice(120_000..120_000, b"inserted in the middle".iter().copied());
    new.truncate(180_000);

    for algorithm in [
        CompressionAlgorithm::None,
        CompressionAlgorithm::Brotli,
        CompressionAlgorithm::Zstd,
    ] {
        let options = PatchOptions {
            compression: CompressionSettings {
                algorithm,
                quality: 3,
            },
            ..PatchOptions::default()
        };
        let patch = single_file_patch(&old, &new, &options);
        assert!(
            patch.len() < new.len() / 10,
            "{:?} patch is {} bytes",
            algorithm,
            patch.len()
        );

        let applied = apply_patch(Cursor::new(&patch), &old, &mut NoProgress).unwrap();
        assert_eq!(applied.header.compression.algorithm, algorithm);
        assert_eq!(applied.data, new);
    }
}

#[test]
fn test_zero_padded_image_patch_is_small() {
    let mut old = pattern(512, 5);
    old.resize(64 * 1024, 0);
    let mut new = old.clone();
    new[100..116].copy_from_slice(&pattern(16, 9));

    let options = PatchOptions {
        compression: CompressionSettings::none(),
        ..PatchOptions::default()
    };
    let patch = single_file_patch(&old, &new, &options);
    assert!(patch.len() < 1024, "patch is {} bytes", patch.len());

    let applied = apply_patch(Cursor::new(&patch), &old, &mut NoProgress).unwrap();
    assert_eq!(applied.data, new);
}

#[test]
fn test_multi_file_round_trip() {
    let a_old = pattern(10_000, 3);
    let b_old = pattern(20_000, 4);
    let target = Container::pack([
        ("bin/app", 0o755, a_old.len() as u64),
        ("data/assets.pak", 0o644, b_old.len() as u64),
    ]);
    let target_data = [a_old.clone(), b_old.clone()].concat();

    let mut a_new = a_old.clone();
    a_new[10] = !a_new[10];
    let b_new = [&b_old[5000..], &b_old[..5000]].concat();
    let extra = pattern(3000, 5);
    let empty: Vec<u8> = Vec::new();
    let source = Container::pack([
        ("bin/app", 0o755, a_new.len() as u64),
        ("data/assets.pak", 0o644, b_new.len() as u64),
        ("data/empty", 0o644, 0),
        ("data/extra.bin", 0o644, extra.len() as u64),
    ]);
    let source_data = [a_new.clone(), b_new.clone(), empty, extra.clone()].concat();

    let patch = make_patch(
        &target,
        &target_data,
        &source,
        &source_data,
        &PatchOptions::default(),
    );
    let applied = apply_patch(Cursor::new(&patch), &target_data, &mut NoProgress).unwrap();

    assert_eq!(applied.source, source);
    assert_eq!(applied.target, target);
    assert_eq!(applied.file_data(0).unwrap(), &a_new[..]);
    assert_eq!(applied.file_data(1).unwrap(), &b_new[..]);
    assert!(applied.file_data(2).unwrap().is_empty());
    assert_eq!(applied.file_data(3).unwrap(), &extra[..]);
}

#[test]
fn test_format_is_deterministic() {
    let old = pattern(80_000, 6);
    let mut new = old.clone();
    new[40_000..40_050].fill(0x11);
    let options = PatchOptions {
        diff: DiffOptions {
            partitions: 3,
            suffix_sort_concurrency: 4,
            ..DiffOptions::default()
        },
        ..PatchOptions::default()
    };

    let first = single_file_patch(&old, &new, &options);
    let second = single_file_patch(&old, &new, &options);
    assert_eq!(first, second);
}

#[test]
fn test_empty_files() {
    let patch = single_file_patch(b"", b"", &PatchOptions::default());
    let applied = apply_patch(Cursor::new(&patch), b"", &mut NoProgress).unwrap();
    assert!(applied.data.is_empty());

    let patch = single_file_patch(b"old contents", b"", &PatchOptions::default());
    let applied = apply_patch(Cursor::new(&patch), b"old contents", &mut NoProgress).unwrap();
    assert!(applied.data.is_empty());
}

#[test]
fn test_missing_terminator_is_format_error() {
    let old = b"0123456789";
    let patch = hand_written_patch(10, 10, &[SyncOp::Copy {
        offset: 0,
        length: 10,
    }]);
    let err = apply_patch(Cursor::new(&patch), old, &mut NoProgress).unwrap_err();
    assert!(err.is_format(), "{err}");
}

#[test]
fn test_truncated_compressed_patch_fails() {
    let old = pattern(50_000, 7);
    let new = pattern(50_000, 8);
    let patch = single_file_patch(&old, &new, &PatchOptions::default());
    let truncated = &patch[..patch.len() / 2];
    assert!(apply_patch(Cursor::new(truncated), &old, &mut NoProgress).is_err());
}

#[test]
fn test_copy_beyond_target_is_range_error() {
    let old = b"0123456789";
    let patch = hand_written_patch(
        10,
        4,
        &[
            SyncOp::Copy {
                offset: 11,
                length: 4,
            },
            SyncOp::HeyYouDidIt,
        ],
    );
    let err = apply_patch(Cursor::new(&patch), old, &mut NoProgress).unwrap_err();
    assert!(err.is_range(), "{err}");
}

#[test]
fn test_short_output_is_consistency_error() {
    let old = b"0123456789";
    let patch = hand_written_patch(
        10,
        10,
        &[
            SyncOp::Copy {
                offset: 0,
                length: 6,
            },
            SyncOp::HeyYouDidIt,
        ],
    );
    let err = apply_patch(Cursor::new(&patch), old, &mut NoProgress).unwrap_err();
    assert!(err.is_consistency(), "{err}");
}

#[test]
fn test_long_output_is_consistency_error() {
    let old = b"0123456789";
    let patch = hand_written_patch(
        10,
        3,
        &[
            SyncOp::Copy {
                offset: 0,
                length: 10,
            },
            SyncOp::HeyYouDidIt,
        ],
    );
    let err = apply_patch(Cursor::new(&patch), old, &mut NoProgress).unwrap_err();
    assert!(err.is_consistency(), "{err}");
}

#[test]
fn test_trailing_data_after_terminator() {
    let mut patch = hand_written_patch(
        3,
        3,
        &[
            SyncOp::Copy {
                offset: 0,
                length: 3,
            },
            SyncOp::HeyYouDidIt,
        ],
    );
    patch.extend_from_slice(&[5, 0, 0, 0, 0]);
    let err = apply_patch(Cursor::new(&patch), b"abc", &mut NoProgress).unwrap_err();
    assert!(err.is_format(), "{err}");
}

#[test]
fn test_sync_header_out_of_range() {
    let compression = CompressionSettings::none();
    let mut raw = WireWriter::new(Vec::new());
    raw.write_magic(PATCH_MAGIC).unwrap();
    raw.write_message(&PatchHeader { compression }).unwrap();
    let mut wire = raw.compress(&compression).unwrap();
    wire.write_message(&Container::single_file("a", 1)).unwrap();
    wire.write_message(&Container::single_file("a", 1)).unwrap();
    wire.write_message(&SyncHeader {
        file_index: 3,
        kind: SyncType::Bsdiff,
    })
    .unwrap();
    let patch = wire.finish().unwrap();

    let err = apply_patch(Cursor::new(&patch), b"x", &mut NoProgress).unwrap_err();
    assert!(err.is_format(), "{err}");
}

#[test]
fn test_container_before_header_rejected() {
    let mut raw = WireWriter::new(Vec::new());
    raw.write_magic(PATCH_MAGIC).unwrap();
    raw.write_message(&Container::single_file("a", 1)).unwrap();
    let patch = raw.finish().unwrap();

    let err = apply_patch(Cursor::new(&patch), b"x", &mut NoProgress).unwrap_err();
    assert!(err.is_format(), "{err}");
}

#[test]
fn test_wrong_magic_rejected() {
    let mut patch = single_file_patch(b"abc", b"abd", &PatchOptions::default());
    patch[0] ^= 0xFF;
    let err = apply_patch(Cursor::new(&patch), b"abc", &mut NoProgress).unwrap_err();
    assert!(err.is_format(), "{err}");
}

#[test]
fn test_wrong_target_data_rejected() {
    let patch = single_file_patch(b"abcdef", b"abcxyz", &PatchOptions::default());
    let err = apply_patch(Cursor::new(&patch), b"abc", &mut NoProgress).unwrap_err();
    assert!(matches!(err, PatchError::InvalidContainer(_)));
}

fn run(dir: &Path, args: &[&str]) -> std::process::Output {
    Command::new(patcher_exe())
        .current_dir(dir)
        .args(args)
        .output()
        .expect("Failed to run patchwire")
}

#[test]
fn test_end_to_end_cli_cycle() {
    let temp = tempfile::tempdir().unwrap();
    let old = pattern(300_000, 9);
    let mut new = old.clone();
    new[1000..1016].copy_from_slice(b"version 2 header");
    new.extend_from_slice(&pattern(4096, 10));
    fs::write(temp.path().join("old.bin"), &old).unwrap();
    fs::write(temp.path().join("new.bin"), &new).unwrap();

    let output = run(
        temp.path(),
        &[
            "diff",
            "old.bin",
            "new.bin",
            "--output",
            "update.patch",
            "--partitions",
            "2",
            "--concurrency",
            "2",
        ],
    );
    assert!(
        output.status.success(),
        "patchwire diff failed:\nstderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let patch_size = fs::metadata(temp.path().join("update.patch")).unwrap().len();
    assert!(patch_size > 4);
    assert!(patch_size < new.len() as u64 / 10, "patch is {} bytes", patch_size);

    let output = run(
        temp.path(),
        &[
            "apply",
            "old.bin",
            "--patch",
            "update.patch",
            "--output",
            "rebuilt.bin",
        ],
    );
    assert!(
        output.status.success(),
        "patchwire apply failed:\nstderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(fs::read(temp.path().join("rebuilt.bin")).unwrap(), new);
}

#[test]
fn test_cli_rejects_absolute_paths() {
    let temp = tempfile::tempdir().unwrap();
    let old = temp.path().join("old.bin");
    fs::write(&old, b"old").unwrap();
    fs::write(temp.path().join("new.bin"), b"new").unwrap();

    let output = run(
        temp.path(),
        &[
            "diff",
            old.to_str().unwrap(),
            "new.bin",
            "--output",
            "update.patch",
        ],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("only works with relative paths"));
    assert!(!temp.path().join("update.patch").exists());
}

fn partitioned(partitions: usize) -> PatchOptions {
    PatchOptions {
        compression: CompressionSettings::none(),
        diff: DiffOptions {
            partitions,
            suffix_sort_concurrency: 2,
            ..DiffOptions::default()
        },
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn round_trip_arbitrary_bytes(
        old in prop::collection::vec(any::<u8>(), 0..2000),
        new in prop::collection::vec(any::<u8>(), 0..2000),
        partitions in 1usize..6,
    ) {
        let patch = single_file_patch(&old, &new, &partitioned(partitions));
        let applied = apply_patch(Cursor::new(&patch), &old, &mut NoProgress)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(applied.data, new);
    }

    #[test]
    fn round_trip_edited_copies(
        old in prop::collection::vec(0u8..4, 1..3000),
        cut in any::<prop::sample::Index>(),
        insert in prop::collection::vec(any::<u8>(), 0..50),
        partitions in 1usize..6,
    ) {
        let at = cut.index(old.len());
        let mut new = old.clone();
        new.splice(at..at, insert);
        let patch = single_file_patch(&old, &new, &partitioned(partitions));
        let applied = apply_patch(Cursor::new(&patch), &old, &mut NoProgress)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(applied.data, new);
    }
}
