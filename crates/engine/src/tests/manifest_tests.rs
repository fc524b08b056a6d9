use super::*;
use anyhow::Result;
use tempfile::tempdir;

#[test]
fn missing_manifest_starts_empty() -> Result<()> {
    let dir = tempdir()?;
    let m = Manifest::load_or_create(dir.path())?;
    assert_eq!(m.next_file_number, 1);
    assert_eq!(m.checkpoint_seq, 0);
    assert!(m.segments.is_empty());
    assert!(!m.path().exists());
    assert!(Manifest::load(dir.path()).is_err());
    Ok(())
}

#[test]
fn save_and_reload() -> Result<()> {
    let dir = tempdir()?;
    let mut m = Manifest::load_or_create(dir.path())?;
    let a = m.allocate_file_number();
    let b = m.allocate_file_number();
    m.segments = vec![a, b];
    m.checkpoint_seq = 42;
    m.save()?;

    let loaded = Manifest::load(dir.path())?;
    assert_eq!(loaded, m);
    assert_eq!(loaded.next_file_number, 3);

    let text = fs::read_to_string(m.path())?;
    assert!(text.contains("segment: 000001.sst"));
    assert!(text.contains("checkpoint_seq: 42"));
    assert!(!dir.path().join("MANIFEST.tmp").exists());
    Ok(())
}

#[test]
fn comments_and_blank_lines_are_ignored() -> Result<()> {
    let dir = tempdir()?;
    fs::write(
        dir.path().join(manifest::MANIFEST_FILENAME),
        "# header\n\nnext_file_number: 9\n  checkpoint_seq: 5\n# note\nsegment: 000004.sst\n",
    )?;
    let m = Manifest::load(dir.path())?;
    assert_eq!((m.next_file_number, m.checkpoint_seq), (9, 5));
    assert_eq!(m.segments, vec![4]);
    Ok(())
}

#[test]
fn malformed_manifests_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join(manifest::MANIFEST_FILENAME);
    let cases = [
        "next_file_number: 2\n",                                        // no checkpoint
        "next_file_number: x\ncheckpoint_seq: 0\n",                     // bad number
        "next_file_number: 2\ncheckpoint_seq: 0\nsegment: foo.sst\n",   // bad name
        "next_file_number: 2\ncheckpoint_seq: 0\nlevel: 1\n",           // unknown field
        "next_file_number: 2\ncheckpoint_seq: 0\nsegment: 000007.sst\n", // number too high
    ];
    for case in cases {
        fs::write(&path, case)?;
        let err = Manifest::load(dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::Manifest(_)), "{:?}: {}", case, err);
    }
    Ok(())
}

#[test]
fn replace_segments_keeps_position() -> Result<()> {
    let dir = tempdir()?;
    let mut m = Manifest::load_or_create(dir.path())?;
    m.segments = vec![1, 2, 3, 4];

    assert!(m.replace_segments(&[1, 2], &[7, 8]));
    assert_eq!(m.segments, vec![7, 8, 3, 4]);

    assert!(m.replace_segments(&[8, 3], &[]));
    assert_eq!(m.segments, vec![7, 4]);

    // not a contiguous run
    assert!(!m.replace_segments(&[7, 9], &[10]));
    assert!(!m.replace_segments(&[], &[10]));
    assert_eq!(m.segments, vec![7, 4]);

    m.remove_segment(7);
    assert_eq!(m.segments, vec![4]);
    Ok(())
}
