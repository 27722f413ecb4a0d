//! File-backed integration tests: open, edit, flush and reopen.

use std::fs;
use std::path::{Path, PathBuf};

use fitsio_hdulist::{
    AccessMode, ColumnData, ColumnDef, Config, Error, Hdu, HduKind, HduList, HduState, ImageData,
    OpenMode, BLOCK_SIZE,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn named_image(name: &str, values: Vec<f32>, shape: &[usize]) -> Hdu {
    let mut hdu = Hdu::image(ImageData::F32(values), shape).unwrap();
    hdu.header_mut().set("EXTNAME", name, None).unwrap();
    hdu
}

fn catalog(rows: usize) -> Hdu {
    let columns = [
        ColumnDef::new("ID", "1J"),
        ColumnDef::new("NAME", "10A"),
        ColumnDef::new("SPECTRUM", "1PD(5)"),
    ];
    let mut hdu = Hdu::bintable(&columns, rows).unwrap();
    hdu.header_mut().set("EXTNAME", "CATALOG", None).unwrap();
    hdu
}

/// Primary, a 2x3 image called SCI and a three-row catalog.
fn write_sample(dir: &Path, config: Config) -> PathBuf {
    let path = dir.join("sample.fits");
    let mut list = HduList::with_config(config);
    list.push(Hdu::primary().unwrap()).unwrap();
    list.push(named_image("SCI", vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]))
        .unwrap();
    let mut table = catalog(3);
    for (row, (id, name)) in [(1, "alpha"), (2, "beta"), (3, "gamma")].into_iter().enumerate() {
        table.write_cell(row, "ID", &ColumnData::Int(vec![id])).unwrap();
        table
            .write_cell(row, "NAME", &ColumnData::Ascii(vec![name.to_string()]))
            .unwrap();
    }
    table.write_cell(0, "SPECTRUM", &ColumnData::Double(vec![0.5, 1.5])).unwrap();
    table.write_cell(1, "SPECTRUM", &ColumnData::Double(vec![2.5])).unwrap();
    table
        .write_cell(2, "SPECTRUM", &ColumnData::Double(vec![3.0, 4.0, 5.0]))
        .unwrap();
    list.push(table).unwrap();
    list.write_to(&path, false).unwrap();
    path
}

fn open(path: &Path, mode: OpenMode) -> HduList {
    HduList::open(path, mode, &Config::default()).unwrap()
}

fn pixels(list: &mut HduList, index: usize) -> Vec<f64> {
    list.get_mut(index).unwrap().read_image().unwrap().physical()
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

#[test]
fn written_file_is_block_aligned_and_reads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sample(dir.path(), Config::default());
    assert_eq!(fs::metadata(&path).unwrap().len() % BLOCK_SIZE as u64, 0);

    let mut list = open(&path, OpenMode::ReadOnly);
    assert_eq!(list.len(), 3);
    let kinds: Vec<HduKind> = list.iter().map(Hdu::kind).collect();
    assert_eq!(kinds, vec![HduKind::Primary, HduKind::Image, HduKind::BinTable]);
    assert_eq!(list.index_of("sci", None), Some(1));
    assert_eq!(list.get(1).unwrap().state(), HduState::Unloaded);
    assert_eq!(pixels(&mut list, 1), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(list.get(1).unwrap().state(), HduState::Mapped);
    assert_eq!(list.get(1).unwrap().shape().unwrap(), vec![2, 3]);

    let table = list.get_mut(2).unwrap();
    assert_eq!(table.header().get_str("TFORM3").unwrap(), "1PD(3)");
    assert_eq!(table.header().get_i64("PCOUNT").unwrap(), 48);
    assert_eq!(table.read_column("ID").unwrap(), ColumnData::Int(vec![1, 2, 3]));
    assert_eq!(
        table.read_row(1).unwrap()[1],
        ColumnData::Ascii(vec!["beta".to_string()])
    );
}

#[test]
fn headers_survive_a_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("header.fits");
    let long = "a long string value that cannot fit on one card, so it is spread \
                over CONTINUE cards; it even holds a quote: 'here'";
    let mut primary = Hdu::primary().unwrap();
    {
        let h = primary.header_mut();
        h.set("OBJECT", "M31", Some("target")).unwrap();
        h.set("LONGSTR", long, None).unwrap();
        h.set("DP1.AXIS.1", 2.0, Some("distortion axis")).unwrap();
        h.set("DP1.NAXES", 2i64, None).unwrap();
        h.add_history("created by the round-trip test").unwrap();
    }
    let mut list = HduList::new();
    list.push(primary).unwrap();
    list.write_to(&path, false).unwrap();

    let list = open(&path, OpenMode::ReadOnly);
    let h = list.get(0).unwrap().header();
    assert_eq!(h.get_str("OBJECT").unwrap(), "M31");
    assert_eq!(h.card("OBJECT").unwrap().comment(), Some("target"));
    assert_eq!(h.get_str("LONGSTR").unwrap(), long);
    assert!(h.card("LONGSTR").unwrap().card_count() > 1);
    assert_eq!(h.get_f64("DP1.AXIS.1").unwrap(), 2.0);
    assert_eq!(h.get_f64("DP1.NAXES").unwrap(), 2.0);
    assert_eq!(h.count("HISTORY"), 1);
}

#[test]
fn header_only_primary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.fits");
    let mut list = HduList::new();
    list.push(Hdu::primary().unwrap()).unwrap();
    list.write_to(&path, false).unwrap();
    assert_eq!(fs::metadata(&path).unwrap().len(), BLOCK_SIZE as u64);

    let mut list = open(&path, OpenMode::ReadOnly);
    let hdu = list.get_mut(0).unwrap();
    assert_eq!(hdu.kind(), HduKind::Primary);
    assert!(hdu.data().is_empty());
    assert!(hdu.data_bytes().unwrap().is_empty());
    assert!(list.to_string().contains("PRIMARY"));
}

#[test]
fn stream_and_copy_access_match_mapped_reads() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sample(dir.path(), Config::default());

    let stream = Config {
        access: AccessMode::Stream,
        ..Config::default()
    };
    let mut streamed = HduList::from_reader(fs::File::open(&path).unwrap(), &stream).unwrap();
    assert_eq!(streamed.len(), 3);
    assert_eq!(pixels(&mut streamed, 1), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert!(matches!(streamed.flush(), Err(Error::ReadOnly)));

    let copied = Config {
        use_memmap: false,
        ..Config::default()
    };
    let mut list = HduList::open(&path, OpenMode::ReadOnly, &copied).unwrap();
    assert_eq!(pixels(&mut list, 1), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(list.get(1).unwrap().state(), HduState::Materialized);
}

#[test]
fn ascii_table_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ascii.fits");
    let columns = [
        ColumnDef::new("STAR", "A8"),
        ColumnDef::new("COUNT", "I5").null(-99),
        ColumnDef::new("FLUX", "F8.2").unit("Jy"),
    ];
    let mut table = Hdu::ascii_table(&columns, 2).unwrap();
    table.write_cell(0, "STAR", &ColumnData::Ascii(vec!["vega".into()])).unwrap();
    table.write_cell(0, "COUNT", &ColumnData::Long(vec![12])).unwrap();
    table.write_cell(0, "FLUX", &ColumnData::Double(vec![0.25])).unwrap();
    table.write_cell(1, "COUNT", &ColumnData::Physical(vec![f64::NAN])).unwrap();
    let mut list = HduList::new();
    list.push(Hdu::primary().unwrap()).unwrap();
    list.push(table).unwrap();
    list.write_to(&path, false).unwrap();

    let mut list = open(&path, OpenMode::ReadOnly);
    let table = list.get_mut(1).unwrap();
    assert_eq!(table.kind(), HduKind::AsciiTable);
    assert_eq!(table.header().get_str("TUNIT3").unwrap(), "Jy");
    assert_eq!(
        table.read_column("STAR").unwrap(),
        ColumnData::Ascii(vec!["vega".into(), String::new()])
    );
    assert_eq!(table.read_column("COUNT").unwrap(), ColumnData::Long(vec![12, 0]));
    assert_eq!(&table.data_bytes().unwrap()[23 + 9..23 + 14], b"  -99");
}

#[test]
fn scaled_image_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scaled.fits");
    let mut hdu = Hdu::image(ImageData::I16(vec![0; 4]), &[4]).unwrap();
    {
        let h = hdu.header_mut();
        h.set("BSCALE", 2.0, None).unwrap();
        h.set("BZERO", 100.0, None).unwrap();
        h.set("BLANK", -1i64, None).unwrap();
    }
    hdu.write_physical(&[100.0, 102.0, 110.0, f64::NAN]).unwrap();
    let mut list = HduList::new();
    list.push(hdu).unwrap();
    list.write_to(&path, false).unwrap();

    let mut list = open(&path, OpenMode::ReadOnly);
    let hdu = list.get_mut(0).unwrap();
    assert_eq!(hdu.kind(), HduKind::Primary);
    assert_eq!(hdu.read_raw().unwrap(), ImageData::I16(vec![0, 1, 5, -1]));
    let physical = hdu.read_image().unwrap().physical();
    assert_eq!(&physical[..3], &[100.0, 102.0, 110.0]);
    assert!(physical[3].is_nan());
}

// ---------------------------------------------------------------------------
// Flushing
// ---------------------------------------------------------------------------

#[test]
fn flush_without_changes_leaves_the_file_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sample(dir.path(), Config::default());
    let before = fs::read(&path).unwrap();

    let mut list = open(&path, OpenMode::Update);
    assert!(!list.is_dirty());
    pixels(&mut list, 1);
    list.flush().unwrap();
    assert_eq!(fs::read(&path).unwrap(), before);
    assert_eq!(list.to_bytes().unwrap(), before);
    list.close().unwrap();
    assert_eq!(fs::read(&path).unwrap(), before);
}

#[test]
fn read_only_sessions_refuse_to_flush() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sample(dir.path(), Config::default());
    let mut list = open(&path, OpenMode::ReadOnly);
    list.get_mut(1).unwrap().header_mut().set("OBSERVER", "nobody", None).unwrap();
    assert!(matches!(list.flush(), Err(Error::ReadOnly)));
}

#[test]
fn same_size_edits_are_written_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sample(dir.path(), Config::default());
    let len = fs::metadata(&path).unwrap().len();

    let mut list = open(&path, OpenMode::Update);
    {
        let sci = list.get_mut(1).unwrap();
        sci.write_image(&ImageData::F32(vec![9.0, 8.0, 7.0, 6.0, 5.0, 4.0]))
            .unwrap();
        sci.header_mut().set("OBSERVER", "someone", None).unwrap();
        assert_eq!(sci.state(), HduState::Modified);
    }
    list.flush().unwrap();
    assert_eq!(list.get(1).unwrap().state(), HduState::Flushed);
    assert!(!list.is_dirty());
    assert_eq!(fs::metadata(&path).unwrap().len(), len);

    let mut list = open(&path, OpenMode::ReadOnly);
    assert_eq!(pixels(&mut list, 1), vec![9.0, 8.0, 7.0, 6.0, 5.0, 4.0]);
    assert_eq!(
        list.get(1).unwrap().header().get_str("OBSERVER").unwrap(),
        "someone"
    );
    assert_eq!(
        list.get_mut(2).unwrap().read_column("ID").unwrap(),
        ColumnData::Int(vec![1, 2, 3])
    );
}

#[test]
fn growing_a_table_rewrites_the_rest_of_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grow.fits");
    let mut list = HduList::new();
    list.push(Hdu::primary().unwrap()).unwrap();
    let mut table = catalog(2);
    table.write_cell(1, "ID", &ColumnData::Int(vec![42])).unwrap();
    table.write_cell(1, "SPECTRUM", &ColumnData::Double(vec![6.0])).unwrap();
    list.push(table).unwrap();
    list.push(named_image("AFTER", vec![1.5; 4], &[2, 2])).unwrap();
    list.write_to(&path, false).unwrap();

    let mut list = open(&path, OpenMode::Update);
    list.get_mut(1).unwrap().resize_rows(2000).unwrap();
    list.flush().unwrap();
    // The session follows the rewritten file.
    assert_eq!(pixels(&mut list, 2), vec![1.5; 4]);
    assert_eq!(fs::metadata(&path).unwrap().len() % BLOCK_SIZE as u64, 0);

    let mut list = open(&path, OpenMode::ReadOnly);
    let table = list.get_mut(1).unwrap();
    assert_eq!(table.num_rows().unwrap(), 2000);
    assert_eq!(table.header().get_i64("PCOUNT").unwrap(), 8);
    assert_eq!(
        table.read_row(1).unwrap()[2],
        ColumnData::VarArray(vec![ColumnData::Double(vec![6.0])])
    );
    assert_eq!(pixels(&mut list, 2), vec![1.5; 4]);
    assert_eq!(list.get(2).unwrap().name(), Some("AFTER"));
}

#[test]
fn rewriting_one_array_keeps_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sample(dir.path(), Config::default());

    let mut list = open(&path, OpenMode::Update);
    list.get_mut(2)
        .unwrap()
        .write_cell(1, "SPECTRUM", &ColumnData::Double(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]))
        .unwrap();
    list.flush().unwrap();

    let mut list = open(&path, OpenMode::ReadOnly);
    let table = list.get_mut(2).unwrap();
    assert_eq!(table.header().get_str("TFORM3").unwrap(), "1PD(6)");
    assert_eq!(
        table.read_column("SPECTRUM").unwrap(),
        ColumnData::VarArray(vec![
            ColumnData::Double(vec![0.5, 1.5]),
            ColumnData::Double(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            ColumnData::Double(vec![3.0, 4.0, 5.0]),
        ])
    );
}

#[test]
fn insert_and_pop_then_flush() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("structure.fits");
    let mut list = HduList::new();
    list.push(Hdu::primary().unwrap()).unwrap();
    list.push(named_image("A", vec![1.0; 4], &[2, 2])).unwrap();
    list.push(named_image("B", vec![2.0; 6], &[3, 2])).unwrap();
    list.write_to(&path, false).unwrap();

    let mut list = open(&path, OpenMode::Update);
    list.pop(0).unwrap();
    list.insert(1, named_image("C", vec![3.0; 2], &[2])).unwrap();
    assert!(list.is_dirty());
    list.flush().unwrap();

    let mut list = open(&path, OpenMode::ReadOnly);
    let names: Vec<Option<&str>> = list.iter().map(Hdu::name).collect();
    assert_eq!(names, vec![Some("A"), Some("C"), Some("B")]);
    assert_eq!(list.get(0).unwrap().kind(), HduKind::Primary);
    assert_eq!(list.get(1).unwrap().kind(), HduKind::Image);
    assert_eq!(pixels(&mut list, 0), vec![1.0; 4]);
    assert_eq!(pixels(&mut list, 1), vec![3.0; 2]);
    assert_eq!(pixels(&mut list, 2), vec![2.0; 6]);
}

#[test]
fn write_to_refuses_to_clobber() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sample(dir.path(), Config::default());
    let mut list = open(&path, OpenMode::ReadOnly);
    match list.write_to(&path, false) {
        Err(Error::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::AlreadyExists),
        other => panic!("Expected AlreadyExists, got {:?}", other),
    }
    let copy = dir.path().join("copy.fits");
    list.write_to(&copy, false).unwrap();
    assert_eq!(fs::read(&copy).unwrap(), fs::read(&path).unwrap());
}

// ---------------------------------------------------------------------------
// Checksums
// ---------------------------------------------------------------------------

#[test]
fn checksums_stay_valid_across_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default().checksum(true);
    let path = write_sample(dir.path(), config.clone());

    let mut list = HduList::open(&path, OpenMode::Update, &config).unwrap();
    assert!(list.iter().all(Hdu::has_checksum));
    assert!(list.verify_checksums().unwrap().is_empty());
    list.get_mut(1)
        .unwrap()
        .write_image(&ImageData::F32(vec![0.0; 6]))
        .unwrap();
    list.flush().unwrap();

    let mut list = open(&path, OpenMode::ReadOnly);
    assert!(list.verify_checksums().unwrap().is_empty());
    let datasum = list.get(1).unwrap().header().get_str("DATASUM").unwrap();
    assert_eq!(datasum, "0");
}

#[test]
fn corrupted_data_fails_verification() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sample(dir.path(), Config::default().checksum(true));

    let mut bytes = fs::read(&path).unwrap();
    let data_offset = {
        let list = open(&path, OpenMode::ReadOnly);
        list.get(1).unwrap().location().unwrap().data_offset as usize
    };
    bytes[data_offset] ^= 0x40;
    fs::write(&path, &bytes).unwrap();

    let mut list = open(&path, OpenMode::ReadOnly);
    let problems = list.verify_checksums().unwrap();
    assert!(!problems.is_empty());
    assert!(problems.iter().all(|p| matches!(p, Error::Hdu { index: 1, .. })));
    assert!(problems
        .iter()
        .any(|p| matches!(p.root(), Error::Checksum { keyword: "DATASUM", .. })));
}

// ---------------------------------------------------------------------------
// Malformed headers
// ---------------------------------------------------------------------------

/// Replace the card starting with `prefix` in the file at `path`.
fn patch_card(path: &Path, prefix: &str, card: &str) {
    let mut bytes = fs::read(path).unwrap();
    let at = bytes
        .chunks(80)
        .position(|c| c.starts_with(prefix.as_bytes()))
        .unwrap()
        * 80;
    bytes[at..at + 80].copy_from_slice(format!("{card:<80}").as_bytes());
    fs::write(path, &bytes).unwrap();
}

#[test]
fn overflowing_tform_is_reported_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sample(dir.path(), Config::default());
    patch_card(&path, "TFORM1  =", "TFORM1  = '4611686018427387904J'");

    assert!(HduList::open(&path, OpenMode::ReadOnly, &Config::default().strict(true)).is_err());

    let mut list = open(&path, OpenMode::ReadOnly);
    assert!(!list.get(2).unwrap().warnings().is_empty());
    assert_eq!(pixels(&mut list, 1), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert!(list.get_mut(2).unwrap().read_column("ID").is_err());
}
