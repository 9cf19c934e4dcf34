use tbdgen_macho::test_fixtures::{build_cache, build_fat, DylibFixture};
use tbdgen_macho::{
    parse_file, parse_image, DscParseError, DscParseOptions, DscView, ImageParseError,
    MachParseOptions, ObjcConstraint, PackedVersion, Platform, TbdRecord, TbdVersion,
    TbdWriteOptions,
};

fn parse_cache(data: &[u8]) -> DscView<'_> {
    DscView::parse(data, DscParseOptions::ZERO_IMAGE_PADS).expect("cache should parse")
}

#[test]
fn cache_tables_and_paths() {
    let cache = build_cache(&[
        ("/usr/lib/libA.dylib", DylibFixture::new("/usr/lib/libA.dylib").export("_a")),
        ("/usr/lib/libB.dylib", DylibFixture::new("/usr/lib/libB.dylib").export("_b")),
        ("/System/libC.dylib", DylibFixture::new("/System/libC.dylib").export("_c")),
    ]);
    let view = parse_cache(&cache);

    assert_eq!(view.images_count(), 3);
    assert_eq!(view.image_path_at(0), "/usr/lib/libA.dylib");
    assert_eq!(view.image_path_at(2), "/System/libC.dylib");
    assert!(view.images.iter().all(|image| image.pad == 0));

    let address = view.images[1].address;
    let offset = view
        .file_offset_for_address(address)
        .expect("image address should be mapped");
    assert!((offset as usize) < cache.len());
}

#[test]
fn rejects_non_cache_magic() {
    let dylib = DylibFixture::new("/usr/lib/libA.dylib").export("_a").build(0);
    match DscView::parse(&dylib, DscParseOptions::ZERO_IMAGE_PADS) {
        Err(DscParseError::NotACache) => {}
        other => panic!("expected NotACache, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn parses_image_out_of_cache() {
    let cache = build_cache(&[(
        "/usr/lib/libdemo.dylib",
        DylibFixture::new("/usr/lib/libdemo.dylib")
            .export("_demo_run")
            .weak_export("_demo_weak")
            .export("_OBJC_CLASS_$_Demo")
            .export("_OBJC_IVAR_$_Demo._state"),
    )]);
    let view = parse_cache(&cache);

    let offset = view
        .file_offset_for_address(view.images[0].address)
        .unwrap();
    let mut record = TbdRecord::new(TbdVersion::V2);
    parse_image(&mut record, view.data(), offset, MachParseOptions::empty())
        .expect("image should parse");
    record.normalize();

    assert_eq!(record.install_name.as_deref(), Some("/usr/lib/libdemo.dylib"));
    assert_eq!(record.archs, vec!["arm64".to_string()]);
    assert_eq!(record.platform, Some(Platform::Ios));
    assert_eq!(record.current_version, Some(PackedVersion(0x0001_0000)));
    assert_eq!(record.objc_constraint, Some(ObjcConstraint::RetainRelease));

    let group = &record.exports[0];
    assert_eq!(group.symbols, vec!["_demo_run".to_string()]);
    assert_eq!(group.weak_symbols, vec!["_demo_weak".to_string()]);
    assert_eq!(group.objc_classes, vec!["Demo".to_string()]);
    assert_eq!(group.objc_ivars, vec!["Demo._state".to_string()]);
}

#[test]
fn image_without_exports_is_distinguished() {
    let cache = build_cache(&[(
        "/usr/lib/libempty.dylib",
        DylibFixture::new("/usr/lib/libempty.dylib"),
    )]);
    let view = parse_cache(&cache);
    let offset = view
        .file_offset_for_address(view.images[0].address)
        .unwrap();

    let mut record = TbdRecord::new(TbdVersion::V2);
    match parse_image(&mut record, view.data(), offset, MachParseOptions::empty()) {
        Err(ImageParseError::NoExports) => {}
        other => panic!("expected NoExports, got {other:?}"),
    }
    // The record is still populated so callers may write it out anyway.
    assert_eq!(
        record.install_name.as_deref(),
        Some("/usr/lib/libempty.dylib")
    );
}

#[test]
fn renders_cache_image_to_tbd_text() {
    let cache = build_cache(&[(
        "/usr/lib/libdemo.dylib",
        DylibFixture::new("/usr/lib/libdemo.dylib")
            .export("_demo_exit")
            .export("_demo_main"),
    )]);
    let view = parse_cache(&cache);
    let offset = view
        .file_offset_for_address(view.images[0].address)
        .unwrap();

    let mut record = TbdRecord::new(TbdVersion::V2);
    parse_image(&mut record, view.data(), offset, MachParseOptions::empty()).unwrap();
    record.normalize();

    let mut out = Vec::new();
    record
        .write_to(&mut out, TbdWriteOptions::IGNORE_UUIDS)
        .unwrap();
    let text = String::from_utf8(out).unwrap();
    let expected = "\
--- !tapi-tbd-v2
archs:           [ arm64 ]
platform:        ios
install-name:    /usr/lib/libdemo.dylib
current-version: 1
compatibility-version: 1
objc-constraint: retain_release
exports:
  - archs:           [ arm64 ]
    symbols:         [ _demo_exit, _demo_main ]
...
";
    assert_eq!(text, expected);
}

#[test]
fn uuids_respect_write_option() {
    let cache = build_cache(&[(
        "/usr/lib/libu.dylib",
        DylibFixture::new("/usr/lib/libu.dylib")
            .export("_u")
            .uuid([0x11; 16]),
    )]);
    let view = parse_cache(&cache);
    let offset = view
        .file_offset_for_address(view.images[0].address)
        .unwrap();

    let mut record = TbdRecord::new(TbdVersion::V2);
    parse_image(&mut record, view.data(), offset, MachParseOptions::empty()).unwrap();
    record.normalize();
    assert_eq!(record.uuids.len(), 1);

    let mut with_uuids = Vec::new();
    record.write_to(&mut with_uuids, TbdWriteOptions::empty()).unwrap();
    assert!(String::from_utf8(with_uuids).unwrap().contains("uuids:"));

    let mut without_uuids = Vec::new();
    record
        .write_to(&mut without_uuids, TbdWriteOptions::IGNORE_UUIDS)
        .unwrap();
    assert!(!String::from_utf8(without_uuids).unwrap().contains("uuids:"));
}

#[test]
fn fat_archive_members_merge() {
    const CPU_TYPE_X86_64: u32 = 0x0100_0007;
    const CPU_TYPE_ARM64: u32 = 0x0100_000c;

    let arm_member = DylibFixture::new("/usr/lib/libfat.dylib").export("_shared");
    let x86_member = arm_member.clone().cputype(CPU_TYPE_X86_64);
    let fat = build_fat(&[
        (CPU_TYPE_ARM64, 0, arm_member.build(0)),
        (CPU_TYPE_X86_64, 0, x86_member.build(0)),
    ]);

    let mut record = TbdRecord::new(TbdVersion::V2);
    parse_file(&mut record, &fat, MachParseOptions::empty()).expect("fat file should parse");
    record.normalize();

    assert_eq!(
        record.archs,
        vec!["arm64".to_string(), "x86_64".to_string()]
    );
    assert_eq!(record.install_name.as_deref(), Some("/usr/lib/libfat.dylib"));
    // Identical export sets collapse into one group spanning both archs.
    assert_eq!(record.exports.len(), 1);
    assert_eq!(record.exports[0].symbols, vec!["_shared".to_string()]);
}

#[test]
fn standalone_thin_dylib_parses() {
    let dylib = DylibFixture::new("/usr/lib/libthin.dylib")
        .export("_thin")
        .build(0);
    let mut record = TbdRecord::new(TbdVersion::V3);
    parse_file(&mut record, &dylib, MachParseOptions::empty()).unwrap();
    record.normalize();
    assert_eq!(record.install_name.as_deref(), Some("/usr/lib/libthin.dylib"));
    assert_eq!(record.exports[0].symbols, vec!["_thin".to_string()]);
}
