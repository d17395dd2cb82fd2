//! End-to-end decoding of the fixture `*.sub`/`*.idx` pair.

use std::time::Duration;

use image::Rgba;

#[test]
fn decode_fixture_pair() {
    let _ = env_logger::builder().is_test(true).try_init();

    let decoded = subpicture::decode("fixtures/tiny.sub", false).unwrap();
    assert!(decoded.skipped.is_empty());
    assert_eq!(decoded.streams.len(), 1);

    // The fixture holds two subtitles; the second one arrives split
    // across two PES packets and must be reassembled.
    let subs = &decoded.streams[&0];
    assert_eq!(subs.len(), 2);
    assert_eq!(subs[0].start(), Duration::from_secs(2));
    assert_eq!(subs[0].stop(), Duration::from_millis(2800));
    assert_eq!(subs[1].start(), Duration::from_secs(4));
    assert_eq!(subs[1].stop(), Duration::from_millis(4800));

    for sub in subs {
        assert!(!sub.force());
        let coords = sub.coordinates();
        assert_eq!((coords.left(), coords.top()), (0, 0));
        assert_eq!((coords.width(), coords.height()), (8, 2));

        let img = sub.image();
        assert_eq!((img.width(), img.height()), (8, 2));
        for x in 0..8 {
            assert_eq!(img.get_pixel(x, 0), &Rgba([0x80, 0x80, 0x80, 239]));
            assert_eq!(img.get_pixel(x, 1), &Rgba([0xff, 0xff, 0xff, 239]));
        }
    }
}

#[test]
fn decode_fixture_pair_full_size() {
    let decoded = subpicture::decode("fixtures/tiny.sub", true).unwrap();
    let subs = &decoded.streams[&0];
    let img = subs[0].image();

    // The idx declares a 720x576 screen with origin (0, 0), so the
    // subtitle lands in the top-left corner of a transparent canvas.
    assert_eq!((img.width(), img.height()), (720, 576));
    assert_eq!(img.get_pixel(0, 0), &Rgba([0x80, 0x80, 0x80, 239]));
    assert_eq!(img.get_pixel(7, 1), &Rgba([0xff, 0xff, 0xff, 239]));
    assert_eq!(img.get_pixel(8, 0), &Rgba([0, 0, 0, 0]));
    assert_eq!(img.get_pixel(0, 2), &Rgba([0, 0, 0, 0]));
}

#[test]
fn decode_requires_a_sub_path() {
    let err = subpicture::decode("fixtures/tiny.idx", false).unwrap_err();
    assert!(matches!(err, subpicture::Error::NotASubFile { .. }));
}
