//! Fuzz target for bounding-box normalization.
//!
//! Coordinates come straight out of attacker-controlled XML attributes, so
//! `Geometry` must tolerate any f64, including NaN and infinities.

#![no_main]

use changeset_sync::diff::Geometry;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|bounds: (f64, f64, f64, f64)| {
    let (min_lon, min_lat, max_lon, max_lat) = bounds;
    let geom = Geometry::from_bounds(min_lon, min_lat, max_lon, max_lat);

    let _ = geom.exceeds_extent(10.0);
    let wkt = geom.to_wkt();
    assert!(wkt.starts_with("POINT") || wkt.starts_with("POLYGON"));

    // A collapsed box reports zero extent in both axes
    if let Geometry::Point { .. } = geom {
        assert_eq!(geom.width(), 0.0);
        assert_eq!(geom.height(), 0.0);
    }
});
