//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use proptest::prelude::*;

use changeset_sync::diff::{decompress_payload, ChangesetReader, Geometry, COORD_EPSILON};
use changeset_sync::resilience::RetryConfig;
use changeset_sync::{ReplicationClient, ReplicationConfig};
use std::time::Duration;

// =============================================================================
// Diff URL Layout
// =============================================================================

fn client_for(base_url: &str) -> ReplicationClient {
    let config = ReplicationConfig {
        base_url: base_url.to_string(),
        ..ReplicationConfig::default()
    };
    ReplicationClient::new(&config).unwrap()
}

proptest! {
    /// Every sequence maps to three zero-padded directory levels whose
    /// digits reassemble into the sequence.
    #[test]
    fn diff_url_three_level_fanout(seq in 0u64..=999_999_999) {
        let client = client_for("https://planet.example.org/replication/changesets");
        let url = client.diff_url(seq);

        let tail = url
            .strip_prefix("https://planet.example.org/replication/changesets/")
            .expect("base url prefix");
        let tail = tail.strip_suffix(".osm.gz").expect(".osm.gz suffix");
        let parts: Vec<&str> = tail.split('/').collect();

        prop_assert_eq!(parts.len(), 3);
        for part in &parts {
            prop_assert_eq!(part.len(), 3);
            prop_assert!(part.chars().all(|c| c.is_ascii_digit()));
        }
        prop_assert_eq!(parts.concat().parse::<u64>().unwrap(), seq);
    }

    /// A trailing slash on the base URL changes nothing.
    #[test]
    fn diff_url_trailing_slash_normalized(seq in 0u64..=999_999_999) {
        let plain = client_for("https://example.org/changesets");
        let slashed = client_for("https://example.org/changesets/");
        prop_assert_eq!(plain.diff_url(seq), slashed.diff_url(seq));
    }
}

// =============================================================================
// Geometry Normalization
// =============================================================================

proptest! {
    /// A box narrower than the coordinate epsilon on either axis
    /// collapses to a point at the midpoint.
    #[test]
    fn geometry_sub_epsilon_box_collapses_to_point(
        lon in -179.0f64..179.0,
        lat in -89.0f64..89.0,
        eps in 0f64..1e-9,
    ) {
        let geometry = Geometry::from_bounds(lon, lat, lon + eps, lat + 0.5);
        prop_assert!(geometry.is_point());
        prop_assert_eq!(geometry.width(), 0.0);
        prop_assert_eq!(geometry.height(), 0.0);

        if let Geometry::Point { lon: px, lat: py } = geometry {
            prop_assert!((px - lon).abs() < 1e-6);
            prop_assert!((py - (lat + 0.25)).abs() < 1e-6);
        }
    }

    /// Boxes wide on both axes stay boxes with their bounds intact.
    #[test]
    fn geometry_wide_box_preserved(
        min_lon in -170.0f64..160.0,
        min_lat in -80.0f64..70.0,
        width in 0.001f64..10.0,
        height in 0.001f64..10.0,
    ) {
        let geometry = Geometry::from_bounds(
            min_lon,
            min_lat,
            min_lon + width,
            min_lat + height,
        );

        prop_assert!(!geometry.is_point());
        prop_assert!((geometry.width() - width).abs() < COORD_EPSILON);
        prop_assert!((geometry.height() - height).abs() < COORD_EPSILON);
    }

    /// Extent filtering is a strict threshold on the wider axis.
    #[test]
    fn geometry_extent_check_consistent(
        min_lon in -80.0f64..80.0,
        min_lat in -40.0f64..40.0,
        width in 0.01f64..90.0,
        height in 0.01f64..40.0,
    ) {
        let geometry = Geometry::from_bounds(
            min_lon,
            min_lat,
            min_lon + width,
            min_lat + height,
        );

        // Margins keep float roundoff away from the threshold.
        prop_assert!(!geometry.exceeds_extent(width.max(height) + 1.0));
        prop_assert!(geometry.exceeds_extent(width.max(height) / 2.0 - 0.001));
    }

    /// WKT output always names one of the two geometry kinds.
    #[test]
    fn geometry_wkt_well_formed(
        min_lon in -170.0f64..160.0,
        min_lat in -80.0f64..70.0,
        width in 0f64..10.0,
        height in 0f64..10.0,
    ) {
        let wkt = Geometry::from_bounds(
            min_lon,
            min_lat,
            min_lon + width,
            min_lat + height,
        )
        .to_wkt();

        prop_assert!(
            wkt.starts_with("POINT(") || wkt.starts_with("POLYGON(("),
            "unexpected WKT: {}",
            wkt
        );
    }
}

// =============================================================================
// Parser Robustness
// =============================================================================

proptest! {
    /// Arbitrary bytes never panic the parser; it either yields events
    /// or reports an error, and always terminates.
    #[test]
    fn parser_never_panics_on_arbitrary_bytes(
        data in prop::collection::vec(any::<u8>(), 0..2048)
    ) {
        let mut reader = ChangesetReader::new(data.as_slice());
        loop {
            match reader.next_event() {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
    }

    /// Well-formed changeset elements all come back out with their ids.
    #[test]
    fn parser_yields_every_well_formed_changeset(
        ids in prop::collection::vec(1i64..1_000_000_000, 1..50)
    ) {
        let mut xml = String::from("<osm>");
        for id in &ids {
            xml.push_str(&format!(
                r#"<changeset id="{id}" created_at="2023-05-01T12:00:00Z" open="true"/>"#
            ));
        }
        xml.push_str("</osm>");

        let mut reader = ChangesetReader::new(xml.as_bytes());
        let mut parsed = Vec::new();
        while let Some(event) = reader.next_event().unwrap() {
            parsed.push(event.id);
        }

        prop_assert_eq!(parsed, ids);
        prop_assert_eq!(reader.skipped(), 0);
    }
}

// =============================================================================
// Decompression
// =============================================================================

proptest! {
    /// Gzip payloads round-trip through the sniffing decompressor.
    #[test]
    fn decompress_gzip_roundtrip(data in prop::collection::vec(any::<u8>(), 0..4096)) {
        use std::io::Write;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&data).unwrap();
        let compressed = encoder.finish().unwrap();

        prop_assert_eq!(decompress_payload(&compressed).unwrap(), data);
    }

    /// Zstd payloads round-trip through the sniffing decompressor.
    #[test]
    fn decompress_zstd_roundtrip(data in prop::collection::vec(any::<u8>(), 1..4096)) {
        let compressed = zstd::encode_all(&data[..], 3).unwrap();
        prop_assert_eq!(decompress_payload(&compressed).unwrap(), data);
    }

    /// Data without a known magic passes through byte for byte.
    #[test]
    fn decompress_passthrough_unknown_format(
        data in prop::collection::vec(any::<u8>(), 0..1024)
    ) {
        let mut safe = data;
        if safe.len() >= 2 && safe[..2] == [0x1f, 0x8b] {
            safe[0] = 0x00;
        }
        if safe.len() >= 4 && safe[..4] == [0x28, 0xb5, 0x2f, 0xfd] {
            safe[0] = 0x00;
        }

        let out = decompress_payload(&safe).unwrap();
        prop_assert_eq!(out, safe);
    }
}

// =============================================================================
// Retry Backoff
// =============================================================================

proptest! {
    /// Delays never decrease from one attempt to the next and never
    /// exceed the configured ceiling.
    #[test]
    fn backoff_monotone_and_capped(
        initial_ms in 1u64..10_000,
        max_ms in 1u64..600_000,
        factor in 1.0f64..3.0,
        attempts in 2usize..25,
    ) {
        let config = RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_factor: factor,
            request_timeout: Duration::from_secs(1),
        };

        let mut prev = Duration::ZERO;
        for attempt in 1..=attempts {
            let delay = config.delay_for_attempt(attempt);
            prop_assert!(delay >= prev, "delay shrank at attempt {}", attempt);
            prop_assert!(delay <= config.max_delay, "delay above ceiling at attempt {}", attempt);
            prev = delay;
        }
    }

    /// The first retry waits the initial delay (or the ceiling if the
    /// ceiling is lower).
    #[test]
    fn backoff_first_attempt_is_initial_delay(
        initial_ms in 1u64..10_000,
        max_ms in 1u64..600_000,
    ) {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(1),
        };

        let expected = config.initial_delay.min(config.max_delay);
        prop_assert_eq!(config.delay_for_attempt(1), expected);
    }
}
