//! Property-based tests for marksync
//!
//! These tests verify invariants that must hold for all inputs:
//! - Timestamp tokens round-trip and sort like the instants they encode
//! - Decoders and parsers never panic
//! - Retention never keeps more than the quota
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

/// Fixed "now" so century resolution does not depend on the wall clock
const NOW: i64 = 1_760_000_000_000;
const FIVE_YEARS_MS: i64 = 5 * 365 * 24 * 3600 * 1000;

// ============================================================================
// TIMESTAMP CODEC TESTS
// ============================================================================

mod codec_tests {
    use super::*;
    use chrono::{FixedOffset, Utc};
    use marksync::sync::TimestampCodec;

    fn offset() -> impl Strategy<Value = FixedOffset> {
        (-12i32 * 4..=14 * 4).prop_map(|quarters| FixedOffset::east_opt(quarters * 900).unwrap())
    }

    proptest! {
        /// Invariant: decode(encode(ms)) == ms in any fixed zone
        #[test]
        fn round_trips(ms in 1_000_000_000_000i64..NOW + FIVE_YEARS_MS, tz in offset()) {
            let codec = TimestampCodec::with_timezone(tz);
            let token = codec.encode(ms);
            prop_assert_eq!(codec.decode_at(&token, NOW), Some(ms));
        }

        /// Invariant: tokens are fixed width and sort like their instants
        #[test]
        fn sortable(a in 1_000_000_000_000i64..NOW, b in 1_000_000_000_000i64..NOW) {
            let codec = TimestampCodec::with_timezone(Utc);
            let (ta, tb) = (codec.encode(a), codec.encode(b));
            prop_assert_eq!(ta.len(), 17);
            prop_assert_eq!(tb.len(), 17);
            prop_assert_eq!(a.cmp(&b), ta.cmp(&tb));
        }

        /// Invariant: all three filename generations decode to the same instant
        #[test]
        fn filename_generations_agree(
            ms in 1_000_000_000_000i64..NOW,
            client in "[A-Za-z0-9-]{1,16}",
            prefix in prop::sample::select(vec!["snapshot_schedule", "snapshot_user", "snapshot_handle", "sync_backup"]),
        ) {
            let codec = TimestampCodec::with_timezone(Utc);
            let token = codec.encode(ms);
            let legacy = format!("{}_{}.json", prefix, ms);
            let intermediate = format!("{}_{}.json", prefix, token);
            let current = format!("{}_{}_{}.json", client, prefix, token);

            prop_assert_eq!(codec.decode_filename_at(&legacy, NOW), Some(ms));
            prop_assert_eq!(codec.decode_filename_at(&intermediate, NOW), Some(ms));
            prop_assert_eq!(codec.decode_filename_at(&current, NOW), Some(ms));
        }

        /// Invariant: decoding never panics on arbitrary input
        #[test]
        fn decode_never_panics(s in "\\PC*") {
            let codec = TimestampCodec::with_timezone(Utc);
            let _ = codec.decode_at(&s, NOW);
            let _ = codec.decode_filename_at(&s, NOW);
        }

        /// Invariant: any structured-looking token either decodes or is rejected,
        /// never lands outside the century window
        #[test]
        fn structured_tokens_stay_in_window(token in "[0-9]{6}_[0-9]{6}_[0-9]{3}") {
            let codec = TimestampCodec::with_timezone(Utc);
            if let Some(ms) = codec.decode_at(&token, NOW) {
                prop_assert!(ms >= 946_684_800_000 - 100 * 366 * 24 * 3600 * 1000);
                prop_assert!(ms <= NOW + 11 * 366 * 24 * 3600 * 1000);
            }
        }
    }
}

// ============================================================================
// MULTISTATUS PARSING TESTS
// ============================================================================

mod multistatus_tests {
    use super::*;
    use marksync::sync::webdav::multistatus::{snapshot_files, MultistatusEntry};
    use marksync::sync::webdav::{MultistatusExtractor, RegexExtractor};

    proptest! {
        /// Invariant: the extractor never panics on any body
        #[test]
        fn extractor_never_panics(body in "\\PC*") {
            let _ = RegexExtractor.extract(&body);
        }

        /// Invariant: listings only ever contain snapshot files, newest first
        #[test]
        fn listing_only_snapshots(
            names in prop::collection::vec("[a-z_]{1,12}\\.(json|txt|tmp)", 0..20),
            mtimes in prop::collection::vec(0i64..2_000_000_000, 20),
        ) {
            let mut entries = vec![MultistatusEntry {
                href: "/dav/".into(),
                ..Default::default()
            }];
            for (name, secs) in names.iter().zip(mtimes.iter()) {
                let lastmod = chrono::DateTime::from_timestamp(*secs, 0).unwrap().to_rfc2822();
                entries.push(MultistatusEntry {
                    href: format!("/dav/{}", name),
                    last_modified: Some(lastmod),
                    ..Default::default()
                });
            }

            let files = snapshot_files(entries);
            prop_assert!(files.iter().all(|f| f.name.ends_with(".json")));
            prop_assert_eq!(files.len(), names.iter().filter(|n| n.ends_with(".json")).count());
            prop_assert!(files.windows(2).all(|w| w[0].lastmod_ms() >= w[1].lastmod_ms()));
        }
    }
}

// ============================================================================
// RETENTION TESTS
// ============================================================================

mod retention_tests {
    use super::*;
    use std::sync::Arc;

    use marksync::clock::ManualClock;
    use marksync::events::EventBus;
    use marksync::storage::MemoryStore;
    use marksync::sync::{BackupOrchestrator, MemoryConnector, MemoryTransport};
    use marksync::types::{BackupReason, BookmarkNode, LocalDataset, Settings};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Invariant: after N backups with quota k, exactly min(N, k) of this
        /// client's snapshots remain and foreign files are untouched
        #[test]
        fn quota_is_respected(backups in 1usize..12, quota in 1usize..6, foreign in 0usize..4) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let mut settings = Settings::default();
                settings.webdav.url = "https://dav.example.com/".into();
                settings.backup.max_snapshots = quota;
                settings.client.identifier = "cid".into();
                let dataset = LocalDataset {
                    bookmarks: vec![BookmarkNode { id: "1".into(), ..Default::default() }],
                    last_modified: 1_700_000_000_000,
                    ..Default::default()
                };

                let store = Arc::new(MemoryStore::with(&dataset, settings).unwrap());
                let remote = Arc::new(MemoryTransport::new());
                for i in 0..foreign {
                    remote.insert_raw(format!("other_snapshot_user_{}.json", 1_600_000_000_000i64 + i as i64), b"{}".to_vec());
                }
                let orchestrator = BackupOrchestrator::new(
                    store.clone(),
                    store.clone(),
                    Arc::new(MemoryConnector::new(remote.clone())),
                    EventBus::new(),
                    Arc::new(ManualClock::new(NOW)),
                );

                for i in 0..backups {
                    store.mutate(|d| d.bookmarks[0].title = i.to_string(), 1_700_000_000_000 + i as i64 * 1000).unwrap();
                    orchestrator.backup(BackupReason::User).await.unwrap();
                }

                let names = remote.names();
                let own = names.iter().filter(|n| n.starts_with("cid_")).count();
                prop_assert_eq!(own, backups.min(quota));
                prop_assert_eq!(names.len() - own, foreign);
                Ok(())
            })?;
        }
    }
}
