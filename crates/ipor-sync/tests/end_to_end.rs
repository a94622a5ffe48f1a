use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use ipor_core::{IpoStatus, NotificationPreferences, Subscriber, Topics};
use ipor_storage::{InMemoryStore, IpoStore};
use ipor_sync::{
    DeliveryError, DigestBuilder, EntityMergeResolver, IngestPipeline, NotificationCycle, OutgoingMessage,
    ResolveError, SyncConfig, Transport,
};
use uuid::Uuid;

#[derive(Default)]
struct RecordingTransport {
    fail_for: Option<String>,
    sent: Mutex<Vec<OutgoingMessage>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(&self, message: &OutgoingMessage) -> Result<(), DeliveryError> {
        if self.fail_for.as_deref() == message.recipients.first().map(String::as_str) {
            return Err(DeliveryError::Rejected("550 mailbox unavailable".into()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

impl RecordingTransport {
    fn sent_to(&self, recipient: &str) -> Vec<OutgoingMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.recipients.iter().any(|r| r == recipient))
            .cloned()
            .collect()
    }
}

fn run_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 9, 3, 30, 0).unwrap()
}

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn seed_workspace(root: &Path) {
    write(
        root,
        "sources.yaml",
        r#"sources:
  - source_id: chittorgarh
    display_name: Chittorgarh
    enabled: true
    status_authority: true
  - source_id: investorgain
    display_name: InvestorGain
    enabled: true
    status_authority: false
  - source_id: sptulsian
    display_name: SP Tulsian
    enabled: true
"#,
    );
    write(
        root,
        "scrapes/chittorgarh/2026-01-09T0300.json",
        r#"{
  "source_id": "chittorgarh",
  "fetched_at": "2026-01-09T03:00:00Z",
  "records": [
    {
      "name": "Bharat Coking Coal",
      "status": "open",
      "fields": {
        "price band": "₹21 to ₹23",
        "gmp(₹)": "₹4",
        "ipo date": "Jan 9, 2026 to Jan 13, 2026",
        "lot size": null
      }
    }
  ]
}"#,
    );
    write(
        root,
        "scrapes/investorgain/2026-01-09T0300.json",
        r#"{
  "source_id": "investorgain",
  "fetched_at": "2026-01-09T03:05:00Z",
  "records": [
    {
      "name": "Bharat Coking Coal Ltd",
      "status": "closed",
      "fields": {"gmp": "₹5", "subscription": "12.5x", "listing date": "N/A"}
    },
    {"name": "   ", "fields": {"gmp": "₹1"}}
  ]
}"#,
    );
}

fn subscriber(email: &str, topics: Topics) -> Subscriber {
    Subscriber {
        id: Uuid::new_v4(),
        email: Some(email.into()),
        preferences: NotificationPreferences {
            email_enabled: true,
            frequency: Some("1day".into()),
            topics,
            ..NotificationPreferences::default()
        },
    }
}

#[tokio::test]
async fn near_duplicate_ipos_are_flagged_merged_and_then_notified() {
    let dir = tempfile::tempdir().unwrap();
    seed_workspace(dir.path());
    let config = SyncConfig {
        workspace_root: dir.path().to_path_buf(),
        admin_email: Some("ops@example.com".into()),
        public_base_url: "https://radar.example.com".into(),
        ..SyncConfig::default()
    };
    let store = InMemoryStore::new();
    let transport = RecordingTransport::default();
    let pipeline = IngestPipeline::new(config).unwrap();

    let summary = pipeline.run_once(&store, &transport, run_at()).await.unwrap();
    assert_eq!(summary.upserted, 2);
    assert_eq!(summary.total_entities, 2);
    let investorgain = summary.sources.iter().find(|s| s.source_id == "investorgain").unwrap();
    assert_eq!(investorgain.rejected, 1);
    let failures = summary.source_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].source_id, "sptulsian");

    let [candidate] = summary.candidates.as_slice() else {
        panic!("expected one candidate, got {:?}", summary.candidates);
    };
    assert_eq!(candidate.score, 90);
    assert!(summary.parquet_manifest.as_ref().unwrap().exists());

    let admin = transport.sent_to("ops@example.com");
    assert_eq!(admin.len(), 1);
    assert_eq!(admin[0].subject, "IPO Radar Status: 2/3 Success + 1 Conflicts");
    assert!(admin[0]
        .html_body
        .contains(&format!("keep={}&amp;merge={}", candidate.first_id, candidate.second_id)));

    let keep = store.find_by_name("Bharat Coking Coal").await.unwrap().unwrap();
    let duplicate = store.find_by_name("Bharat Coking Coal Ltd").await.unwrap().unwrap();
    assert_eq!(keep.status, IpoStatus::Open);
    assert_eq!(duplicate.status, IpoStatus::Unknown);
    assert_eq!(keep.text("gmp"), Some("₹4"));

    let resolver = EntityMergeResolver::new();
    let outcome = resolver
        .resolve(&store, keep.id, duplicate.id, run_at())
        .await
        .unwrap();
    assert_eq!(outcome.kept.text("gmp"), Some("₹4"));
    assert_eq!(outcome.kept.text("subscription"), Some("12.5x"));
    assert!(store.find_by_name("Bharat Coking Coal Ltd").await.unwrap().is_none());
    assert!(matches!(
        resolver.resolve(&store, keep.id, duplicate.id, run_at()).await,
        Err(ResolveError::NotFound(_))
    ));
    assert!(pipeline.scan_duplicates(&store).await.unwrap().is_empty());

    let investor = subscriber("investor@example.com", Topics::default());
    let bounced = subscriber("bounced@example.com", Topics::default());
    let listings_only = subscriber(
        "listings@example.com",
        Topics {
            new_ipos: false,
            listing_date: true,
            closing_soon: false,
        },
    );
    for sub in [&investor, &bounced, &listings_only] {
        store.insert_subscriber(sub.clone()).await;
    }

    let mail = RecordingTransport {
        fail_for: Some("bounced@example.com".into()),
        ..RecordingTransport::default()
    };
    let cycle = NotificationCycle::new(DigestBuilder::new("https://radar.example.com"), 4);
    let first_at = Utc.with_ymd_and_hms(2026, 1, 9, 4, 0, 0).unwrap();

    let first = cycle.run(&store, &store, &mail, first_at).await.unwrap();
    assert_eq!(first.subscribers, 3);
    assert_eq!(first.sent, 1);
    assert_eq!(first.delivery_failures, 1);
    assert_eq!(first.no_content, 1);

    let digest = &mail.sent_to("investor@example.com")[0];
    assert_eq!(digest.subject, "IPO Radar: Update (09 Jan)");
    assert!(digest.html_body.contains("Open Now"));
    assert!(digest.html_body.contains("Bharat Coking Coal"));
    assert!(digest.html_body.contains("Bullish"));
    assert!(digest.html_body.contains("Jan 13, 2026"));
    assert!(mail.sent_to("listings@example.com").is_empty());

    let stamp = |id: Uuid| {
        let store = &store;
        async move { store.subscriber(id).await.unwrap().preferences.last_notification_sent_at }
    };
    assert_eq!(stamp(investor.id).await, Some(first_at));
    assert_eq!(stamp(bounced.id).await, None);
    assert_eq!(stamp(listings_only.id).await, None);

    let early = cycle
        .run(&store, &store, &mail, first_at + Duration::hours(23))
        .await
        .unwrap();
    assert_eq!(early.throttled, 1);
    assert_eq!(early.delivery_failures, 1);
    assert_eq!(mail.sent_to("investor@example.com").len(), 1);

    let on_time = cycle
        .run(&store, &store, &mail, first_at + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(on_time.sent, 1);
    assert_eq!(mail.sent_to("investor@example.com").len(), 2);
    assert_eq!(stamp(investor.id).await, Some(first_at + Duration::days(1)));
}

#[tokio::test]
async fn automatic_merge_keeps_the_richer_record() {
    let dir = tempfile::tempdir().unwrap();
    seed_workspace(dir.path());
    let config = SyncConfig {
        workspace_root: dir.path().to_path_buf(),
        auto_merge_threshold: Some(90),
        ..SyncConfig::default()
    };
    let store = InMemoryStore::new();
    let transport = RecordingTransport::default();

    let summary = IngestPipeline::new(config)
        .unwrap()
        .run_once(&store, &transport, run_at())
        .await
        .unwrap();
    assert_eq!(summary.auto_merged.len(), 1);
    assert!(summary.candidates.is_empty());
    assert!(transport.sent.lock().unwrap().is_empty());

    let entities = store.list().await.unwrap();
    assert_eq!(entities.len(), 1);
    // Three populated fields against two: the chittorgarh record survives.
    assert_eq!(entities[0].name, "Bharat Coking Coal");
    assert_eq!(entities[0].text("subscription"), Some("12.5x"));
}
