//! End-to-end tests over the in-memory substrate: several group members,
//! real sync rounds, publication fetching, segmentation and the max-age
//! filter.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use svs::face::MemHub;
use svs::mapping::{ExtraBlock, MappingEntry, MappingProvider};
use svs::name::{Component, Name};
use svs::packet::Data;
use svs::pubsub::{PubSubOptions, SubscriptionCallback, SubscriptionData, SvsPubSub};
use svs::security::{HmacKey, InterestSigningPolicy, SecurityOptions, Validator};
use svs::svsync::{NameScheme, SvSync};

fn setup_logging() {
    use tracing_subscriber::{prelude::*, EnvFilter};
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

const SYNC_PREFIX: &str = "/sync/chatroom";

async fn member(hub: &MemHub, node: &str, options: PubSubOptions) -> SvsPubSub {
    member_with_security(hub, node, SecurityOptions::default(), options).await
}

async fn member_with_security(
    hub: &MemHub,
    node: &str,
    security: SecurityOptions,
    options: PubSubOptions,
) -> SvsPubSub {
    SvsPubSub::new(
        Arc::new(hub.face()),
        Name::from(SYNC_PREFIX),
        Name::from(node),
        Box::new(|_| {}),
        security,
        None,
        options,
    )
    .await
    .unwrap()
}

fn collector() -> (SubscriptionCallback, Arc<Mutex<Vec<SubscriptionData>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let cb: SubscriptionCallback = Arc::new(move |data| {
        seen_clone.lock().unwrap().push(data);
    });
    (cb, seen)
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn publish_fetch_roundtrip() {
    setup_logging();
    let hub = MemHub::new();
    let p = member(&hub, "/node/p", Default::default()).await;
    let q = member(&hub, "/node/q", Default::default()).await;

    let (cb, seen) = collector();
    q.subscribe(Name::from("/chat"), cb, false);

    for i in 1..=3u8 {
        let payload = vec![i; 100];
        p.publish(
            Name::from(format!("/chat/alice/t{i}").as_str()),
            payload,
            None,
            None,
            Vec::new(),
        )
        .await
        .unwrap();
    }

    // Well within two sync periods everything arrived.
    tokio::time::sleep(Duration::from_secs(5)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    let mut payloads: Vec<Vec<u8>> = seen.iter().map(|d| d.payload.to_vec()).collect();
    payloads.sort();
    assert_eq!(payloads, vec![vec![1u8; 100], vec![2u8; 100], vec![3u8; 100]]);
    for delivery in seen.iter() {
        assert_eq!(delivery.producer, Name::from("/node/p"));
        assert!(Name::from("/chat/alice").is_prefix_of(&delivery.name));
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn large_publication_segments_and_reassembles() {
    setup_logging();
    let hub = MemHub::new();
    let p = member(&hub, "/node/p", Default::default()).await;
    let q = member(&hub, "/node/q", Default::default()).await;

    let (blob_cb, blobs) = collector();
    let (packet_cb, packets) = collector();
    q.subscribe(Name::from("/doc"), blob_cb, false);
    q.subscribe(Name::from("/doc"), packet_cb, true);

    // 20000 bytes -> segments of 8000 + 8000 + 4000.
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    p.publish(Name::from("/doc/big"), payload.clone(), None, None, Vec::new())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;

    let blobs = blobs.lock().unwrap();
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0].payload.len(), 20_000);
    assert_eq!(blobs[0].payload.to_vec(), payload);
    assert_eq!(blobs[0].name, Name::from("/doc/big"));

    let packets = packets.lock().unwrap();
    assert_eq!(packets.len(), 3);
    let mut sizes: Vec<usize> = packets.iter().map(|d| d.payload.len()).collect();
    sizes.sort();
    assert_eq!(sizes, vec![4_000, 8_000, 8_000]);
    // Every packet delivery carries the signed segment packet itself.
    for packet in packets.iter() {
        assert!(Name::from("/doc/big").is_prefix_of(packet.data.name()));
        assert_eq!(packet.name, Name::from("/doc/big"));
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn max_age_filters_stale_publications() {
    setup_logging();
    let hub = MemHub::new();

    // A bare producer: publishes data and answers mapping queries, but never
    // piggybacks, so the subscriber exercises the query protocol.
    let producer_face = Arc::new(hub.face());
    let producer = SvSync::new(
        producer_face.clone(),
        Name::from(SYNC_PREFIX),
        Name::from("/node/p"),
        Box::new(|_| {}),
        SecurityOptions::default(),
    )
    .unwrap();
    let mappings = MappingProvider::new(
        producer_face,
        Name::from(SYNC_PREFIX),
        Name::from("/node/p"),
        SecurityOptions::default(),
    )
    .unwrap();
    producer.core().start().await.unwrap();

    let options = PubSubOptions {
        max_pub_age: Some(Duration::from_secs(10)),
        ..Default::default()
    };
    let q = member(&hub, "/node/q", options).await;
    let (cb, seen) = collector();
    q.subscribe(Name::from("/chat"), cb, false);

    // Publication 1: mapping stamped 20 s in the past. Must not be fetched.
    let mut stale = Data::new(Name::from("/chat/old"), &b"stale"[..])
        .with_freshness(Duration::from_secs(3600));
    stale.set_signature(bytes::Bytes::from_static(b"sig"));
    let seq = producer.publish_packet(stale, None).await.unwrap();
    mappings.insert_mapping(
        &Name::from("/node/p"),
        seq,
        MappingEntry::with_blocks(
            Name::from("/chat/old"),
            vec![ExtraBlock::timestamp_micros(
                now_micros() - 20_000_000,
            )],
        ),
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(seen.lock().unwrap().is_empty(), "stale publication delivered");

    // Publication 2: mapping without a timestamp. Must be fetched.
    let mut fresh = Data::new(Name::from("/chat/new"), &b"fresh"[..])
        .with_freshness(Duration::from_secs(3600));
    fresh.set_signature(bytes::Bytes::from_static(b"sig"));
    let seq = producer.publish_packet(fresh, None).await.unwrap();
    mappings.insert_mapping(
        &Name::from("/node/p"),
        seq,
        MappingEntry::new(Name::from("/chat/new")),
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].name, Name::from("/chat/new"));
    assert_eq!(seen[0].payload.to_vec(), b"fresh".to_vec());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn producer_subscription_without_mappings() {
    setup_logging();
    let hub = MemHub::new();
    let a = member(&hub, "/node/a", Default::default()).await;
    let b = member(&hub, "/node/b", Default::default()).await;
    let c = member(&hub, "/node/c", Default::default()).await;

    let (cb, seen) = collector();
    // Follow every producer under /node, ignoring application names.
    c.subscribe_to_producer(Name::from("/node"), cb, false, false);

    a.publish(Name::from("/x/from-a"), &b"aa"[..], None, None, Vec::new())
        .await
        .unwrap();
    b.publish(Name::from("/y/from-b"), &b"bb"[..], None, None, Vec::new())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    let mut producers: Vec<String> = seen.iter().map(|d| d.producer.to_string()).collect();
    producers.sort();
    assert_eq!(producers, vec!["/node/a", "/node/b"]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unsubscribe_stops_delivery() {
    setup_logging();
    let hub = MemHub::new();
    let p = member(&hub, "/node/p", Default::default()).await;
    let q = member(&hub, "/node/q", Default::default()).await;

    let (cb, seen) = collector();
    let handle = q.subscribe(Name::from("/chat"), cb, false);

    p.publish(Name::from("/chat/one"), &b"1"[..], None, None, Vec::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    q.unsubscribe(handle);
    p.publish(Name::from("/chat/two"), &b"2"[..], None, None, Vec::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn prefetch_picks_up_next_publication() {
    setup_logging();
    let hub = MemHub::new();
    let p = member(&hub, "/node/p", Default::default()).await;
    let c = member(&hub, "/node/c", Default::default()).await;

    let (cb, seen) = collector();
    c.subscribe_to_producer(Name::from("/node/p"), cb, true, false);

    p.publish(Name::from("/feed/1"), &b"first"[..], None, None, Vec::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(seen.lock().unwrap().len(), 1);

    // The speculative fetch for the next sequence number is already out;
    // publishing satisfies it directly.
    p.publish(Name::from("/feed/2"), &b"second"[..], None, None, Vec::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    let mut seqs: Vec<u64> = seen.iter().map(|d| d.seq).collect();
    seqs.sort();
    assert_eq!(seqs, vec![1, 2]);
}

/// Rejects segments with a given segment number; everything else passes.
struct RejectSegment(u64);

impl Validator for RejectSegment {
    fn verify_data(&self, data: &Data) -> bool {
        data.name()
            .get_back(0)
            .and_then(Component::as_segment)
            .map_or(true, |seg| seg != self.0)
    }
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failing_segment_aborts_blob_delivery() {
    setup_logging();
    let hub = MemHub::new();
    let p = member(&hub, "/node/p", Default::default()).await;
    let security = SecurityOptions {
        encapsulated_data_validator: Some(Arc::new(RejectSegment(1))),
        ..Default::default()
    };
    let q = member_with_security(&hub, "/node/q", security, Default::default()).await;

    let (cb, seen) = collector();
    q.subscribe(Name::from("/doc"), cb, false);

    let payload: Vec<u8> = vec![7; 20_000];
    p.publish(Name::from("/doc/tainted"), payload, None, None, Vec::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(
        seen.lock().unwrap().is_empty(),
        "blob delivered despite failing segment"
    );

    // The failure is scoped to that one publication.
    p.publish(Name::from("/doc/ok"), &b"small"[..], None, None, Vec::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].name, Name::from("/doc/ok"));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn hmac_group_key_gates_participation() {
    setup_logging();
    let hub = MemHub::new();
    let keyed = |key: &[u8]| SecurityOptions {
        interest_signing: InterestSigningPolicy::Hmac(HmacKey::new(key.to_vec())),
        ..Default::default()
    };
    let p = member_with_security(&hub, "/node/p", keyed(b"group"), Default::default()).await;
    let q = member_with_security(&hub, "/node/q", keyed(b"group"), Default::default()).await;
    let outsider =
        member_with_security(&hub, "/node/x", keyed(b"other"), Default::default()).await;

    let (cb, seen) = collector();
    q.subscribe(Name::from("/chat"), cb, false);
    let (outsider_cb, outsider_seen) = collector();
    outsider.subscribe(Name::from("/chat"), outsider_cb, false);

    p.publish(Name::from("/chat/hello"), &b"hi"[..], None, None, Vec::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(outsider_seen.lock().unwrap().is_empty());
    assert_eq!(
        outsider.core().seq(Some(Name::from("/node/p"))).await.unwrap(),
        0
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn shared_prefix_group_delivers() {
    setup_logging();
    let hub = MemHub::new();
    let options = PubSubOptions {
        scheme: NameScheme::SharedPrefix,
        ..Default::default()
    };
    let p = member(&hub, "/node/p", options.clone()).await;
    let q = member(&hub, "/node/q", options).await;

    let (cb, seen) = collector();
    q.subscribe(Name::from("/chat"), cb, false);

    p.publish(Name::from("/chat/shared"), &b"payload"[..], None, None, Vec::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].payload.to_vec(), b"payload".to_vec());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn vectors_converge_across_members() {
    setup_logging();
    let hub = MemHub::new();
    let members = vec![
        member(&hub, "/node/a", Default::default()).await,
        member(&hub, "/node/b", Default::default()).await,
        member(&hub, "/node/c", Default::default()).await,
    ];

    members[0]
        .publish(Name::from("/t/a1"), &b"x"[..], None, None, Vec::new())
        .await
        .unwrap();
    members[1]
        .publish(Name::from("/t/b1"), &b"y"[..], None, None, Vec::new())
        .await
        .unwrap();
    members[1]
        .publish(Name::from("/t/b2"), &b"z"[..], None, None, Vec::new())
        .await
        .unwrap();

    // One periodic round is plenty for three peers on a lossless hub.
    tokio::time::sleep(Duration::from_secs(40)).await;

    for member in &members {
        let vector = member.core().state_vector().await.unwrap();
        assert_eq!(vector.get(&Name::from("/node/a")), 1);
        assert_eq!(vector.get(&Name::from("/node/b")), 2);
        assert_eq!(vector.len(), 2);
    }
}
