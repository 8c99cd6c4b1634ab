// SPDX-License-Identifier: Apache-2.0

//! End-to-end consolidation scenarios: fetch, constraints, diffing, event
//! emission, cache persistence and commit queries.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use syncflow_config::{ServerConfig, SourceName, StorageConfig};
use syncflow_expr::Engine;
use syncflow_model::EventKind;
use syncflow_server::testing::{InMemorySource, InMemoryTransport};
use syncflow_server::{Datamodel, EventProducer, SourceAdapter};
use syncflow_state::SnapshotStore;

const CONFIG: &str = r#"
datamodel:
  Users:
    primarykeyattr: user_id
    toString: "{{ login }}"
    sources:
      main:
        attrsmapping:
          user_id: ID
          login: LOGIN
          login_uppercase: "{{ LOGIN | upper }}"
          last_sync: SYNC_TS
        cacheonly_attrs: [last_sync]
        fetch:
          type: fetch
          query: users
        commit_one:
          type: modify
          query: ack_user
          vars:
            id: "{{ ITEM_FETCHED_VALUES.user_id }}"
  Groups:
    primarykeyattr: group_id
    sources:
      main:
        attrsmapping:
          group_id: GID
          name: NAME
        fetch:
          type: fetch
          query: groups
  GroupsMembers:
    primarykeyattr: [group_id, user_id]
    integrity_constraints:
      - "{{ _SELF.user_id in Users_pkeys }}"
      - "{{ _SELF.group_id in Groups_pkeys }}"
    sources:
      main:
        attrsmapping:
          group_id: GID
          user_id: UID
        fetch:
          type: fetch
          query: members
"#;

struct Fixture {
    source: Arc<InMemorySource>,
    transport: Arc<InMemoryTransport>,
    datamodel: Datamodel,
    producer: EventProducer,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    fixture_in(dir)
}

fn fixture_in(dir: tempfile::TempDir) -> Fixture {
    let config = ServerConfig::from_yaml(CONFIG).expect("config");
    let source = Arc::new(InMemorySource::new());
    let mut adapters: HashMap<SourceName, Arc<dyn SourceAdapter>> = HashMap::new();
    let _ = adapters.insert("main".to_string(), source.clone());

    let mut datamodel = Datamodel::new(&config, &adapters, Engine::new()).expect("datamodel");
    let transport = Arc::new(InMemoryTransport::new());
    let store = SnapshotStore::open(&StorageConfig {
        dirpath: dir.path().to_path_buf(),
        backup_count: 1,
        enable_compression: false,
    })
    .expect("store");
    let producer =
        EventProducer::new(transport.clone(), store).expect("producer");
    producer
        .load_cache_into(&mut datamodel)
        .expect("cache load");

    Fixture {
        source,
        transport,
        datamodel,
        producer,
        _dir: dir,
    }
}

fn user_row(id: u64, login: &str) -> Value {
    json!({"ID": id, "LOGIN": login, "SYNC_TS": 1000})
}

fn seed_initial(source: &InMemorySource) {
    source.set_rows(
        "users",
        (1..=5).map(|i| user_row(i, &format!("user{i}"))).collect(),
    );
    source.set_rows(
        "groups",
        vec![json!({"GID": 1, "NAME": "eng"}), json!({"GID": 2, "NAME": "ops"})],
    );
    // Members reference users 1..=7: two of them do not exist yet.
    source.set_rows(
        "members",
        (1..=7).map(|i| json!({"GID": 1 + (i % 2), "UID": i})).collect(),
    );
}

#[tokio::test]
async fn first_pass_emits_in_schema_order_and_filters_integrity() {
    let mut fx = fixture();
    seed_initial(&fx.source);

    let summary = fx
        .producer
        .run_pass(&mut fx.datamodel)
        .await
        .expect("pass");

    assert_eq!(summary.per_type["Users"].added, 5);
    assert_eq!(summary.per_type["Groups"].added, 2);
    // Members referencing the two missing users are integrity-filtered.
    assert_eq!(summary.per_type["GroupsMembers"].added, 5);
    assert_eq!(
        fx.datamodel.data["GroupsMembers"].integrity_filtered.len(),
        2
    );

    let events = fx.transport.published();
    assert_eq!(events.len(), 12);

    // Event numbers are dense and monotonic; types follow schema order.
    let numbers: Vec<u64> = events.iter().map(|e| e.ev_number).collect();
    assert_eq!(numbers, (1..=12).collect::<Vec<_>>());
    let types: Vec<&str> = events.iter().map(|e| e.objtype.as_str()).collect();
    assert_eq!(&types[..5], &["Users"; 5]);
    assert_eq!(&types[5..7], &["Groups"; 2]);
    assert_eq!(&types[7..], &["GroupsMembers"; 5]);

    // The mapping expression was evaluated per row.
    let first = &events[0];
    let attrs = first.attrs.to_attr_map();
    assert_eq!(attrs["login_uppercase"], json!("USER1"));
    // Cache-only attributes never travel.
    assert!(!attrs.contains_key("last_sync"));
    // They are kept in the cache, though.
    assert!(
        fx.datamodel.cache["Users"]
            .iter()
            .all(|o| o.contains("last_sync"))
    );

    // commit_one ran for every acknowledged user, with rendered vars.
    let acks: Vec<_> = fx
        .source
        .recorded()
        .into_iter()
        .filter(|q| q.query == "ack_user")
        .collect();
    assert_eq!(acks.len(), 5);
    assert_eq!(acks[0].querytype, "modify");
    assert_eq!(acks[0].vars, json!({"id": 1}));

    // The adapter was closed exactly as often as it was opened.
    assert_eq!(fx.source.opens(), fx.source.closes());
}

#[tokio::test]
async fn quiet_pass_emits_nothing() {
    let mut fx = fixture();
    seed_initial(&fx.source);
    let _ = fx.producer.run_pass(&mut fx.datamodel).await.expect("pass");
    let before = fx.transport.published().len();

    let summary = fx
        .producer
        .run_pass(&mut fx.datamodel)
        .await
        .expect("second pass");
    assert_eq!(summary.events, 0);
    assert_eq!(fx.transport.published().len(), before);
}

#[tokio::test]
async fn inserting_missing_users_unfilters_members() {
    let mut fx = fixture();
    seed_initial(&fx.source);
    let _ = fx.producer.run_pass(&mut fx.datamodel).await.expect("pass");

    // Insert the two users the members referenced.
    fx.source.set_rows(
        "users",
        (1..=7).map(|i| user_row(i, &format!("user{i}"))).collect(),
    );
    let summary = fx
        .producer
        .run_pass(&mut fx.datamodel)
        .await
        .expect("pass");

    assert_eq!(summary.per_type["Users"].added, 2);
    assert_eq!(summary.per_type["GroupsMembers"].added, 2);
    assert!(fx.datamodel.data["GroupsMembers"].integrity_filtered.is_empty());
}

#[tokio::test]
async fn removals_emit_full_final_record() {
    let mut fx = fixture();
    seed_initial(&fx.source);
    let _ = fx.producer.run_pass(&mut fx.datamodel).await.expect("pass");

    fx.source.set_rows(
        "users",
        (2..=5).map(|i| user_row(i, &format!("user{i}"))).collect(),
    );
    let summary = fx
        .producer
        .run_pass(&mut fx.datamodel)
        .await
        .expect("pass");

    assert_eq!(summary.per_type["Users"].removed, 1);
    // The membership referencing user 1 is gone too.
    assert_eq!(summary.per_type["GroupsMembers"].removed, 1);

    let events = fx.transport.published();
    let removal = events
        .iter()
        .find(|e| e.kind == EventKind::Removed && e.objtype == "Users")
        .expect("user removal");
    assert_eq!(removal.attrs.to_attr_map()["login"], json!("user1"));
}

#[tokio::test]
async fn modified_events_carry_attr_level_diffs() {
    let mut fx = fixture();
    seed_initial(&fx.source);
    let _ = fx.producer.run_pass(&mut fx.datamodel).await.expect("pass");

    let mut rows: Vec<Value> = (1..=5).map(|i| user_row(i, &format!("user{i}"))).collect();
    rows[0] = json!({"ID": 1, "LOGIN": "renamed", "SYNC_TS": 1000});
    fx.source.set_rows("users", rows);

    let summary = fx
        .producer
        .run_pass(&mut fx.datamodel)
        .await
        .expect("pass");
    assert_eq!(summary.per_type["Users"].modified, 1);

    let events = fx.transport.published();
    let modified = events
        .iter()
        .find(|e| e.kind == EventKind::Modified)
        .expect("modified event");
    let diff = modified.attrs.as_diff().expect("diff payload");
    assert_eq!(diff.modified["login"], json!("renamed"));
    assert_eq!(diff.modified["login_uppercase"], json!("RENAMED"));
    assert!(diff.added.is_empty());
    assert!(diff.removed.is_empty());
}

#[tokio::test]
async fn cacheonly_changes_update_cache_without_events() {
    let mut fx = fixture();
    seed_initial(&fx.source);
    let _ = fx.producer.run_pass(&mut fx.datamodel).await.expect("pass");

    let rows: Vec<Value> = (1..=5)
        .map(|i| json!({"ID": i, "LOGIN": format!("user{i}"), "SYNC_TS": 2000}))
        .collect();
    fx.source.set_rows("users", rows);

    let summary = fx
        .producer
        .run_pass(&mut fx.datamodel)
        .await
        .expect("pass");
    assert_eq!(summary.events, 0);
    assert!(
        fx.datamodel.cache["Users"]
            .iter()
            .all(|o| o.get("last_sync") == Some(&json!(2000)))
    );
}

#[tokio::test]
async fn transport_failure_keeps_cache_and_replays() {
    let mut fx = fixture();
    seed_initial(&fx.source);

    fx.transport.set_failing(true);
    let err = fx.producer.run_pass(&mut fx.datamodel).await.unwrap_err();
    assert!(
        matches!(err, syncflow_server::Error::TransportFailure { .. }),
        "{err:?}"
    );
    assert!(fx.datamodel.cache["Users"].is_empty());

    // Next tick retries and emits everything.
    fx.transport.set_failing(false);
    let summary = fx
        .producer
        .run_pass(&mut fx.datamodel)
        .await
        .expect("retry pass");
    assert_eq!(summary.per_type["Users"].added, 5);
}

#[tokio::test]
async fn source_failure_aborts_pass_without_partial_state() {
    let mut fx = fixture();
    seed_initial(&fx.source);
    fx.source.set_failing(true);

    let err = fx.producer.run_pass(&mut fx.datamodel).await.unwrap_err();
    assert!(
        matches!(err, syncflow_server::Error::SourceFailure { .. }),
        "{err:?}"
    );
    assert!(fx.transport.published().is_empty());
    assert!(fx.datamodel.cache["Users"].is_empty());
    assert_eq!(fx.source.opens(), fx.source.closes());
}

#[tokio::test]
async fn event_numbers_resume_across_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().to_path_buf();

    let mut fx = fixture_in(dir);
    seed_initial(&fx.source);
    let _ = fx.producer.run_pass(&mut fx.datamodel).await.expect("pass");
    let last = fx.producer.last_ev_number();
    assert_eq!(last, 12);

    // A fresh producer over the same store resumes the counter and the
    // cache: an unchanged world emits nothing.
    let config = ServerConfig::from_yaml(CONFIG).expect("config");
    let mut adapters: HashMap<SourceName, Arc<dyn SourceAdapter>> = HashMap::new();
    let _ = adapters.insert("main".to_string(), fx.source.clone());
    let mut dm = Datamodel::new(&config, &adapters, Engine::new()).expect("datamodel");
    let store = SnapshotStore::open(&StorageConfig {
        dirpath: path,
        backup_count: 1,
        enable_compression: false,
    })
    .expect("store");
    let mut producer = EventProducer::new(fx.transport.clone(), store).expect("producer");
    producer.load_cache_into(&mut dm).expect("cache load");

    assert_eq!(producer.last_ev_number(), last);
    let summary = producer.run_pass(&mut dm).await.expect("pass");
    assert_eq!(summary.events, 0);
}

#[tokio::test]
async fn initial_sync_replays_the_full_view() {
    let mut fx = fixture();
    seed_initial(&fx.source);
    let _ = fx.producer.run_pass(&mut fx.datamodel).await.expect("pass");
    let before = fx.transport.published().len();

    fx.producer.request_initial_sync();
    let summary = fx
        .producer
        .run_pass(&mut fx.datamodel)
        .await
        .expect("initial sync pass");

    // The full view is re-emitted as synthetic added events.
    assert_eq!(summary.per_type["Users"].added, 5);
    assert_eq!(summary.per_type["Groups"].added, 2);
    assert_eq!(summary.per_type["GroupsMembers"].added, 5);
    let events = fx.transport.published();
    assert!(events[before..].iter().all(|e| e.kind == EventKind::Added));

    // And diffing resumes afterwards.
    let summary = fx
        .producer
        .run_pass(&mut fx.datamodel)
        .await
        .expect("quiet pass");
    assert_eq!(summary.events, 0);
}
