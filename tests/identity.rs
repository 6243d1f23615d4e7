mod common;

use common::{Harness, START};
use greenhouse_ingest::merge::SetMode;
use greenhouse_ingest::storage::{Query, Storage, Table};
use greenhouse_ingest::value::ValueTuple;
use serde_json::{Map, Value, json};

fn props(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn text(value: &str) -> ValueTuple {
    ValueTuple::Str(value.to_string())
}

#[tokio::test]
async fn get_or_create_reuses_known_aliases() {
    let h = Harness::new();
    let ids = &h.services.identities;
    let first = ids.get_or_create("alice").await.unwrap();
    let again = ids.get_or_create("alice").await.unwrap();

    assert_eq!(first.id, again.id);
    assert_eq!(first.created_at, START);
    assert_eq!(first.alias_id, again.alias_id);
    assert_eq!(first.storage_key(), again.storage_key());
    assert_eq!(h.store.inserted_rows(Table::User), 1);

    let by_id = ids.resolve(&first.id.to_string()).await.unwrap().unwrap();
    assert_eq!(by_id.id, first.id);
    assert_eq!(by_id.storage_key(), first.storage_key());
}

#[tokio::test]
async fn equal_creation_times_keep_the_smaller_id() {
    for swap in [false, true] {
        let h = Harness::new();
        let ids = &h.services.identities;
        let a = ids.get_or_create("device-1").await.unwrap();
        let b = ids.get_or_create("device-2").await.unwrap();
        assert_eq!(a.created_at, b.created_at);
        let expected = a.id.min(b.id);

        let (first, second) = if swap {
            ("device-2", "device-1")
        } else {
            ("device-1", "device-2")
        };
        let survivor = ids.merge(first, second).await.unwrap();
        assert_eq!(survivor.id, expected, "merge({first}, {second})");
        for reference in ["device-1", "device-2"] {
            let resolved = ids.resolve(reference).await.unwrap().unwrap();
            assert_eq!(resolved.id, expected);
        }
    }
}

#[tokio::test]
async fn merging_an_identity_with_itself_is_a_no_op() {
    let h = Harness::new();
    let ids = &h.services.identities;
    let alice = ids.get_or_create("alice").await.unwrap();
    ids.create_alias(alice.id, "alice@example.com").await.unwrap();
    h.store.reset_counts();

    let merged = ids.merge("alice", "alice@example.com").await.unwrap();
    assert_eq!(merged.id, alice.id);
    assert!(h.store.inserts.lock().is_empty());
}

#[tokio::test]
async fn merge_keeps_the_older_identity_and_repoints_aliases() {
    let h = Harness::new();
    let ids = &h.services.identities;
    let older = ids.get_or_create("device-1").await.unwrap();
    h.tick(1_000);
    let newer = ids.get_or_create("alice").await.unwrap();
    ids.create_alias(newer.id, "alice@example.com").await.unwrap();

    let survivor = ids.merge("alice", "device-1").await.unwrap();
    assert_eq!(survivor.id, older.id);

    for reference in ["alice", "alice@example.com", "device-1"] {
        let resolved = ids.resolve(reference).await.unwrap().unwrap();
        assert_eq!(resolved.id, older.id, "{reference} should resolve to survivor");
    }
    assert!(ids.resolve(&newer.id.to_string()).await.unwrap().is_none());

    let remaining = h
        .store
        .query(&Query::AliasesOfIdentity(newer.id.to_string()))
        .await
        .unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn merge_of_unknown_reference_fails() {
    let h = Harness::new();
    h.services.identities.get_or_create("alice").await.unwrap();
    let err = h.services.identities.merge("alice", "nobody").await.unwrap_err();
    assert!(err.to_string().contains("nobody"));
}

#[tokio::test]
async fn merge_resolves_each_property_by_mode_and_time() {
    let h = Harness::new();
    let ids = &h.services.identities;

    ids.get_or_create("device-1").await.unwrap();
    ids.set_properties("device-1", &props(json!({"plan": "free", "theme": "dark"})), SetMode::Once)
        .await
        .unwrap();
    ids.set_properties("device-1", &props(json!({"tier": "a"})), SetMode::Normal)
        .await
        .unwrap();

    h.tick(1_000);
    ids.get_or_create("alice").await.unwrap();
    ids.set_properties("alice", &props(json!({"plan": "pro", "tier": "b"})), SetMode::Once)
        .await
        .unwrap();
    ids.set_properties("alice", &props(json!({"theme": "light"})), SetMode::Normal)
        .await
        .unwrap();

    h.tick(1_000);
    let survivor = ids.merge("device-1", "alice").await.unwrap();

    // both once: older wins
    assert_eq!(survivor.value("p_plan"), Some(&text("free")));
    // at least one normal: newer wins
    assert_eq!(survivor.value("p_tier"), Some(&text("b")));
    assert_eq!(survivor.value("p_theme"), Some(&text("light")));

    let stored = ids.resolve("alice").await.unwrap().unwrap();
    assert_eq!(stored.value("p_plan"), Some(&text("free")));
    assert_eq!(stored.value("p_theme"), Some(&text("light")));

    let times = h
        .store
        .query(&Query::PropertyTimes(vec![survivor.id.to_string()]))
        .await
        .unwrap();
    let theme = times
        .iter()
        .find(|row| row["property"] == json!("p_theme"))
        .unwrap();
    assert_eq!(theme["mode"], json!("normal"));
    assert_eq!(theme["timestamp"], json!(START + 1_000));
    let plan = times
        .iter()
        .find(|row| row["property"] == json!("p_plan"))
        .unwrap();
    assert_eq!(plan["mode"], json!("once"));
    assert_eq!(plan["timestamp"], json!(START));
}

#[tokio::test]
async fn merge_fills_attributes_missing_on_the_survivor() {
    let h = Harness::new();
    let ids = &h.services.identities;
    ids.set_properties("device-1", &props(json!({"name": "Ada"})), SetMode::Normal)
        .await
        .unwrap();
    h.tick(1_000);
    ids.set_properties("alice", &props(json!({"email": "ada@example.com"})), SetMode::Normal)
        .await
        .unwrap();

    let survivor = ids.merge("alice", "device-1").await.unwrap();
    assert_eq!(survivor.value("name"), Some(&text("Ada")));
    assert_eq!(survivor.value("email"), Some(&text("ada@example.com")));
}

#[tokio::test]
async fn alias_to_someone_else_triggers_merge() {
    let h = Harness::new();
    let ids = &h.services.identities;
    let anonymous = ids.get_or_create("device-1").await.unwrap();
    h.tick(1_000);
    ids.get_or_create("alice").await.unwrap();

    let owner = ids.alias("alice", "device-1").await.unwrap();
    assert_eq!(owner.id, anonymous.id);
    let alice = ids.resolve("alice").await.unwrap().unwrap();
    assert_eq!(alice.id, anonymous.id);
}

#[tokio::test]
async fn alias_of_a_fresh_name_does_not_merge() {
    let h = Harness::new();
    let ids = &h.services.identities;
    let alice = ids.get_or_create("alice").await.unwrap();
    h.store.reset_counts();

    let owner = ids.alias("alice", "alice@example.com").await.unwrap();
    assert_eq!(owner.id, alice.id);
    assert_eq!(h.store.inserted_rows(Table::User), 0);
    assert_eq!(h.store.inserted_rows(Table::UserAlias), 1);

    let record = ids.find_alias("alice@example.com").await.unwrap().unwrap();
    assert_eq!(record.identity_id, alice.id);
}

#[tokio::test]
async fn set_once_keeps_the_first_value() {
    let h = Harness::new();
    let ids = &h.services.identities;
    ids.set_properties("alice", &props(json!({"plan": "free"})), SetMode::Once)
        .await
        .unwrap();
    h.tick(1);
    let after_once = ids
        .set_properties("alice", &props(json!({"plan": "pro"})), SetMode::Once)
        .await
        .unwrap();
    assert_eq!(after_once.value("p_plan"), Some(&text("free")));

    h.tick(1);
    let after_normal = ids
        .set_properties("alice", &props(json!({"plan": "pro"})), SetMode::Normal)
        .await
        .unwrap();
    assert_eq!(after_normal.value("p_plan"), Some(&text("pro")));
}

#[tokio::test]
async fn built_in_with_wrong_type_is_not_written() {
    let h = Harness::new();
    let identity = h
        .services
        .identities
        .set_properties("alice", &props(json!({"name": 7, "Email": "a@b.c"})), SetMode::Normal)
        .await
        .unwrap();
    assert_eq!(identity.value("name"), None);
    assert_eq!(identity.value("email"), Some(&text("a@b.c")));
}

#[tokio::test]
async fn increment_adds_one_to_the_stored_number() {
    let h = Harness::new();
    let ids = &h.services.identities;
    ids.set_properties("alice", &props(json!({"visits": 3})), SetMode::Normal)
        .await
        .unwrap();
    h.tick(1);
    assert_eq!(ids.increment_property("alice", "visits").await.unwrap(), Some(4.0));

    let stored = ids.resolve("alice").await.unwrap().unwrap();
    assert_eq!(stored.value("p_visits"), Some(&ValueTuple::Num(4.0)));
}

#[tokio::test]
async fn increment_starts_from_zero_and_ignores_built_ins() {
    let h = Harness::new();
    let ids = &h.services.identities;
    assert_eq!(ids.increment_property("bob", "logins").await.unwrap(), Some(1.0));
    assert_eq!(ids.increment_property("bob", "email").await.unwrap(), None);
}
