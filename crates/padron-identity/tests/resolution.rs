use std::sync::Arc;

use padron_core::{AssociationStatus, MaterializedIdentity, RegistryRowDraft};
use padron_identity::{derived_credential, AssociationResolver, IdentityError, Materializer, TagAdmin};
use padron_storage::{MemoryStore, RegistryStore, UpsertBatch};

const OWNER: i64 = 7;
const OTHER_OWNER: i64 = 8;

fn member(n: i64) -> RegistryRowDraft {
    RegistryRowDraft {
        primary_key: Some(format!("{}", 30_000_000 + n)),
        secondary_key: None,
        display_name: format!("SOCIO {n}, NOMBRE"),
        external_barcode: None,
        balance: None,
        risk_flag: None,
        last_unpaid_period: None,
        full_access_granted: n % 2 == 0,
        controls_enabled: 1,
        controls_enabled_raw: Some("1".to_string()),
        raw_source: "{}".to_string(),
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    materializer: Materializer,
    resolver: AssociationResolver,
    tags: TagAdmin,
}

/// A member whose document is a placeholder, so only synthetic keys apply.
fn undocumented(primary: &str, barcode: Option<&str>) -> RegistryRowDraft {
    RegistryRowDraft {
        primary_key: Some(primary.to_string()),
        external_barcode: barcode.map(str::to_string),
        ..member(0)
    }
}

/// Registry rows 1..=`rows`, none materialized.
async fn harness(rows: i64) -> Harness {
    harness_with((1..=rows).map(member).collect()).await
}

async fn harness_with(drafts: Vec<RegistryRowDraft>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_registry_rows(&UpsertBatch {
            secondary: vec![],
            primary: drafts,
        })
        .await
        .unwrap();
    let materializer = Materializer::new(store.clone(), store.clone());
    Harness {
        resolver: AssociationResolver::new(store.clone(), materializer.clone()),
        tags: TagAdmin::new(store.clone()),
        materializer,
        store,
    }
}

#[tokio::test]
async fn resolving_tagged_row_creates_identity_and_association() {
    let h = harness(42).await;
    h.tags.tag(OWNER, 42, None).await.unwrap();

    let association = h.resolver.resolve(42, OWNER).await.unwrap();

    assert_eq!(h.store.identity_count().await, 1);
    assert_eq!(h.store.association_count().await, 1);
    assert_eq!(association.owner_id, OWNER);
    assert_eq!(association.status, AssociationStatus::Active);
    let identity = &h.store.identities().await[0];
    assert_eq!(association.subject_id, identity.id);
    assert_eq!(identity.natural_key, "30000042");
    assert_eq!(identity.profile.registry_row_id, 42);
}

#[tokio::test]
async fn association_id_resolves_to_itself() {
    let h = harness(42).await;
    h.tags.tag(OWNER, 42, None).await.unwrap();
    let created = h.resolver.resolve(42, OWNER).await.unwrap();

    let again = h.resolver.resolve(created.id, OWNER).await.unwrap();
    assert_eq!(again, created);
    assert_eq!(h.store.association_count().await, 1);
}

#[tokio::test]
async fn ended_association_is_reactivated_in_place() {
    let h = harness(42).await;
    h.tags.tag(OWNER, 42, None).await.unwrap();
    let created = h.resolver.resolve(42, OWNER).await.unwrap();

    let ended = h.resolver.end(created.id, OWNER).await.unwrap();
    assert_eq!(ended.status, AssociationStatus::Ended);
    assert!(ended.ended_at.is_some());

    let reactivated = h.resolver.resolve(42, OWNER).await.unwrap();
    assert_eq!(reactivated.id, created.id);
    assert_eq!(reactivated.status, AssociationStatus::Active);
    assert_eq!(reactivated.ended_at, None);
    assert_eq!(h.store.association_count().await, 1);
    assert_eq!(h.store.identity_count().await, 1);
}

#[tokio::test]
async fn foreign_association_is_reported_as_not_found() {
    let h = harness(42).await;
    h.tags.tag(OWNER, 42, None).await.unwrap();
    let created = h.resolver.resolve(42, OWNER).await.unwrap();

    let err = h.resolver.resolve(created.id, OTHER_OWNER).await.unwrap_err();
    assert!(matches!(err, IdentityError::Ownership));
    assert_eq!(err.http_status(), 404);
    assert_eq!(err.public_message(), "not found");

    let err = h.resolver.end(created.id, OTHER_OWNER).await.unwrap_err();
    assert!(matches!(err, IdentityError::Ownership));
}

#[tokio::test]
async fn untagged_row_is_forbidden_and_nothing_is_created() {
    let h = harness(42).await;
    h.tags.tag(OTHER_OWNER, 41, None).await.unwrap();

    let err = h.resolver.resolve(41, OWNER).await.unwrap_err();
    assert!(matches!(err, IdentityError::Forbidden));
    assert_eq!(h.store.identity_count().await, 0);
    assert_eq!(h.store.association_count().await, 0);
}

#[tokio::test]
async fn unknown_id_is_not_found() {
    let h = harness(3).await;
    assert!(matches!(
        h.resolver.resolve(999, OWNER).await,
        Err(IdentityError::NotFound(_))
    ));
    assert!(matches!(
        h.resolver.end(999, OWNER).await,
        Err(IdentityError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_materializations_create_one_identity() {
    let h = harness(5).await;

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let materializer = h.materializer.clone();
            tokio::spawn(async move { materializer.materialize(3).await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let identities = h.store.identities().await;
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].natural_key, "30000003");
    assert_eq!(identities[0].credential_digest, derived_credential("30000003"));
}

async fn materialize_concurrently(h: &Harness, row_id: i64, calls: usize) -> Vec<MaterializedIdentity> {
    let handles: Vec<_> = (0..calls)
        .map(|_| {
            let materializer = h.materializer.clone();
            tokio::spawn(async move { materializer.materialize(row_id).await })
        })
        .collect();
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }
    results
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_materializations_by_barcode_create_one_identity() {
    let h = harness_with(vec![undocumented("00000000", Some("777"))]).await;

    let results = materialize_concurrently(&h, 1, 12).await;
    let first = &results[0];
    assert!(results.iter().all(|identity| identity.id == first.id));
    assert!(results.iter().all(|identity| identity.credential_digest == first.credential_digest));

    let identities = h.store.identities().await;
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].synthetic_key.as_deref(), Some("bc-777"));
    assert_eq!(identities[0].credential_digest, first.credential_digest);

    let later = h.materializer.materialize(1).await.unwrap();
    assert_eq!(later.credential_digest, first.credential_digest);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_materializations_by_row_create_one_identity() {
    let h = harness_with(vec![undocumented("99999999", None)]).await;

    let results = materialize_concurrently(&h, 1, 12).await;
    let first = &results[0];
    assert!(results.iter().all(|identity| identity.id == first.id));
    assert!(results.iter().all(|identity| identity.credential_digest == first.credential_digest));

    let identities = h.store.identities().await;
    assert_eq!(identities.len(), 1);
    assert_eq!(identities[0].synthetic_key.as_deref(), Some("row-1"));

    let later = h.materializer.materialize(1).await.unwrap();
    assert_eq!(later.id, first.id);
    assert_eq!(later.credential_digest, first.credential_digest);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_resolutions_share_one_association() {
    let h = harness(42).await;
    h.tags.tag(OWNER, 42, None).await.unwrap();

    let handles: Vec<_> = (0..12)
        .map(|_| {
            let resolver = h.resolver.clone();
            tokio::spawn(async move { resolver.resolve(42, OWNER).await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap().id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(h.store.identity_count().await, 1);
    assert_eq!(h.store.association_count().await, 1);
}

#[tokio::test]
async fn replacing_tags_controls_visibility() {
    let h = harness(10).await;
    h.tags.replace_tags(OWNER, &[1, 2, 3], Some(99)).await.unwrap();

    let diff = h.tags.replace_tags(OWNER, &[3, 4], Some(99)).await.unwrap();
    assert_eq!(diff.added, vec![4]);
    assert_eq!(diff.removed, vec![1, 2]);
    assert_eq!(h.tags.list_tagged(OWNER).await.unwrap(), vec![3, 4]);

    assert!(matches!(h.resolver.resolve(2, OWNER).await, Err(IdentityError::Forbidden)));
    assert!(h.resolver.resolve(4, OWNER).await.is_ok());

    assert!(matches!(
        h.tags.replace_tags(OWNER, &[4, 500], None).await,
        Err(IdentityError::NotFound(_))
    ));
    assert_eq!(h.tags.list_tagged(OWNER).await.unwrap(), vec![3, 4]);
    assert!(h.tags.untag(OWNER, 3).await.unwrap());
    assert!(!h.tags.untag(OWNER, 3).await.unwrap());
}
