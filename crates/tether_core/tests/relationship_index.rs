use serde_json::json;
use tether_core::{
    Attributes, CoreError, Entity, EntityKind, EntityStore, ErrorKind, LifecyclePolicy,
    RelationshipIndex, RelationshipStatus, Role, Store,
};
use uuid::Uuid;

fn kind(value: &str) -> EntityKind {
    EntityKind::new(value).unwrap()
}

fn attrs(value: serde_json::Value) -> Attributes {
    serde_json::from_value(value).unwrap()
}

fn create(store: &Store, policy: &LifecyclePolicy, entity_kind: &str) -> Entity {
    EntityStore::new(store.entities(), policy)
        .create(kind(entity_kind), Attributes::new())
        .unwrap()
}

fn relationship_rows(store: &Store, source: Uuid, target: Uuid) -> i64 {
    store
        .connection()
        .query_row(
            "SELECT COUNT(*) FROM relationships WHERE source_id = ?1 AND target_id = ?2;",
            [source.to_string(), target.to_string()],
            |row| row.get(0),
        )
        .unwrap()
}

#[test]
fn associate_twice_while_active_is_conflict() {
    let store = Store::open_in_memory().unwrap();
    let policy = LifecyclePolicy::new();
    let session = create(&store, &policy, "session");
    let learner = create(&store, &policy, "learner");
    let index = RelationshipIndex::new(store.entities(), store.relationships());

    let link = index
        .associate(session.id, learner.id, Attributes::new())
        .unwrap();
    assert_eq!(link.status, RelationshipStatus::Registered);
    assert!(link.active);

    let err = index
        .associate(session.id, learner.id, Attributes::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.http_status(), 409);
}

#[test]
fn reassociation_reactivates_the_single_record() {
    let store = Store::open_in_memory().unwrap();
    let policy = LifecyclePolicy::new();
    let session = create(&store, &policy, "session");
    let learner = create(&store, &policy, "learner");
    let index = RelationshipIndex::new(store.entities(), store.relationships());

    index
        .associate(session.id, learner.id, attrs(json!({"feedback": "great"})))
        .unwrap();
    index
        .update_status(session.id, learner.id, RelationshipStatus::Attended)
        .unwrap();
    let inactive = index.deactivate(session.id, learner.id).unwrap();
    assert!(!inactive.active);

    let revived = index
        .associate(session.id, learner.id, Attributes::new())
        .unwrap();
    assert!(revived.active);
    assert_eq!(revived.status, RelationshipStatus::Registered);
    assert!(revived.attributes.is_empty());
    assert_eq!(relationship_rows(&store, session.id, learner.id), 1);
}

#[test]
fn associate_requires_existing_active_endpoints() {
    let store = Store::open_in_memory().unwrap();
    let policy = LifecyclePolicy::new();
    let session = create(&store, &policy, "session");
    let learner = create(&store, &policy, "learner");
    let index = RelationshipIndex::new(store.entities(), store.relationships());

    let missing = index
        .associate(session.id, Uuid::new_v4(), Attributes::new())
        .unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);

    EntityStore::new(store.entities(), &policy)
        .set_active(learner.id, false)
        .unwrap();
    let inactive = index
        .associate(session.id, learner.id, Attributes::new())
        .unwrap_err();
    assert!(matches!(inactive, CoreError::InactiveEndpoint(id) if id == learner.id));
}

#[test]
fn deactivate_requires_an_active_record() {
    let store = Store::open_in_memory().unwrap();
    let policy = LifecyclePolicy::new();
    let session = create(&store, &policy, "session");
    let learner = create(&store, &policy, "learner");
    let index = RelationshipIndex::new(store.entities(), store.relationships());

    assert_eq!(
        index
            .deactivate(session.id, learner.id)
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
    index
        .associate(session.id, learner.id, Attributes::new())
        .unwrap();
    index.deactivate(session.id, learner.id).unwrap();
    assert_eq!(
        index
            .deactivate(session.id, learner.id)
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn by_entity_filters_role_and_never_yields_inactive_when_asked() {
    let store = Store::open_in_memory().unwrap();
    let policy = LifecyclePolicy::new();
    let mentor = create(&store, &policy, "mentor");
    let session = create(&store, &policy, "session");
    let learners: Vec<_> = (0..5)
        .map(|_| create(&store, &policy, "learner"))
        .collect();
    let index = RelationshipIndex::new(store.entities(), store.relationships());

    index
        .associate(mentor.id, session.id, Attributes::new())
        .unwrap();
    for learner in &learners {
        index
            .associate(session.id, learner.id, Attributes::new())
            .unwrap();
    }
    index.deactivate(session.id, learners[1].id).unwrap();
    index.deactivate(session.id, learners[3].id).unwrap();
    index
        .associate(session.id, learners[3].id, Attributes::new())
        .unwrap();
    index.deactivate(session.id, learners[4].id).unwrap();

    let active: Vec<_> = index
        .by_entity(session.id, Role::Source, true)
        .map(Result::unwrap)
        .collect();
    assert!(active.iter().all(|link| link.active));
    assert_eq!(
        active.iter().map(|link| link.target_id).collect::<Vec<_>>(),
        vec![learners[0].id, learners[2].id, learners[3].id]
    );

    assert_eq!(index.by_entity(session.id, Role::Source, false).count(), 5);
    assert_eq!(index.by_entity(session.id, Role::Target, false).count(), 1);
    assert_eq!(index.by_entity(session.id, Role::Any, true).count(), 4);
}

#[test]
fn update_status_accepts_any_successor_and_patch_merges_attributes() {
    let store = Store::open_in_memory().unwrap();
    let policy = LifecyclePolicy::new();
    let session = create(&store, &policy, "session");
    let learner = create(&store, &policy, "learner");
    let index = RelationshipIndex::new(store.entities(), store.relationships());
    index
        .associate(session.id, learner.id, attrs(json!({"seat": 4})))
        .unwrap();

    for status in [
        RelationshipStatus::Cancelled,
        RelationshipStatus::Attended,
        RelationshipStatus::Registered,
        "waitlisted".parse().unwrap(),
    ] {
        let link = index
            .update_status(session.id, learner.id, status.clone())
            .unwrap();
        assert_eq!(link.status, status);
    }

    let patched = index
        .patch_attributes(
            session.id,
            learner.id,
            attrs(json!({"feedback": "clear examples", "seat": null})),
        )
        .unwrap();
    assert_eq!(patched.attributes, attrs(json!({"feedback": "clear examples"})));

    assert_eq!(
        index
            .update_status(learner.id, session.id, RelationshipStatus::Attended)
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn counterpart_queries_follow_roles_and_statuses() {
    let store = Store::open_in_memory().unwrap();
    let policy = LifecyclePolicy::new();
    let first = create(&store, &policy, "session");
    let second = create(&store, &policy, "session");
    let ada = create(&store, &policy, "learner");
    let lin = create(&store, &policy, "learner");
    let idle = create(&store, &policy, "learner");
    let index = RelationshipIndex::new(store.entities(), store.relationships());

    for (session, learner) in [(&first, &ada), (&first, &lin), (&second, &ada)] {
        index
            .associate(session.id, learner.id, Attributes::new())
            .unwrap();
        index
            .update_status(session.id, learner.id, RelationshipStatus::Attended)
            .unwrap();
    }
    index.deactivate(first.id, lin.id).unwrap();

    let sessions_of_ada: Vec<_> = index
        .counterparts(ada.id, Role::Target, true)
        .unwrap()
        .into_iter()
        .map(|entity| entity.id)
        .collect();
    assert_eq!(sessions_of_ada, vec![first.id, second.id]);

    assert_eq!(
        index
            .counterparts(first.id, Role::Source, true)
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        index
            .counterparts(first.id, Role::Source, false)
            .unwrap()
            .len(),
        2
    );

    // History counts soft-deleted records too.
    assert_eq!(
        index
            .count_counterparts_with_status(first.id, Role::Source, &RelationshipStatus::Attended)
            .unwrap(),
        2
    );

    let idle_learners: Vec<_> = index
        .entities_without_active_relationships(&kind("learner"), Role::Target)
        .unwrap()
        .into_iter()
        .map(|entity| entity.id)
        .collect();
    assert_eq!(idle_learners, vec![lin.id, idle.id]);

    let engaged = index
        .counterparts_exceeding(
            &kind("learner"),
            Role::Target,
            &RelationshipStatus::Attended,
            1,
        )
        .unwrap();
    assert_eq!(engaged.len(), 1);
    assert_eq!(engaged[0].0.id, ada.id);
    assert_eq!(engaged[0].1, 2);

    let recent = index.recent(10).unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].source_id, second.id);
}

#[test]
fn deactivating_while_iterating_by_entity_yields_every_link() {
    let store = Store::open_in_memory().unwrap();
    let policy = LifecyclePolicy::new();
    let course = create(&store, &policy, "course");
    let index = RelationshipIndex::new(store.entities(), store.relationships());
    for _ in 0..100 {
        let learner = create(&store, &policy, "learner");
        index
            .associate(course.id, learner.id, Attributes::new())
            .unwrap();
    }

    let mut yielded = 0;
    for link in index.by_entity(course.id, Role::Source, true) {
        let link = link.unwrap();
        index.deactivate(link.source_id, link.target_id).unwrap();
        yielded += 1;
    }
    assert_eq!(yielded, 100);
    assert_eq!(index.by_entity(course.id, Role::Source, true).count(), 0);
    assert_eq!(index.by_entity(course.id, Role::Source, false).count(), 100);
}

#[test]
fn reassociation_refreshes_created_at_within_the_same_second() {
    let store = Store::open_in_memory().unwrap();
    let policy = LifecyclePolicy::new();
    let session = create(&store, &policy, "session");
    let learner = create(&store, &policy, "learner");
    let index = RelationshipIndex::new(store.entities(), store.relationships());

    let first = index
        .associate(session.id, learner.id, Attributes::new())
        .unwrap();
    index.deactivate(session.id, learner.id).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));
    let revived = index
        .associate(session.id, learner.id, Attributes::new())
        .unwrap();

    assert!(revived.created_at > first.created_at);
    assert!(revived.created_at - first.created_at < 60_000);
}
