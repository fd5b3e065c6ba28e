use serde_json::json;
use tether_core::{
    Attributes, CascadeEngine, CascadeRule, CoreError, Entity, EntityKind, EntityStore,
    ErrorKind, FixedClock, LifecyclePolicy, RelationshipIndex, RelationshipStatus, Role, Store,
    Transition, MAX_CASCADE_DEPTH,
};
use tether_core::repo::entity_repo::SqliteEntityRepository;
use tether_core::repo::relationship_repo::SqliteRelationshipRepository;
use uuid::Uuid;

const NOW: i64 = 1_700_000_000_000;
const DAY: i64 = 86_400_000;

fn mentorship_policy() -> LifecyclePolicy {
    LifecyclePolicy::load(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/mentorship_policy.json"
    ))
    .unwrap()
}

fn kind(value: &str) -> EntityKind {
    EntityKind::new(value).unwrap()
}

fn attrs(value: serde_json::Value) -> Attributes {
    serde_json::from_value(value).unwrap()
}

fn engine<'a>(store: &'a Store, policy: &'a LifecyclePolicy) -> CascadeEngine<'a> {
    CascadeEngine::with_clock(store.connection(), policy, FixedClock(NOW))
}

fn mentor(store: &Store, policy: &LifecyclePolicy, name: &str) -> Entity {
    EntityStore::new(store.entities(), policy)
        .create(
            kind("mentor"),
            attrs(json!({"name": name, "expertise": "systems"})),
        )
        .unwrap()
}

fn learner(store: &Store, policy: &LifecyclePolicy, name: &str) -> Entity {
    EntityStore::new(store.entities(), policy)
        .create(
            kind("learner"),
            attrs(json!({"name": name, "email": format!("{name}@example.com")})),
        )
        .unwrap()
}

/// Creates a session at `NOW + offset_ms` hosted by `host`.
fn session(store: &Store, policy: &LifecyclePolicy, host: &Entity, offset_ms: i64) -> Entity {
    let session = EntityStore::new(store.entities(), policy)
        .create(
            kind("session"),
            attrs(json!({"topic": "ownership", "scheduled_at": NOW + offset_ms})),
        )
        .unwrap();
    index(store)
        .associate(host.id, session.id, Attributes::new())
        .unwrap();
    session
}

fn index(
    store: &Store,
) -> RelationshipIndex<SqliteEntityRepository<'_>, SqliteRelationshipRepository<'_>> {
    RelationshipIndex::new(store.entities(), store.relationships())
}

fn register(store: &Store, session: &Entity, learner: &Entity) {
    index(store)
        .associate(session.id, learner.id, Attributes::new())
        .unwrap();
}

fn status(store: &Store, source: &Entity, target: &Entity) -> (RelationshipStatus, bool) {
    let link = index(store).get(source.id, target.id).unwrap();
    (link.status, link.active)
}

fn is_active(store: &Store, policy: &LifecyclePolicy, entity: &Entity) -> bool {
    EntityStore::new(store.entities(), policy)
        .get(entity.id)
        .unwrap()
        .active
}

#[test]
fn deactivating_twice_is_an_invalid_transition() {
    let store = Store::open_in_memory().unwrap();
    let policy = mentorship_policy();
    let ada = mentor(&store, &policy, "ada");
    let engine = engine(&store, &policy);

    let outcome = engine.deactivate_entity(ada.id).unwrap();
    assert!(!outcome.entity.active);
    assert_eq!(outcome.affected, 0);

    let err = engine.deactivate_entity(ada.id).unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { id, .. } if id == ada.id));
    assert_eq!(err.http_status(), 400);
    assert!(!is_active(&store, &policy, &ada));

    assert_eq!(
        engine.deactivate_entity(Uuid::new_v4()).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn mentor_deactivation_touches_only_future_sessions() {
    let store = Store::open_in_memory().unwrap();
    let policy = mentorship_policy();
    let ada = mentor(&store, &policy, "ada");
    let future: Vec<_> = [DAY, 2 * DAY, 3 * DAY]
        .into_iter()
        .map(|offset| session(&store, &policy, &ada, offset))
        .collect();
    let past: Vec<_> = [-DAY, -2 * DAY]
        .into_iter()
        .map(|offset| session(&store, &policy, &ada, offset))
        .collect();

    let outcome = engine(&store, &policy).deactivate_entity(ada.id).unwrap();

    assert_eq!(outcome.affected, future.len());
    assert_eq!(
        outcome.propagated,
        future.iter().map(|session| session.id).collect::<Vec<_>>()
    );
    for session in &future {
        assert_eq!(
            status(&store, &ada, session),
            (RelationshipStatus::Registered, false)
        );
        assert!(!is_active(&store, &policy, session));
    }
    for session in &past {
        assert_eq!(
            status(&store, &ada, session),
            (RelationshipStatus::Registered, true)
        );
        assert!(is_active(&store, &policy, session));
    }
}

#[test]
fn mentor_deactivation_cancels_attendees_of_future_sessions_only() {
    let store = Store::open_in_memory().unwrap();
    let policy = mentorship_policy();
    let ada = mentor(&store, &policy, "ada");
    let tomorrow = session(&store, &policy, &ada, DAY);
    let yesterday = session(&store, &policy, &ada, -DAY);
    let lin = learner(&store, &policy, "lin");
    let kai = learner(&store, &policy, "kai");
    register(&store, &tomorrow, &lin);
    register(&store, &yesterday, &kai);

    let outcome = engine(&store, &policy).deactivate_entity(ada.id).unwrap();

    // One mentor link plus one attendee cancellation.
    assert_eq!(outcome.affected, 2);
    assert_eq!(
        status(&store, &tomorrow, &lin),
        (RelationshipStatus::Cancelled, true)
    );
    assert_eq!(
        status(&store, &yesterday, &kai),
        (RelationshipStatus::Registered, true)
    );
    assert!(is_active(&store, &policy, &lin));
}

#[test]
fn learner_deactivation_cancels_future_registrations_only() {
    let store = Store::open_in_memory().unwrap();
    let policy = mentorship_policy();
    let ada = mentor(&store, &policy, "ada");
    let upcoming = session(&store, &policy, &ada, DAY);
    let attended_upcoming = session(&store, &policy, &ada, 2 * DAY);
    let finished = session(&store, &policy, &ada, -DAY);
    let lin = learner(&store, &policy, "lin");
    for session in [&upcoming, &attended_upcoming, &finished] {
        register(&store, session, &lin);
    }
    index(&store)
        .update_status(attended_upcoming.id, lin.id, RelationshipStatus::Attended)
        .unwrap();

    let outcome = engine(&store, &policy).deactivate_entity(lin.id).unwrap();

    assert_eq!(outcome.affected, 1);
    assert!(outcome.propagated.is_empty());
    assert_eq!(
        status(&store, &upcoming, &lin),
        (RelationshipStatus::Cancelled, true)
    );
    assert_eq!(
        status(&store, &attended_upcoming, &lin),
        (RelationshipStatus::Attended, true)
    );
    assert_eq!(
        status(&store, &finished, &lin),
        (RelationshipStatus::Registered, true)
    );
}

#[test]
fn reapplying_cancellation_is_a_no_op() {
    let store = Store::open_in_memory().unwrap();
    let policy = mentorship_policy();
    let ada = mentor(&store, &policy, "ada");
    let upcoming = session(&store, &policy, &ada, DAY);
    let lin = learner(&store, &policy, "lin");
    register(&store, &upcoming, &lin);
    let engine = engine(&store, &policy);

    assert_eq!(engine.deactivate_entity(lin.id).unwrap().affected, 1);
    assert_eq!(engine.reactivate_entity(lin.id).unwrap().affected, 0);

    let again = engine.deactivate_entity(lin.id).unwrap();
    assert_eq!(again.affected, 0);
    assert_eq!(
        status(&store, &upcoming, &lin),
        (RelationshipStatus::Cancelled, true)
    );
}

#[test]
fn end_to_end_mentor_scenario() {
    let store = Store::open_in_memory().unwrap();
    let policy = mentorship_policy();
    let m = mentor(&store, &policy, "m");
    let l1 = learner(&store, &policy, "l1");
    let l2 = learner(&store, &policy, "l2");
    let s = session(&store, &policy, &m, DAY);
    register(&store, &s, &l1);
    register(&store, &s, &l2);

    let outcome = engine(&store, &policy).deactivate_entity(m.id).unwrap();

    assert!(!outcome.entity.active);
    assert_eq!(outcome.affected, 3);
    assert_eq!(outcome.propagated, vec![s.id]);
    assert_eq!(
        status(&store, &s, &l1),
        (RelationshipStatus::Cancelled, true)
    );
    assert_eq!(
        status(&store, &s, &l2),
        (RelationshipStatus::Cancelled, true)
    );
    assert!(!is_active(&store, &policy, &s));
    assert_eq!(index(&store).by_entity(m.id, Role::Source, true).count(), 0);
}

#[test]
fn reactivation_does_not_restore_cascaded_relationships() {
    let store = Store::open_in_memory().unwrap();
    let policy = mentorship_policy();
    let m = mentor(&store, &policy, "m");
    let l1 = learner(&store, &policy, "l1");
    let s = session(&store, &policy, &m, DAY);
    register(&store, &s, &l1);
    let engine = engine(&store, &policy);
    engine.deactivate_entity(m.id).unwrap();

    let outcome = engine.reactivate_entity(m.id).unwrap();

    assert!(outcome.entity.active);
    assert_eq!(outcome.affected, 0);
    assert!(outcome.propagated.is_empty());
    assert!(!is_active(&store, &policy, &s));
    assert_eq!(
        status(&store, &m, &s),
        (RelationshipStatus::Registered, false)
    );
    assert_eq!(
        status(&store, &s, &l1),
        (RelationshipStatus::Cancelled, true)
    );
    assert!(matches!(
        engine.reactivate_entity(m.id),
        Err(CoreError::InvalidTransition { .. })
    ));
}

#[test]
fn reactivate_rules_revive_links_to_active_counterparts() {
    let course = kind("course");
    let policy = LifecyclePolicy::new()
        .with_rule(
            CascadeRule::on(course.clone(), Transition::Deactivate).deactivate_relationship(),
        )
        .with_rule(
            CascadeRule::on(course.clone(), Transition::Reactivate)
                .include_inactive()
                .reactivate_relationship(),
        );
    let store = Store::open_in_memory().unwrap();
    let entities = EntityStore::new(store.entities(), &policy);
    let rust = entities.create(course, Attributes::new()).unwrap();
    let ana = entities
        .create(kind("student"), Attributes::new())
        .unwrap();
    let ben = entities
        .create(kind("student"), Attributes::new())
        .unwrap();
    index(&store)
        .associate(ana.id, rust.id, Attributes::new())
        .unwrap();
    index(&store)
        .associate(ben.id, rust.id, Attributes::new())
        .unwrap();
    let engine = engine(&store, &policy);

    assert_eq!(engine.deactivate_entity(rust.id).unwrap().affected, 2);
    entities.set_active(ben.id, false).unwrap();

    let outcome = engine.reactivate_entity(rust.id).unwrap();
    assert_eq!(outcome.affected, 1);
    assert!(index(&store).get(ana.id, rust.id).unwrap().active);
    assert!(!index(&store).get(ben.id, rust.id).unwrap().active);
}

fn chain_policy() -> LifecyclePolicy {
    LifecyclePolicy::new().with_rule(
        CascadeRule::on(kind("node"), Transition::Deactivate)
            .role(Role::Source)
            .deactivate_relationship()
            .propagate(),
    )
}

fn chain(store: &Store, policy: &LifecyclePolicy, len: usize) -> Vec<Entity> {
    let entities = EntityStore::new(store.entities(), policy);
    let nodes: Vec<_> = (0..len)
        .map(|_| entities.create(kind("node"), Attributes::new()).unwrap())
        .collect();
    for pair in nodes.windows(2) {
        index(store)
            .associate(pair[0].id, pair[1].id, Attributes::new())
            .unwrap();
    }
    nodes
}

#[test]
fn propagation_follows_chains_up_to_the_depth_limit() {
    let store = Store::open_in_memory().unwrap();
    let policy = chain_policy();
    let nodes = chain(&store, &policy, MAX_CASCADE_DEPTH + 1);

    let outcome = engine(&store, &policy)
        .deactivate_entity(nodes[0].id)
        .unwrap();

    assert_eq!(outcome.propagated.len(), MAX_CASCADE_DEPTH);
    assert_eq!(outcome.affected, MAX_CASCADE_DEPTH);
    assert!(nodes
        .iter()
        .all(|node| !is_active(&store, &policy, node)));
}

#[test]
fn exceeding_the_depth_limit_rolls_back_everything() {
    let store = Store::open_in_memory().unwrap();
    let policy = chain_policy();
    let nodes = chain(&store, &policy, MAX_CASCADE_DEPTH + 2);

    let err = engine(&store, &policy)
        .deactivate_entity(nodes[0].id)
        .unwrap_err();

    assert!(matches!(err, CoreError::CascadeDepthExceeded { .. }));
    assert_eq!(err.http_status(), 500);
    assert!(nodes.iter().all(|node| is_active(&store, &policy, node)));
    assert!(index(&store).get(nodes[0].id, nodes[1].id).unwrap().active);
}

#[test]
fn propagation_cycles_visit_each_entity_once() {
    let store = Store::open_in_memory().unwrap();
    let policy = chain_policy();
    let nodes = chain(&store, &policy, 3);
    index(&store)
        .associate(nodes[2].id, nodes[0].id, Attributes::new())
        .unwrap();

    let outcome = engine(&store, &policy)
        .deactivate_entity(nodes[0].id)
        .unwrap();

    assert_eq!(outcome.propagated, vec![nodes[1].id, nodes[2].id]);
    assert_eq!(outcome.affected, 3);
}

#[test]
fn reconcile_repairs_an_entity_deactivated_without_its_cascade() {
    let store = Store::open_in_memory().unwrap();
    let policy = mentorship_policy();
    let m = mentor(&store, &policy, "m");
    let l1 = learner(&store, &policy, "l1");
    let s = session(&store, &policy, &m, DAY);
    let past = session(&store, &policy, &m, -DAY);
    register(&store, &s, &l1);
    let engine = engine(&store, &policy);

    assert!(engine.stale_relationships(m.id).unwrap().is_empty());
    assert!(matches!(
        engine.reconcile_entity(m.id),
        Err(CoreError::InvalidTransition { .. })
    ));

    // Flag flipped without running the cascade.
    EntityStore::new(store.entities(), &policy)
        .set_active(m.id, false)
        .unwrap();
    let stale = engine.stale_relationships(m.id).unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].target_id, s.id);

    let repaired = engine.reconcile_entity(m.id).unwrap();
    assert!(!repaired.entity.active);
    assert_eq!(repaired.affected, 2);
    assert_eq!(repaired.propagated, vec![s.id]);
    assert_eq!(
        status(&store, &s, &l1),
        (RelationshipStatus::Cancelled, true)
    );
    assert_eq!(
        status(&store, &m, &past),
        (RelationshipStatus::Registered, true)
    );

    assert!(engine.stale_relationships(m.id).unwrap().is_empty());
    assert_eq!(engine.reconcile_entity(m.id).unwrap().affected, 0);
}
