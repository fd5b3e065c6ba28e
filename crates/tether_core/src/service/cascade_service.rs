//! Cascade Engine: entity transitions and policy-driven relationship updates.
//!
//! # Responsibility
//! - Validate and apply entity lifecycle transitions.
//! - Evaluate the policy's cascade rules against every relationship touching
//!   the transitioning entity and apply matching actions.
//! - Propagate transitions to counterparts when a rule asks for it.
//! - Repair entities whose cascades never ran (`reconcile_entity`).
//!
//! # Invariants
//! - A transition and its whole cascade commit in one `BEGIN IMMEDIATE`
//!   transaction, or not at all.
//! - Actions are idempotent; `affected` counts only relationships whose
//!   stored state changed.
//! - Each entity is visited at most once per run, and propagation deeper than
//!   `MAX_CASCADE_DEPTH` fails the whole operation.
//! - Relationships are only revived when their counterpart is active.

use crate::clock::{Clock, SystemClock};
use crate::model::entity::{Entity, EntityId, Transition};
use crate::model::policy::{CascadeRule, LifecyclePolicy};
use crate::model::relationship::{Relationship, Role};
use crate::repo::cursor::{PageCursor, DEFAULT_PAGE_SIZE};
use crate::repo::entity_repo::{EntityRepository, SqliteEntityRepository};
use crate::repo::relationship_repo::{RelationshipRepository, SqliteRelationshipRepository};
use crate::repo::{with_write_tx, RepoResult};
use crate::service::error::{CoreError, CoreResult};
use log::{error, info};
use rusqlite::Connection;
use std::collections::HashSet;
use std::time::Instant;

/// Maximum number of propagation hops from the entity a caller transitioned.
pub const MAX_CASCADE_DEPTH: usize = 64;

/// Result of a transition or reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeOutcome {
    /// The entity the caller asked about, as stored after the run.
    pub entity: Entity,
    /// Relationships whose status or active flag changed.
    pub affected: usize,
    /// Counterparts whose active flag was flipped by propagation, in order.
    pub propagated: Vec<EntityId>,
}

/// Cascade engine bound to one connection and policy.
pub struct CascadeEngine<'a> {
    conn: &'a Connection,
    policy: &'a LifecyclePolicy,
    clock: Box<dyn Clock + 'a>,
}

impl<'a> CascadeEngine<'a> {
    pub fn new(conn: &'a Connection, policy: &'a LifecyclePolicy) -> Self {
        Self::with_clock(conn, policy, SystemClock)
    }

    /// Uses `clock` to evaluate schedule filters.
    pub fn with_clock(
        conn: &'a Connection,
        policy: &'a LifecyclePolicy,
        clock: impl Clock + 'a,
    ) -> Self {
        Self {
            conn,
            policy,
            clock: Box::new(clock),
        }
    }

    /// Soft-deletes an entity and applies its `deactivate` rules.
    ///
    /// # Errors
    /// - `NotFound` for an unknown id.
    /// - `InvalidTransition` when the entity is already inactive.
    pub fn deactivate_entity(&self, id: EntityId) -> CoreResult<CascadeOutcome> {
        self.run("deactivate", id, Mode::Transition(Transition::Deactivate))
    }

    /// Restores an entity and applies its `reactivate` rules.
    ///
    /// Relationships cascaded by an earlier deactivation stay as they are
    /// unless a `reactivate` rule revives them.
    pub fn reactivate_entity(&self, id: EntityId) -> CoreResult<CascadeOutcome> {
        self.run("reactivate", id, Mode::Transition(Transition::Reactivate))
    }

    /// Re-applies the `deactivate` rules of an inactive entity without
    /// touching its flag. Safe to repeat.
    ///
    /// # Errors
    /// - `InvalidTransition` when the entity is active.
    pub fn reconcile_entity(&self, id: EntityId) -> CoreResult<CascadeOutcome> {
        self.run("reconcile", id, Mode::Reconcile)
    }

    /// Relationships of an inactive entity that its `deactivate` rules would
    /// still change. Empty for active entities.
    pub fn stale_relationships(&self, id: EntityId) -> CoreResult<Vec<Relationship>> {
        let entities = SqliteEntityRepository::new(self.conn);
        let relationships = SqliteRelationshipRepository::new(self.conn);
        let entity = entities
            .get_entity(id)?
            .ok_or_else(|| CoreError::entity_not_found(id))?;
        if entity.active {
            return Ok(Vec::new());
        }

        let rules: Vec<&CascadeRule> = self
            .policy
            .rules_for(&entity.kind, Transition::Deactivate)
            .collect();
        if rules.is_empty() {
            return Ok(Vec::new());
        }

        let now_ms = self.clock.now_ms();
        let mut stale = Vec::new();
        for relationship in touching(&relationships, &entity, &rules)? {
            let Some((role, counterpart)) = endpoint_view(&entities, &entity, &relationship)?
            else {
                continue;
            };
            let pending = rules.iter().any(|rule| {
                rule.matches(&relationship, role, counterpart.as_ref(), now_ms)
                    && would_change(
                        rule,
                        &relationship,
                        counterpart.as_ref(),
                        Transition::Deactivate,
                    )
            });
            if pending {
                stale.push(relationship);
            }
        }
        Ok(stale)
    }

    fn run(&self, operation: &'static str, id: EntityId, mode: Mode) -> CoreResult<CascadeOutcome> {
        let started_at = Instant::now();
        info!("event=cascade_run module=cascade status=start operation={operation}");

        let now_ms = self.clock.now_ms();
        let result: CoreResult<CascadeOutcome> = with_write_tx(self.conn, |conn| {
            let mut run = CascadeRun::new(conn, self.policy, now_ms);
            let entity = run.start(id, mode)?;
            Ok(CascadeOutcome {
                entity,
                affected: run.affected.len(),
                propagated: run.propagated,
            })
        });

        match &result {
            Ok(outcome) => info!(
                "event=cascade_run module=cascade status=ok operation={} affected={} propagated={} duration_ms={}",
                operation,
                outcome.affected,
                outcome.propagated.len(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=cascade_run module=cascade status=error operation={} error_code={} duration_ms={} error={}",
                operation,
                err.kind().as_str(),
                started_at.elapsed().as_millis(),
                err
            ),
        }
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Transition(Transition),
    Reconcile,
}

impl Mode {
    fn transition(self) -> Transition {
        match self {
            Self::Transition(transition) => transition,
            Self::Reconcile => Transition::Deactivate,
        }
    }
}

/// State of one engine call inside its transaction.
struct CascadeRun<'c> {
    entities: SqliteEntityRepository<'c>,
    relationships: SqliteRelationshipRepository<'c>,
    policy: &'c LifecyclePolicy,
    now_ms: i64,
    visited: HashSet<EntityId>,
    affected: HashSet<(EntityId, EntityId)>,
    propagated: Vec<EntityId>,
}

impl<'c> CascadeRun<'c> {
    fn new(conn: &'c Connection, policy: &'c LifecyclePolicy, now_ms: i64) -> Self {
        Self {
            entities: SqliteEntityRepository::new(conn),
            relationships: SqliteRelationshipRepository::new(conn),
            policy,
            now_ms,
            visited: HashSet::new(),
            affected: HashSet::new(),
            propagated: Vec::new(),
        }
    }

    fn start(&mut self, id: EntityId, mode: Mode) -> CoreResult<Entity> {
        let entity = self.load(id)?;
        match mode {
            Mode::Transition(transition) => {
                let target = transition.target_active();
                if !entity.can(transition) || !self.entities.set_entity_active(id, target)? {
                    return Err(CoreError::InvalidTransition {
                        id,
                        reason: if target {
                            "entity is already active"
                        } else {
                            "entity is already inactive"
                        },
                    });
                }
            }
            Mode::Reconcile => {
                if entity.active {
                    return Err(CoreError::InvalidTransition {
                        id,
                        reason: "entity is active; nothing to reconcile",
                    });
                }
            }
        }

        self.visited.insert(id);
        let entity = self.load(id)?;
        self.cascade(&entity, mode, 0)?;
        self.load(id)
    }

    fn cascade(&mut self, entity: &Entity, mode: Mode, depth: usize) -> CoreResult<()> {
        if depth > MAX_CASCADE_DEPTH {
            return Err(CoreError::CascadeDepthExceeded { depth });
        }

        let transition = mode.transition();
        let policy = self.policy;
        let rules: Vec<&CascadeRule> = policy.rules_for(&entity.kind, transition).collect();
        if rules.is_empty() {
            return Ok(());
        }

        // Snapshot first; actions below change the rows a live cursor would page over.
        let snapshot = touching(&self.relationships, entity, &rules)?;
        for mut relationship in snapshot {
            let Some((role, counterpart)) =
                endpoint_view(&self.entities, entity, &relationship)?
            else {
                continue;
            };
            for rule in &rules {
                if rule.matches(&relationship, role, counterpart.as_ref(), self.now_ms) {
                    self.apply(rule, &mut relationship, counterpart.as_ref(), mode, depth)?;
                }
            }
        }
        Ok(())
    }

    fn apply(
        &mut self,
        rule: &CascadeRule,
        relationship: &mut Relationship,
        counterpart: Option<&Entity>,
        mode: Mode,
        depth: usize,
    ) -> CoreResult<()> {
        let pair = (relationship.source_id, relationship.target_id);
        let action = &rule.action;

        if let Some(status) = action.set_status.as_ref() {
            if self
                .relationships
                .set_relationship_status(pair.0, pair.1, status)?
            {
                self.affected.insert(pair);
            }
            relationship.status = status.clone();
        }

        if action.deactivate_relationship {
            if self
                .relationships
                .set_relationship_active(pair.0, pair.1, false)?
            {
                self.affected.insert(pair);
            }
            relationship.active = false;
        }

        if action.reactivate_relationship && counterpart.is_some_and(|entity| entity.active) {
            if self
                .relationships
                .set_relationship_active(pair.0, pair.1, true)?
            {
                self.affected.insert(pair);
            }
            relationship.active = true;
        }

        if action.propagate {
            if let Some(counterpart) = counterpart {
                self.propagate(counterpart.id, mode, depth)?;
            }
        }
        Ok(())
    }

    fn propagate(&mut self, id: EntityId, mode: Mode, depth: usize) -> CoreResult<()> {
        if self.visited.contains(&id) {
            return Ok(());
        }
        let transition = mode.transition();
        let counterpart = self.load(id)?;

        if counterpart.can(transition) {
            if !self
                .entities
                .set_entity_active(id, transition.target_active())?
            {
                return Ok(());
            }
            self.propagated.push(id);
        } else if mode != Mode::Reconcile {
            return Ok(());
        }

        self.visited.insert(id);
        let counterpart = self.load(id)?;
        self.cascade(&counterpart, mode, depth + 1)
    }

    fn load(&self, id: EntityId) -> CoreResult<Entity> {
        self.entities
            .get_entity(id)?
            .ok_or_else(|| CoreError::entity_not_found(id))
    }
}

/// Reads every relationship of `entity` the `rules` could match.
fn touching<R: RelationshipRepository>(
    relationships: &R,
    entity: &Entity,
    rules: &[&CascadeRule],
) -> RepoResult<Vec<Relationship>> {
    let active_only = !rules.iter().any(|rule| rule.include_inactive);
    let id = entity.id;
    PageCursor::new(DEFAULT_PAGE_SIZE, None, |after, limit| {
        relationships.list_by_entity(id, Role::Any, active_only, after, limit)
    })
    .collect()
}

/// Position of `entity` in `relationship` and the loaded counterpart.
fn endpoint_view<E: EntityRepository>(
    entities: &E,
    entity: &Entity,
    relationship: &Relationship,
) -> RepoResult<Option<(Role, Option<Entity>)>> {
    let (Some(role), Some(counterpart_id)) = (
        relationship.role_of(entity.id),
        relationship.counterpart_of(entity.id),
    ) else {
        return Ok(None);
    };
    let counterpart = entities.get_entity(counterpart_id)?;
    Ok(Some((role, counterpart)))
}

/// Returns whether applying `rule` would change stored state.
fn would_change(
    rule: &CascadeRule,
    relationship: &Relationship,
    counterpart: Option<&Entity>,
    transition: Transition,
) -> bool {
    let action = &rule.action;
    let status_changes = action
        .set_status
        .as_ref()
        .is_some_and(|status| status != &relationship.status);
    let counterpart_active = counterpart.is_some_and(|entity| entity.active);
    status_changes
        || (action.deactivate_relationship && relationship.active)
        || (action.reactivate_relationship && !relationship.active && counterpart_active)
        || (action.propagate && counterpart.is_some_and(|entity| entity.can(transition)))
}

#[cfg(test)]
mod tests {
    use super::would_change;
    use crate::model::entity::{Attributes, Entity, EntityKind, Transition};
    use crate::model::policy::CascadeRule;
    use crate::model::relationship::{Relationship, RelationshipStatus};
    use uuid::Uuid;

    fn relationship(status: RelationshipStatus, active: bool) -> Relationship {
        Relationship {
            source_id: Uuid::new_v4(),
            target_id: Uuid::new_v4(),
            status,
            attributes: Attributes::new(),
            active,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn cancelled_relationship_needs_no_further_cancel() {
        let rule = CascadeRule::on(EntityKind::new("learner").unwrap(), Transition::Deactivate)
            .set_status(RelationshipStatus::Cancelled);
        assert!(would_change(
            &rule,
            &relationship(RelationshipStatus::Registered, true),
            None,
            Transition::Deactivate
        ));
        assert!(!would_change(
            &rule,
            &relationship(RelationshipStatus::Cancelled, true),
            None,
            Transition::Deactivate
        ));
    }

    #[test]
    fn propagation_is_pending_only_for_counterparts_in_the_old_state() {
        let rule = CascadeRule::on(EntityKind::new("mentor").unwrap(), Transition::Deactivate)
            .propagate();
        let record = relationship(RelationshipStatus::Registered, true);
        let mut session = Entity::new(EntityKind::new("session").unwrap(), Attributes::new());
        assert!(would_change(
            &rule,
            &record,
            Some(&session),
            Transition::Deactivate
        ));
        session.active = false;
        assert!(!would_change(
            &rule,
            &record,
            Some(&session),
            Transition::Deactivate
        ));
    }
}
