//! Application definition.
//!
//! A [`CatalogBuilder`] collects relations and triggers; [`CatalogBuilder::build`]
//! checks the trigger graph once and freezes everything into a [`Catalog`].
//! No pipeline can be created from a definition that failed to build.

use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::parse_schedule;
use crate::error::{RegistrationError, TributaryResult, ValidationError};
use crate::execution::log_relation;
use crate::graph::TriggerGraph;
use crate::registry::{check_not_reserved, validate_name, Relation, RelationRegistry};
use crate::schema::Schema;
use crate::trigger::{tick_relation_name, ExecutionMode, Trigger, TriggerSource};
use crate::value::FieldType;

/// Field written into every tick entry.
pub const TICK_FIELD: &str = "fired_at";

fn tick_relation(trigger: &str) -> Relation {
    Relation::new(
        tick_relation_name(trigger),
        Schema::new().field(TICK_FIELD, FieldType::Timestamp),
    )
}

/// Mutable application definition.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    registry: RelationRegistry,
    triggers: Vec<Trigger>,
}

impl CatalogBuilder {
    /// Empty definition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a relation. Re-registering an identical relation is a no-op.
    pub fn relation(&mut self, relation: Relation) -> TributaryResult<&mut Self> {
        self.registry.register(relation)?;
        Ok(self)
    }

    /// Registers a trigger and subscribes it to its input relation.
    ///
    /// # Errors
    /// - `UnknownRelation` if the input or an output relation is not registered
    /// - `DuplicateTrigger` if the name is taken
    /// - `InvalidKeyField` if `partition_by` names a field the input lacks
    /// - `InvalidSchedule` for a malformed cron expression
    pub fn trigger(&mut self, trigger: Trigger) -> TributaryResult<&mut Self> {
        validate_name("trigger", trigger.name())?;
        if self.triggers.iter().any(|t| t.name() == trigger.name()) {
            return Err(RegistrationError::DuplicateTrigger {
                trigger: trigger.name().to_string(),
            }
            .into());
        }
        if trigger.attempt_limit() == Some(0) {
            return Err(ValidationError::InvalidConfig {
                reason: format!("trigger '{}': max_attempts must be at least 1", trigger.name()),
            }
            .into());
        }

        for output in trigger.outputs() {
            check_not_reserved(output)?;
            if !self.registry.contains(output) {
                return Err(RegistrationError::UnknownRelation {
                    relation: output.clone(),
                }
                .into());
            }
        }

        let tick = match trigger.source() {
            TriggerSource::Schedule(expr) => {
                parse_schedule(expr)?;
                Some(tick_relation(trigger.name()))
            }
            TriggerSource::Relation(input) => {
                check_not_reserved(input)?;
                None
            }
        };

        let input = match &tick {
            Some(relation) => relation,
            None => self
                .registry
                .relation(trigger.input())
                .ok_or_else(|| RegistrationError::UnknownRelation {
                    relation: trigger.input().to_string(),
                })?,
        };
        if let ExecutionMode::Stateful {
            partition_by: Some(field),
        } = trigger.mode()
        {
            if input.schema.get(field).is_none() {
                return Err(RegistrationError::InvalidKeyField {
                    relation: input.name.clone(),
                    field: field.clone(),
                }
                .into());
            }
        }

        if let Some(tick) = tick {
            self.registry.register_internal(tick)?;
        }
        self.registry.subscribe(trigger.input(), trigger.name())?;
        self.triggers.push(trigger);
        Ok(self)
    }

    /// Removes a trigger before the catalog is built.
    pub fn remove_trigger(&mut self, name: &str) -> TributaryResult<Trigger> {
        let pos = self
            .triggers
            .iter()
            .position(|t| t.name() == name)
            .ok_or_else(|| RegistrationError::UnknownTrigger {
                trigger: name.to_string(),
            })?;
        let trigger = self.triggers.remove(pos);
        self.registry.unsubscribe(trigger.input(), name);
        if trigger.schedule().is_some() {
            self.registry.remove(trigger.input())?;
        }
        Ok(trigger)
    }

    /// Removes a relation no trigger reads or writes.
    pub fn remove_relation(&mut self, name: &str) -> TributaryResult<Relation> {
        if let Some(writer) = self.triggers.iter().find(|t| t.writes(name)) {
            return Err(RegistrationError::RelationInUse {
                relation: name.to_string(),
                trigger: writer.name().to_string(),
            }
            .into());
        }
        Ok(self.registry.remove(name)?)
    }

    /// Validates the trigger graph and freezes the definition.
    ///
    /// # Errors
    /// `CycleDetected` if any trigger can, transitively, feed its own input.
    pub fn build(mut self) -> TributaryResult<Arc<Catalog>> {
        let mut graph = TriggerGraph::new();
        for trigger in &self.triggers {
            graph.add_trigger(trigger.name(), trigger.input(), trigger.outputs())?;
        }
        graph.validate()?;
        self.registry.register_internal(log_relation())?;

        let by_name = self
            .triggers
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name().to_string(), i))
            .collect();

        tracing::debug!(
            relations = self.registry.len(),
            triggers = self.triggers.len(),
            "catalog built"
        );

        Ok(Arc::new(Catalog {
            registry: self.registry,
            triggers: self.triggers,
            by_name,
            graph,
        }))
    }
}

/// Immutable, validated application definition.
#[derive(Debug)]
pub struct Catalog {
    registry: RelationRegistry,
    triggers: Vec<Trigger>,
    by_name: HashMap<String, usize>,
    graph: TriggerGraph,
}

impl Catalog {
    /// Starts a new definition.
    #[must_use]
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::new()
    }

    /// Relation by name.
    #[must_use]
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.registry.relation(name)
    }

    pub(crate) fn require_relation(&self, name: &str) -> Result<&Relation, RegistrationError> {
        self.relation(name).ok_or_else(|| RegistrationError::UnknownRelation {
            relation: name.to_string(),
        })
    }

    /// Relations in registration order, including tick relations and the
    /// execution log.
    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.registry.relations()
    }

    /// Trigger by name.
    #[must_use]
    pub fn trigger(&self, name: &str) -> Option<&Trigger> {
        self.by_name.get(name).map(|&i| &self.triggers[i])
    }

    pub(crate) fn require_trigger(&self, name: &str) -> Result<&Trigger, RegistrationError> {
        self.trigger(name).ok_or_else(|| RegistrationError::UnknownTrigger {
            trigger: name.to_string(),
        })
    }

    /// Triggers in registration order.
    pub fn triggers(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.iter()
    }

    /// Triggers subscribed to `relation`, in registration order.
    pub fn triggers_for<'a>(&'a self, relation: &str) -> impl Iterator<Item = &'a Trigger> + 'a {
        self.registry
            .triggers_for(relation)
            .iter()
            .filter_map(move |name| self.trigger(name))
    }

    /// Relations with at least one subscriber.
    pub fn watched_relations(&self) -> impl Iterator<Item = &str> {
        self.relations()
            .map(|r| r.name.as_str())
            .filter(move |r| !self.registry.triggers_for(r).is_empty())
    }

    /// Triggers fired by a cron schedule.
    pub fn scheduled_triggers(&self) -> impl Iterator<Item = &Trigger> {
        self.triggers.iter().filter(|t| t.schedule().is_some())
    }

    /// Trigger graph checked at build time.
    #[must_use]
    pub fn graph(&self) -> &TriggerGraph {
        &self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TributaryError;
    use crate::execution::EXECUTION_LOG;
    use crate::trigger::{TriggerError, TriggerInput, TriggerOutput};

    fn noop(_: &TriggerInput<'_>) -> Result<TriggerOutput, TriggerError> {
        Ok(TriggerOutput::none())
    }

    fn rel(name: &str) -> Relation {
        Relation::new(name, Schema::new().field("n", FieldType::Int))
    }

    #[test]
    fn test_build_word_count_catalog() {
        let mut builder = CatalogBuilder::new();
        builder
            .relation(Relation::new("raw", Schema::new().field("text", FieldType::String)))
            .unwrap()
            .relation(rel("counts"))
            .unwrap()
            .trigger(Trigger::on("wordCount", "raw", noop).writes_to("counts"))
            .unwrap();
        let catalog = builder.build().unwrap();

        assert_eq!(
            catalog.triggers_for("raw").map(Trigger::name).collect::<Vec<_>>(),
            vec!["wordCount"]
        );
        assert_eq!(catalog.watched_relations().collect::<Vec<_>>(), vec!["raw"]);
        assert!(catalog.trigger("missing").is_none());
    }

    #[test]
    fn test_unknown_relations_rejected() {
        let mut builder = CatalogBuilder::new();
        builder.relation(rel("x")).unwrap();

        let err = builder.trigger(Trigger::on("t", "nope", noop)).unwrap_err();
        assert!(matches!(
            err,
            TributaryError::Registration(RegistrationError::UnknownRelation { relation }) if relation == "nope"
        ));

        let err = builder
            .trigger(Trigger::on("t", "x", noop).writes_to("missing"))
            .unwrap_err();
        assert!(err.is_registration());
    }

    #[test]
    fn test_cycle_rejected_at_build() {
        let mut builder = CatalogBuilder::new();
        builder.relation(rel("relationX")).unwrap();
        builder.relation(rel("relationY")).unwrap();
        builder
            .trigger(Trigger::on("A", "relationY", noop).writes_to("relationX"))
            .unwrap();
        builder
            .trigger(Trigger::on("B", "relationX", noop).writes_to("relationY"))
            .unwrap();
        let err = builder.build().unwrap_err();
        assert!(matches!(
            err,
            TributaryError::Registration(RegistrationError::CycleDetected { ref cycle }) if cycle.len() == 3
        ));
    }

    #[test]
    fn test_duplicate_trigger_and_bad_partition_field() {
        let mut builder = CatalogBuilder::new();
        builder.relation(rel("x")).unwrap();
        builder.trigger(Trigger::on("t", "x", noop)).unwrap();
        assert!(builder.trigger(Trigger::on("t", "x", noop)).is_err());

        let err = builder
            .trigger(Trigger::on("u", "x", noop).partition_by("user"))
            .unwrap_err();
        assert!(matches!(
            err,
            TributaryError::Registration(RegistrationError::InvalidKeyField { .. })
        ));

        let err = builder
            .trigger(Trigger::on("v", "x", noop).max_attempts(0))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_scheduled_trigger_creates_tick_relation() {
        let mut builder = CatalogBuilder::new();
        builder
            .trigger(Trigger::scheduled("nightly", "0 0 0 * * *", noop))
            .unwrap();
        assert!(builder
            .trigger(Trigger::scheduled("broken", "not a cron", noop))
            .is_err());

        let catalog = builder.build().unwrap();
        let tick = catalog.relation("__tick_nightly").unwrap();
        assert_eq!(tick.schema.names().collect::<Vec<_>>(), vec![TICK_FIELD]);
        assert_eq!(catalog.scheduled_triggers().count(), 1);
    }

    #[test]
    fn test_remove_trigger_and_relation() {
        let mut builder = CatalogBuilder::new();
        builder.relation(rel("x")).unwrap();
        builder.relation(rel("y")).unwrap();
        builder.trigger(Trigger::on("t", "x", noop).writes_to("y")).unwrap();

        assert!(builder.remove_relation("y").is_err());
        assert!(builder.remove_relation("x").is_err());
        builder.remove_trigger("t").unwrap();
        builder.remove_relation("y").unwrap();
        assert!(builder.remove_trigger("t").is_err());

        let catalog = builder.build().unwrap();
        assert_eq!(catalog.relations().count(), 2);
        assert!(catalog.relation(EXECUTION_LOG).is_some());
    }

    #[test]
    fn test_writing_tick_relation_is_reserved() {
        let mut builder = CatalogBuilder::new();
        builder.relation(rel("x")).unwrap();
        builder
            .trigger(Trigger::scheduled("tick", "* * * * * *", noop))
            .unwrap();
        let err = builder
            .trigger(Trigger::on("t", "x", noop).writes_to("__tick_tick"))
            .unwrap_err();
        assert!(matches!(
            err,
            TributaryError::Registration(RegistrationError::ReservedName { .. })
        ));
    }

    #[test]
    fn test_execution_log_cannot_feed_a_trigger() {
        let mut builder = CatalogBuilder::new();
        let err = builder
            .trigger(Trigger::on("audit", EXECUTION_LOG, noop))
            .unwrap_err();
        assert!(matches!(
            err,
            TributaryError::Registration(RegistrationError::ReservedName { .. })
        ));
    }
}
