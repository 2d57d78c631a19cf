//! Knowledge-graph mutation queue and its aggregation into one snapshot.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::QueueRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(
        rename = "entityType",
        alias = "entity_type",
        alias = "type",
        default
    )]
    pub entity_type: String,
    #[serde(default)]
    pub observations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub from: String,
    pub to: String,
    #[serde(rename = "relationType", alias = "relation_type", alias = "type")]
    pub relation_type: String,
}

impl Relation {
    /// Identity is the ordered (from, type, to) triple.
    fn key(&self) -> (&str, &str, &str) {
        (&self.from, &self.relation_type, &self.to)
    }
}

/// Observations contributed to one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationBundle {
    #[serde(rename = "entityName", alias = "entity_name", alias = "entity")]
    pub entity_name: String,
    #[serde(default)]
    pub contents: Vec<String>,
}

/// Payload of one queued event, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum GraphMutation {
    CreateEntities { entities: Vec<Entity> },
    CreateRelations { relations: Vec<Relation> },
    AddObservations { observations: Vec<ObservationBundle> },
}

/// One line of the graph queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEvent {
    #[serde(flatten)]
    pub mutation: GraphMutation,
    /// Carried through unchanged; aggregation relies on line order, not this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

impl GraphEvent {
    pub fn now(mutation: GraphMutation) -> Self {
        Self {
            mutation,
            timestamp: Some(Value::String(chrono::Utc::now().to_rfc3339())),
        }
    }
}

impl QueueRecord for GraphEvent {
    const KIND: &'static str = "graph";
}

/// Read the graph queue at `path`.
pub fn read_queue(path: &Path) -> Result<Vec<GraphEvent>> {
    super::read_lines(path)
}

/// Deduplicated fold of a graph queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphSnapshot {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
    pub observations: Vec<ObservationBundle>,
}

impl GraphSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty() && self.observations.is_empty()
    }
}

/// Fold events in arrival order.
///
/// The first entity seen under a name wins and later ones are dropped whole.
/// Relations are unique by (from, type, to). Observation contributions are
/// concatenated per entity, bundles ordered by first contribution.
pub fn aggregate(events: &[GraphEvent]) -> GraphSnapshot {
    let mut snapshot = GraphSnapshot::default();
    let mut seen_entities: HashSet<&str> = HashSet::new();
    let mut seen_relations: HashSet<(&str, &str, &str)> = HashSet::new();
    let mut bundle_index: HashMap<&str, usize> = HashMap::new();

    for event in events {
        match &event.mutation {
            GraphMutation::CreateEntities { entities } => {
                for entity in entities {
                    if seen_entities.insert(entity.name.as_str()) {
                        snapshot.entities.push(entity.clone());
                    }
                }
            }
            GraphMutation::CreateRelations { relations } => {
                for relation in relations {
                    if seen_relations.insert(relation.key()) {
                        snapshot.relations.push(relation.clone());
                    }
                }
            }
            GraphMutation::AddObservations { observations } => {
                for bundle in observations {
                    let name = bundle.entity_name.as_str();
                    if let Some(&idx) = bundle_index.get(name) {
                        snapshot.observations[idx]
                            .contents
                            .extend(bundle.contents.iter().cloned());
                    } else {
                        bundle_index.insert(name, snapshot.observations.len());
                        snapshot.observations.push(bundle.clone());
                    }
                }
            }
        }
    }

    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn entity(name: &str, entity_type: &str) -> Entity {
        Entity {
            name: name.into(),
            entity_type: entity_type.into(),
            observations: vec![],
        }
    }

    fn relation(from: &str, relation_type: &str, to: &str) -> Relation {
        Relation {
            from: from.into(),
            to: to.into(),
            relation_type: relation_type.into(),
        }
    }

    fn event(mutation: GraphMutation) -> GraphEvent {
        GraphEvent {
            mutation,
            timestamp: None,
        }
    }

    fn add_obs(name: &str, contents: &[&str]) -> GraphEvent {
        event(GraphMutation::AddObservations {
            observations: vec![ObservationBundle {
                entity_name: name.into(),
                contents: contents.iter().map(|c| (*c).to_string()).collect(),
            }],
        })
    }

    #[test]
    fn first_entity_by_name_wins() {
        let mut a_prime = entity("A", "library");
        a_prime.observations.push("ignored".into());
        let events = vec![
            event(GraphMutation::CreateEntities {
                entities: vec![entity("A", "service"), entity("B", "database")],
            }),
            event(GraphMutation::CreateEntities {
                entities: vec![a_prime],
            }),
        ];

        let snapshot = aggregate(&events);
        assert_eq!(snapshot.entities, vec![entity("A", "service"), entity("B", "database")]);
        assert!(snapshot.observations.is_empty());
    }

    #[test]
    fn relations_dedupe_by_triple() {
        let events = vec![event(GraphMutation::CreateRelations {
            relations: vec![
                relation("X", "R", "Y"),
                relation("X", "R", "Y"),
                relation("X", "R2", "Y"),
            ],
        })];

        let snapshot = aggregate(&events);
        assert_eq!(
            snapshot.relations,
            vec![relation("X", "R", "Y"), relation("X", "R2", "Y")]
        );
    }

    #[test]
    fn relation_direction_matters() {
        let events = vec![event(GraphMutation::CreateRelations {
            relations: vec![relation("X", "R", "Y"), relation("Y", "R", "X")],
        })];
        assert_eq!(aggregate(&events).relations.len(), 2);
    }

    #[test]
    fn observations_accumulate_in_order() {
        let events = vec![
            add_obs("PG", &["c1", "c2"]),
            add_obs("Redis", &["r1"]),
            add_obs("PG", &["c3"]),
        ];

        let snapshot = aggregate(&events);
        assert_eq!(snapshot.observations.len(), 2);
        assert_eq!(snapshot.observations[0].entity_name, "PG");
        assert_eq!(snapshot.observations[0].contents, vec!["c1", "c2", "c3"]);
        assert_eq!(snapshot.observations[1].entity_name, "Redis");
    }

    #[test]
    fn aggregation_is_deterministic() {
        let events = vec![
            event(GraphMutation::CreateEntities {
                entities: vec![entity("A", "t"), entity("B", "t")],
            }),
            add_obs("A", &["x"]),
            event(GraphMutation::CreateRelations {
                relations: vec![relation("A", "USES", "B")],
            }),
        ];
        assert_eq!(aggregate(&events), aggregate(&events));
    }

    #[test]
    fn parses_queue_line_formats() {
        let line = r#"{"type":"create_relations","payload":{"relations":[{"from":"PG","to":"Redis","relationType":"USES"}]},"timestamp":"2026-01-01T00:00:00Z"}"#;
        let parsed: GraphEvent = serde_json::from_str(line).unwrap();
        assert_eq!(
            parsed.mutation,
            GraphMutation::CreateRelations {
                relations: vec![relation("PG", "USES", "Redis")],
            }
        );

        let short = r#"{"type":"add_observations","payload":{"observations":[{"entity":"PG","contents":["fast"]}]}}"#;
        let parsed: GraphEvent = serde_json::from_str(short).unwrap();
        assert_eq!(parsed, add_obs("PG", &["fast"]));
    }

    #[test]
    fn serialized_event_reads_back() {
        let original = GraphEvent::now(GraphMutation::CreateEntities {
            entities: vec![entity("PG", "database")],
        });
        let line = serde_json::to_string(&original).unwrap();
        assert!(line.contains(r#""type":"create_entities""#));
        assert!(line.contains(r#""entityType":"database""#));
        let back: GraphEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn unknown_event_type_is_skipped_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph-queue.jsonl");
        let valid1 = r#"{"type":"create_entities","payload":{"entities":[{"name":"A","entityType":"t"}]}}"#;
        let valid2 = r#"{"type":"create_entities","payload":{"entities":[{"name":"B","entityType":"t"}]}}"#;
        fs::write(
            &path,
            format!("{valid1}\n{{{{bad\n\n{{\"type\":\"delete_entities\",\"payload\":{{}}}}\n{valid2}\n"),
        )
        .unwrap();

        let events = read_queue(&path).unwrap();
        assert_eq!(events.len(), 2);
        let names: Vec<_> = aggregate(&events).entities.into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn end_to_end_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph-queue.jsonl");
        let lines = [
            r#"{"type":"create_entities","payload":{"entities":[{"name":"PG","entityType":"database"},{"name":"Redis","entityType":"cache"}]}}"#,
            r#"{"type":"create_relations","payload":{"relations":[{"from":"PG","to":"Redis","relationType":"USES"}]}}"#,
            r#"{"type":"add_observations","payload":{"observations":[{"entityName":"PG","contents":["fast"]}]}}"#,
        ];
        fs::write(&path, lines.join("\n")).unwrap();

        let snapshot = aggregate(&read_queue(&path).unwrap());
        assert_eq!(snapshot.entities.len(), 2);
        assert_eq!(snapshot.relations, vec![relation("PG", "USES", "Redis")]);
        assert_eq!(
            snapshot.observations,
            vec![ObservationBundle {
                entity_name: "PG".into(),
                contents: vec!["fast".into()],
            }]
        );
    }
}
