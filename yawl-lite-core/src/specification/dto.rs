use super::{Flow, MultiInstanceParams, Specification, SpecificationBuilder, Task};
use crate::error::EngineResult;
use crate::types::{JoinType, SplitType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ── Helpers for serde ──

fn is_false(v: &bool) -> bool {
    !v
}

// ── Top-level DTO ──

/// Serde-friendly form of a specification. Byte formats (YAML, JSON, XML
/// translations) deserialize into this and go through
/// [`Specification::from_dto`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecificationDto {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub elements: Vec<ElementDto>,
    pub flows: Vec<FlowDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ElementDto {
    InputCondition {
        id: String,
    },
    OutputCondition {
        id: String,
    },
    Condition {
        id: String,
    },
    Task {
        id: String,
        #[serde(default)]
        join: JoinType,
        #[serde(default)]
        split: SplitType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        multi_instance: Option<MultiInstanceParams>,
        #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
        cancels: BTreeSet<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        automatic: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDto {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_default: bool,
}

impl Specification {
    /// Validate and build a specification from its DTO.
    pub fn from_dto(dto: &SpecificationDto) -> EngineResult<Self> {
        let mut builder = SpecificationBuilder::new(dto.id.clone());
        if let Some(name) = &dto.name {
            builder = builder.name(name.clone());
        }
        for element in &dto.elements {
            builder = match element {
                ElementDto::InputCondition { id } => builder.input_condition(id.clone()),
                ElementDto::OutputCondition { id } => builder.output_condition(id.clone()),
                ElementDto::Condition { id } => builder.condition(id.clone()),
                ElementDto::Task {
                    id,
                    join,
                    split,
                    multi_instance,
                    cancels,
                    automatic,
                } => {
                    let mut task = Task::new(id.clone())
                        .join(*join)
                        .split(*split)
                        .cancels(cancels.iter().cloned());
                    task.multi_instance = multi_instance.clone();
                    task.automatic = *automatic;
                    builder.task(task)
                }
            };
        }
        for flow in &dto.flows {
            let mut f = Flow::new(flow.from.clone(), flow.to.clone());
            f.predicate = flow.predicate.clone();
            f.is_default = flow.is_default;
            builder = builder.flow(f);
        }
        builder.build()
    }
}

/// Seam for concrete specification formats. Implementations turn raw bytes
/// into a validated [`Specification`], failing with `InvalidSpecification`.
pub trait SpecificationLoader: Send + Sync {
    fn load(&self, bytes: &[u8]) -> EngineResult<Specification>;
}
