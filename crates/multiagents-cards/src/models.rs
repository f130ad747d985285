use serde::{Deserialize, Serialize};
use std::fmt;

/// Kanban phases a card flows through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardStatus {
    Backlog,
    Coordinating,
    Planning,
    Reviewing,
    Implementing,
    Done,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Backlog => "backlog",
            CardStatus::Coordinating => "coordinating",
            CardStatus::Planning => "planning",
            CardStatus::Reviewing => "reviewing",
            CardStatus::Implementing => "implementing",
            CardStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backlog" => Some(CardStatus::Backlog),
            "coordinating" => Some(CardStatus::Coordinating),
            "planning" => Some(CardStatus::Planning),
            "reviewing" => Some(CardStatus::Reviewing),
            "implementing" => Some(CardStatus::Implementing),
            "done" => Some(CardStatus::Done),
            _ => None,
        }
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which decision the coordinator is being asked to make.
///
/// A card in `coordinating` always carries a stage; the type system rules
/// out the "coordinating with no stage" state entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationStage {
    Initial,
    PlanDecision,
    ImplDecision,
}

impl CoordinationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinationStage::Initial => "initial",
            CoordinationStage::PlanDecision => "plan_decision",
            CoordinationStage::ImplDecision => "impl_decision",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(CoordinationStage::Initial),
            "plan_decision" => Some(CoordinationStage::PlanDecision),
            "impl_decision" => Some(CoordinationStage::ImplDecision),
            _ => None,
        }
    }
}

/// A single phase-transition record in a card's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardPhaseEntry {
    pub phase: CardStatus,
    pub agent: String,
    pub content: String,
    pub timestamp: String,
}

/// A Kanban task card that moves through discussion phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: CardStatus,
    pub planner: String,
    pub implementer: String,
    pub reviewer: String,
    pub coordinator: String,
    pub coordination_stage: Option<CoordinationStage>,
    pub previous_phase: Option<CardStatus>,
    #[serde(default)]
    pub history: Vec<CardPhaseEntry>,
    #[serde(default)]
    pub created_at: String,
}

impl Card {
    /// Serialize for JSON/WebSocket transport, with the stage flattened to
    /// the wire's string form ("" when absent).
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "title": self.title,
            "description": self.description,
            "status": self.status.as_str(),
            "planner": self.planner,
            "implementer": self.implementer,
            "reviewer": self.reviewer,
            "coordinator": self.coordinator,
            "coordination_stage": self.coordination_stage.map(|s| s.as_str()).unwrap_or(""),
            "previous_phase": self.previous_phase.map(|p| p.as_str()),
            "history": self.history.iter().map(|entry| serde_json::json!({
                "phase": entry.phase.as_str(),
                "agent": entry.agent,
                "content": entry.content,
                "timestamp": entry.timestamp,
            })).collect::<Vec<_>>(),
            "created_at": self.created_at,
        })
    }
}
