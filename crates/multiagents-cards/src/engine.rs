//! Card lifecycle management and prompt generation for each phase.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use uuid::Uuid;

use crate::error::{CardError, Result};
use crate::models::{Card, CardPhaseEntry, CardStatus, CoordinationStage};

static DONE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\[DONE\]").unwrap());

/// True if the text contains a [DONE] marker (case-insensitive). Unlike
/// pass detection this is a containment check: agents surround the marker
/// with their actual plan/review text.
pub fn detect_done(text: &str) -> bool {
    DONE_RE.is_match(text)
}

static ROLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(coordinator|planner|implementer|reviewer)\s*:\s*@(\w+)").unwrap()
});

/// Extract role -> agent mappings like `Planner: @Claude`.
/// Both keys and agent names come back lower-cased.
fn parse_roles(text: &str) -> HashMap<String, String> {
    ROLE_RE
        .captures_iter(text)
        .map(|c| (c[1].to_lowercase(), c[2].to_lowercase()))
        .collect()
}

/// Manages the card lifecycle and generates prompts for each phase.
pub struct CardEngine {
    agents: Vec<String>,
    cards: HashMap<String, Card>,
}

impl CardEngine {
    pub fn new(agents: Vec<String>) -> Self {
        Self {
            agents: agents.into_iter().map(|a| a.to_lowercase()).collect(),
            cards: HashMap::new(),
        }
    }

    // -- CRUD ----------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn create_card(
        &mut self,
        title: &str,
        description: &str,
        planner: &str,
        implementer: &str,
        reviewer: &str,
        coordinator: &str,
    ) -> Card {
        let card = Card {
            id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            title: title.to_string(),
            description: description.to_string(),
            status: CardStatus::Backlog,
            planner: planner.to_lowercase(),
            implementer: implementer.to_lowercase(),
            reviewer: reviewer.to_lowercase(),
            coordinator: coordinator.to_lowercase(),
            coordination_stage: None,
            previous_phase: None,
            history: Vec::new(),
            created_at: Utc::now().to_rfc3339(),
        };
        self.cards.insert(card.id.clone(), card.clone());
        card
    }

    /// Apply field updates from a loose (field name, JSON value) map.
    pub fn update_card(
        &mut self,
        card_id: &str,
        fields: &HashMap<String, serde_json::Value>,
    ) -> Result<Card> {
        let card = self.get_mut(card_id)?;
        for (key, value) in fields {
            let as_str = value.as_str().unwrap_or_default();
            match key.as_str() {
                "title" => card.title = as_str.to_string(),
                "description" => card.description = as_str.to_string(),
                "planner" => card.planner = as_str.to_lowercase(),
                "implementer" => card.implementer = as_str.to_lowercase(),
                "reviewer" => card.reviewer = as_str.to_lowercase(),
                "coordinator" => card.coordinator = as_str.to_lowercase(),
                "status" => {
                    card.status = CardStatus::parse(as_str)
                        .ok_or_else(|| CardError::UnknownField(format!("status={as_str}")))?;
                }
                "previous_phase" => {
                    card.previous_phase = if as_str.is_empty() {
                        None
                    } else {
                        Some(
                            CardStatus::parse(as_str).ok_or_else(|| {
                                CardError::UnknownField(format!("previous_phase={as_str}"))
                            })?,
                        )
                    };
                }
                "coordination_stage" => {
                    card.coordination_stage = CoordinationStage::parse(as_str);
                }
                other => return Err(CardError::UnknownField(other.to_string())),
            }
        }
        Ok(card.clone())
    }

    pub fn delete_card(&mut self, card_id: &str) -> Result<()> {
        self.cards
            .remove(card_id)
            .map(|_| ())
            .ok_or_else(|| CardError::NotFound {
                id: card_id.to_string(),
            })
    }

    pub fn get_card(&self, card_id: &str) -> Result<Card> {
        self.cards
            .get(card_id)
            .cloned()
            .ok_or_else(|| CardError::NotFound {
                id: card_id.to_string(),
            })
    }

    pub fn get_cards(&self) -> Vec<Card> {
        let mut cards: Vec<Card> = self.cards.values().cloned().collect();
        cards.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        cards
    }

    /// Populate the engine from persisted cards.
    pub fn load_cards(&mut self, cards: Vec<Card>) {
        for card in cards {
            self.cards.insert(card.id.clone(), card);
        }
    }

    pub fn cards_for_agent(&self, agent_name: &str) -> Vec<Card> {
        let name = agent_name.to_lowercase();
        self.cards
            .values()
            .filter(|c| {
                [&c.planner, &c.implementer, &c.reviewer, &c.coordinator]
                    .into_iter()
                    .any(|role| *role == name)
            })
            .cloned()
            .collect()
    }

    // -- Lifecycle -----------------------------------------------------------

    /// backlog -> planning, or coordinating(initial) when a coordinator is
    /// assigned. Returns the card and the first phase prompt.
    pub fn start_card(&mut self, card_id: &str) -> Result<(Card, String)> {
        let card = self.get_mut(card_id)?;
        if card.status != CardStatus::Backlog {
            return Err(CardError::InvalidTransition {
                operation: "start",
                status: card.status,
                expected: "backlog",
            });
        }
        if !card.coordinator.is_empty() {
            card.status = CardStatus::Coordinating;
            card.coordination_stage = Some(CoordinationStage::Initial);
            card.previous_phase = None;
            let card = card.clone();
            let prompt = build_coordinating_prompt(&card);
            return Ok((card, prompt));
        }
        card.status = CardStatus::Planning;
        card.previous_phase = None;
        let card = card.clone();
        let prompt = self.build_planning_prompt(&card);
        Ok((card, prompt))
    }

    /// Advance the card when a phase round ends.
    ///
    /// The agent's output is appended to history first, then the transition
    /// table runs:
    /// - work phases (planning/implementing) + [DONE] -> reviewing;
    /// - reviewing routes to the coordinator when one is set, otherwise
    ///   [DONE] promotes (plan -> implementing, impl -> wait for user) and
    ///   anything else rejects back to the previous phase;
    /// - coordinating stages resolve to the next phase or a rejection.
    ///
    /// Returns the card and the prompt for the next phase, if any.
    pub fn on_agent_completed(
        &mut self,
        card_id: &str,
        agent: &str,
        content: &str,
    ) -> Result<(Card, Option<String>)> {
        let entry = CardPhaseEntry {
            phase: self.get_card(card_id)?.status,
            agent: agent.to_lowercase(),
            content: content.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        };
        let card = self.get_mut(card_id)?;
        card.history.push(entry);

        let done = detect_done(content);

        if card.status == CardStatus::Coordinating {
            match card.coordination_stage {
                Some(CoordinationStage::Initial) => {
                    if done {
                        // The coordinator may (re)assign roles inline.
                        for (role, assignee) in parse_roles(content) {
                            match role.as_str() {
                                "coordinator" => card.coordinator = assignee,
                                "planner" => card.planner = assignee,
                                "implementer" => card.implementer = assignee,
                                "reviewer" => card.reviewer = assignee,
                                _ => {}
                            }
                        }
                        card.status = CardStatus::Planning;
                        card.coordination_stage = None;
                        let card = card.clone();
                        let prompt = self.build_planning_prompt(&card);
                        return Ok((card, Some(prompt)));
                    }
                    return Ok((card.clone(), None));
                }
                Some(CoordinationStage::PlanDecision) => {
                    if done {
                        card.status = CardStatus::Implementing;
                        card.coordination_stage = None;
                        let card = card.clone();
                        let prompt = self.build_implementation_prompt(&card);
                        return Ok((card, Some(prompt)));
                    }
                    card.status = CardStatus::Planning;
                    card.coordination_stage = None;
                    let card = card.clone();
                    let prompt = self.build_rejection_prompt(&card, content);
                    return Ok((card, Some(prompt)));
                }
                Some(CoordinationStage::ImplDecision) => {
                    if done {
                        card.status = CardStatus::Done;
                        card.coordination_stage = None;
                        return Ok((card.clone(), None));
                    }
                    card.status = CardStatus::Implementing;
                    card.coordination_stage = None;
                    let card = card.clone();
                    let prompt = self.build_rejection_prompt(&card, content);
                    return Ok((card, Some(prompt)));
                }
                None => return Ok((card.clone(), None)),
            }
        }

        if matches!(card.status, CardStatus::Planning | CardStatus::Implementing) {
            if done {
                card.previous_phase = Some(card.status);
                card.status = CardStatus::Reviewing;
                let card = card.clone();
                let prompt = self.build_review_prompt(&card, content);
                return Ok((card, Some(prompt)));
            }
            return Ok((card.clone(), None));
        }

        if card.status == CardStatus::Reviewing {
            if !card.coordinator.is_empty() {
                // All reviewer output routes to the coordinator for decision.
                let stage = if card.previous_phase == Some(CardStatus::Planning) {
                    CoordinationStage::PlanDecision
                } else {
                    CoordinationStage::ImplDecision
                };
                card.status = CardStatus::Coordinating;
                card.coordination_stage = Some(stage);
                let card = card.clone();
                let prompt = self.build_coordination_decision_prompt(&card, content);
                return Ok((card, Some(prompt)));
            }
            if done {
                if card.previous_phase == Some(CardStatus::Planning) {
                    card.status = CardStatus::Implementing;
                    let card = card.clone();
                    let prompt = self.build_implementation_prompt(&card);
                    return Ok((card, Some(prompt)));
                }
                // After implementation the user decides when to mark done.
                return Ok((card.clone(), None));
            }
            let previous = card.previous_phase.unwrap_or(CardStatus::Planning);
            card.status = previous;
            card.previous_phase = None;
            let card = card.clone();
            let prompt = self.build_rejection_prompt(&card, content);
            return Ok((card, Some(prompt)));
        }

        Ok((card.clone(), None))
    }

    /// User-triggered: reviewing -> done.
    pub fn mark_done(&mut self, card_id: &str) -> Result<Card> {
        let card = self.get_mut(card_id)?;
        if card.status != CardStatus::Reviewing {
            return Err(CardError::InvalidTransition {
                operation: "mark done",
                status: card.status,
                expected: "reviewing",
            });
        }
        card.status = CardStatus::Done;
        Ok(card.clone())
    }

    // -- Delegation ----------------------------------------------------------

    pub fn build_delegation_prompt(&self, card_id: &str) -> Result<String> {
        let card = self.get_card(card_id)?;
        Ok(format!(
            "A new task needs role assignments: \"{}\"\n\n\
Description: {}\n\n\
Available agents: {}\n\n\
Which of you should be the coordinator (tech lead), planner, implementer, and reviewer? \
Discuss and use @AgentName tags to assign roles. \
Coordinator is optional but recommended for complex tasks. \
Example: \"Coordinator: @Claude, Planner: @Claude, Implementer: @Codex, Reviewer: @Kimi\"",
            card.title,
            card.description,
            self.agents.join(", ")
        ))
    }

    /// Parse role claims from delegation-round responses. Returns the
    /// updated card only when planner, implementer, and reviewer all landed.
    pub fn parse_delegation_response(
        &mut self,
        card_id: &str,
        agent_responses: &HashMap<String, String>,
    ) -> Result<Option<Card>> {
        let combined = agent_responses.values().cloned().collect::<Vec<_>>().join("\n");
        let roles = parse_roles(&combined);
        let card = self.get_mut(card_id)?;

        if ["planner", "implementer", "reviewer"]
            .iter()
            .all(|role| roles.contains_key(*role))
        {
            card.planner = roles["planner"].clone();
            card.implementer = roles["implementer"].clone();
            card.reviewer = roles["reviewer"].clone();
            if let Some(coordinator) = roles.get("coordinator") {
                card.coordinator = coordinator.clone();
            }
            return Ok(Some(card.clone()));
        }
        Ok(None)
    }

    // -- Internal helpers ----------------------------------------------------

    fn get_mut(&mut self, card_id: &str) -> Result<&mut Card> {
        self.cards.get_mut(card_id).ok_or_else(|| CardError::NotFound {
            id: card_id.to_string(),
        })
    }

    /// Content of the most recent history entry for a phase.
    fn latest_output(card: &Card, phase: CardStatus) -> Option<&str> {
        card.history
            .iter()
            .rev()
            .find(|entry| entry.phase == phase)
            .map(|entry| entry.content.as_str())
    }

    // -- Prompt builders -----------------------------------------------------

    fn build_coordination_decision_prompt(&self, card: &Card, review_content: &str) -> String {
        if card.coordination_stage == Some(CoordinationStage::PlanDecision) {
            let worker_output = Self::latest_output(card, CardStatus::Planning).unwrap_or("");
            return format!(
                "[TASK:{}] @{} As COORDINATOR for \"{}\", review the plan and feedback.\n\n\
Planner ({}) produced:\n{}\n\n\
Reviewer ({}) feedback:\n{}\n\n\
As tech lead, decide: approve with [DONE] to proceed to implementation, \
or provide your feedback to send the plan back for revision.",
                card.id, card.coordinator, card.title, card.planner, worker_output,
                card.reviewer, review_content
            );
        }
        let worker_output = Self::latest_output(card, CardStatus::Implementing).unwrap_or("");
        format!(
            "[TASK:{}] @{} As COORDINATOR for \"{}\", review the implementation and feedback.\n\n\
Implementer ({}) produced:\n{}\n\n\
Reviewer ({}) feedback:\n{}\n\n\
As tech lead, decide: approve with [DONE] to mark the task complete, \
or provide your feedback to send it back for revision.",
            card.id, card.coordinator, card.title, card.implementer, worker_output,
            card.reviewer, review_content
        )
    }

    fn build_planning_prompt(&self, card: &Card) -> String {
        let coordinator_block = if !card.coordinator.is_empty() {
            match Self::latest_output(card, CardStatus::Coordinating) {
                Some(approach) => format!(
                    "\n\nCOORDINATOR DIRECTION (from @{} — you MUST follow this approach):\n{}\n",
                    card.coordinator, approach
                ),
                None => String::new(),
            }
        } else {
            String::new()
        };
        let alignment = if !card.coordinator.is_empty() {
            format!(
                "Your plan MUST align with the coordinator's direction above. \
If you disagree, explain why — but do not deviate without @{}'s approval.\n",
                card.coordinator
            )
        } else {
            String::new()
        };
        format!(
            "[TASK:{}] @{} You are the PLANNER for \"{}\".\n\n{}\n{}\n\
Plan the implementation: break it into steps, identify risks, and define acceptance criteria.\n\
{}Use [DONE] when your plan is complete.",
            card.id, card.planner, card.title, card.description, coordinator_block, alignment
        )
    }

    fn build_review_prompt(&self, card: &Card, content: &str) -> String {
        if card.previous_phase == Some(CardStatus::Planning) {
            return format!(
                "[TASK:{}] @{} You are the REVIEWER for \"{}\".\n\n\
The planner ({}) produced this plan:\n\n{}\n\n\
Review it. If the plan is solid, respond with [DONE]. \
Otherwise, provide specific feedback on what needs to change.",
                card.id, card.reviewer, card.title, card.planner, content
            );
        }
        let plan = Self::latest_output(card, CardStatus::Planning).unwrap_or("");
        format!(
            "[TASK:{}] @{} You are the REVIEWER for \"{}\".\n\n\
The implementer ({}) produced:\n\n{}\n\n\
Original plan:\n{}\n\n\
Review the implementation against the plan. \
If it meets acceptance criteria, respond with [DONE]. \
Otherwise, provide specific feedback.",
            card.id, card.reviewer, card.title, card.implementer, content, plan
        )
    }

    fn build_implementation_prompt(&self, card: &Card) -> String {
        let plan = Self::latest_output(card, CardStatus::Planning).unwrap_or("");
        let feedback_block = match Self::latest_output(card, CardStatus::Reviewing) {
            Some(feedback) => format!("\nPrevious reviewer feedback:\n{feedback}\n"),
            None => String::new(),
        };
        let coordinator_block = if !card.coordinator.is_empty() {
            match Self::latest_output(card, CardStatus::Coordinating) {
                Some(approach) => format!(
                    "\nCOORDINATOR DIRECTION (from @{} — you MUST follow this approach):\n{}\n",
                    card.coordinator, approach
                ),
                None => String::new(),
            }
        } else {
            String::new()
        };
        let direction = if card.coordinator.is_empty() {
            ""
        } else {
            " and the coordinator's direction"
        };
        format!(
            "[TASK:{}] @{} You are the IMPLEMENTER for \"{}\".\n\n\
Here is the approved plan:\n{}\n{}{}\n\
Implement according to the plan{}. Use [DONE] when implementation is complete.",
            card.id, card.implementer, card.title, plan, coordinator_block, feedback_block,
            direction
        )
    }

    fn build_rejection_prompt(&self, card: &Card, feedback: &str) -> String {
        let (agent, previous_output) = if card.status == CardStatus::Planning {
            (
                card.planner.as_str(),
                Self::latest_output(card, CardStatus::Planning).unwrap_or(""),
            )
        } else {
            (
                card.implementer.as_str(),
                Self::latest_output(card, CardStatus::Implementing).unwrap_or(""),
            )
        };
        let source = if card.coordinator.is_empty() {
            "reviewer"
        } else {
            "coordinator"
        };
        format!(
            "[TASK:{}] @{} The {} sent back your work on \"{}\" with feedback:\n\n{}\n\n\
Previous output:\n{}\n\n\
Address the feedback. Use [DONE] when ready for re-review.",
            card.id, agent, source, card.title, feedback, previous_output
        )
    }
}

fn build_coordinating_prompt(card: &Card) -> String {
    let roles_block = ["planner", "implementer", "reviewer"]
        .iter()
        .map(|role| {
            let assignee = match *role {
                "planner" => &card.planner,
                "implementer" => &card.implementer,
                _ => &card.reviewer,
            };
            let shown = if assignee.is_empty() { "unassigned" } else { assignee };
            format!("  {role}: {shown}")
        })
        .collect::<Vec<_>>()
        .join("\n");
    let assign_hint =
        if card.planner.is_empty() || card.implementer.is_empty() || card.reviewer.is_empty() {
            "\n\nSome roles are unassigned. Assign them using \
\"Planner: @Agent, Implementer: @Agent, Reviewer: @Agent\" syntax."
        } else {
            ""
        };
    format!(
        "[TASK:{}] @{} You are the COORDINATOR (tech lead) for \"{}\".\n\n{}\n\n\
Current role assignments:\n{}\n{}\n\n\
Set the technical direction and approach for this task. \
Outline the high-level strategy the planner should follow.\n\
Use [DONE] when your direction is set and you're ready for planning to begin.",
        card.id, card.coordinator, card.title, card.description, roles_block, assign_hint
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CardEngine {
        CardEngine::new(vec!["claude".into(), "codex".into(), "kimi".into()])
    }

    fn simple_card(engine: &mut CardEngine) -> Card {
        engine.create_card("Ship parser", "Build it", "claude", "codex", "kimi", "")
    }

    #[test]
    fn done_detection_is_containment_and_case_insensitive() {
        assert!(detect_done("plan ready [DONE]"));
        assert!(detect_done("[done]"));
        assert!(!detect_done("not finished"));
    }

    #[test]
    fn start_card_moves_backlog_to_planning() {
        let mut engine = engine();
        let card = simple_card(&mut engine);
        let (card, prompt) = engine.start_card(&card.id).unwrap();
        assert_eq!(card.status, CardStatus::Planning);
        assert!(prompt.contains("@claude"));
        assert!(prompt.contains("PLANNER"));
        assert!(prompt.contains(&format!("[TASK:{}]", card.id)));
    }

    #[test]
    fn start_card_with_coordinator_enters_initial_stage() {
        let mut engine = engine();
        let card = engine.create_card("Big task", "d", "claude", "codex", "kimi", "claude");
        let (card, prompt) = engine.start_card(&card.id).unwrap();
        assert_eq!(card.status, CardStatus::Coordinating);
        assert_eq!(card.coordination_stage, Some(CoordinationStage::Initial));
        assert!(prompt.contains("COORDINATOR"));
    }

    #[test]
    fn start_is_only_valid_from_backlog() {
        let mut engine = engine();
        let card = simple_card(&mut engine);
        engine.start_card(&card.id).unwrap();
        assert!(matches!(
            engine.start_card(&card.id),
            Err(CardError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn planning_done_moves_to_reviewing_with_review_prompt() {
        let mut engine = engine();
        let card = simple_card(&mut engine);
        engine.start_card(&card.id).unwrap();

        let (card, prompt) = engine
            .on_agent_completed(&card.id, "claude", "the plan [DONE]")
            .unwrap();
        assert_eq!(card.status, CardStatus::Reviewing);
        assert_eq!(card.previous_phase, Some(CardStatus::Planning));
        let prompt = prompt.unwrap();
        assert!(prompt.contains("@kimi"));
        assert!(prompt.contains("the plan [DONE]"));
        assert_eq!(card.history.len(), 1);
        assert_eq!(card.history[0].phase, CardStatus::Planning);
    }

    #[test]
    fn planning_without_done_stays_put() {
        let mut engine = engine();
        let card = simple_card(&mut engine);
        engine.start_card(&card.id).unwrap();
        let (card, prompt) = engine
            .on_agent_completed(&card.id, "claude", "still thinking")
            .unwrap();
        assert_eq!(card.status, CardStatus::Planning);
        assert!(prompt.is_none());
    }

    #[test]
    fn review_done_after_planning_promotes_to_implementing() {
        let mut engine = engine();
        let card = simple_card(&mut engine);
        engine.start_card(&card.id).unwrap();
        engine
            .on_agent_completed(&card.id, "claude", "plan [DONE]")
            .unwrap();
        let (card, prompt) = engine
            .on_agent_completed(&card.id, "kimi", "looks good [DONE]")
            .unwrap();
        assert_eq!(card.status, CardStatus::Implementing);
        let prompt = prompt.unwrap();
        assert!(prompt.contains("@codex"));
        assert!(prompt.contains("IMPLEMENTER"));
        assert!(prompt.contains("plan [DONE]"));
    }

    #[test]
    fn review_rejection_returns_to_previous_phase() {
        let mut engine = engine();
        let card = simple_card(&mut engine);
        engine.start_card(&card.id).unwrap();
        engine
            .on_agent_completed(&card.id, "claude", "plan [DONE]")
            .unwrap();
        let (card, prompt) = engine
            .on_agent_completed(&card.id, "kimi", "missing error handling")
            .unwrap();
        assert_eq!(card.status, CardStatus::Planning);
        assert_eq!(card.previous_phase, None);
        let prompt = prompt.unwrap();
        assert!(prompt.contains("@claude"));
        assert!(prompt.contains("missing error handling"));
        assert!(prompt.contains("reviewer sent back"));
    }

    #[test]
    fn review_done_after_implementation_waits_for_user() {
        let mut engine = engine();
        let card = simple_card(&mut engine);
        engine.start_card(&card.id).unwrap();
        engine
            .on_agent_completed(&card.id, "claude", "plan [DONE]")
            .unwrap();
        engine
            .on_agent_completed(&card.id, "kimi", "approve [DONE]")
            .unwrap();
        engine
            .on_agent_completed(&card.id, "codex", "implemented [DONE]")
            .unwrap();
        let (card, prompt) = engine
            .on_agent_completed(&card.id, "kimi", "ship it [DONE]")
            .unwrap();
        assert_eq!(card.status, CardStatus::Reviewing);
        assert!(prompt.is_none());

        let card = engine.mark_done(&card.id).unwrap();
        assert_eq!(card.status, CardStatus::Done);
    }

    #[test]
    fn mark_done_requires_reviewing() {
        let mut engine = engine();
        let card = simple_card(&mut engine);
        assert!(matches!(
            engine.mark_done(&card.id),
            Err(CardError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn coordinator_flow_routes_reviews_through_decisions() {
        let mut engine = engine();
        let card = engine.create_card("Guided", "d", "claude", "codex", "kimi", "claude");
        engine.start_card(&card.id).unwrap();

        // Initial direction set; roles can be overridden inline.
        let (card2, prompt) = engine
            .on_agent_completed(&card.id, "claude", "Direction set. Implementer: @Kimi [DONE]")
            .unwrap();
        assert_eq!(card2.status, CardStatus::Planning);
        assert_eq!(card2.implementer, "kimi");
        assert!(prompt.unwrap().contains("PLANNER"));

        // Plan -> review -> coordinator plan decision.
        engine
            .on_agent_completed(&card.id, "claude", "plan [DONE]")
            .unwrap();
        let (card3, prompt) = engine
            .on_agent_completed(&card.id, "kimi", "review comments, fine by me")
            .unwrap();
        assert_eq!(card3.status, CardStatus::Coordinating);
        assert_eq!(card3.coordination_stage, Some(CoordinationStage::PlanDecision));
        assert!(prompt.unwrap().contains("As tech lead, decide"));

        // Coordinator approves the plan -> implementing.
        let (card4, prompt) = engine
            .on_agent_completed(&card.id, "claude", "[DONE]")
            .unwrap();
        assert_eq!(card4.status, CardStatus::Implementing);
        assert!(prompt.unwrap().contains("IMPLEMENTER"));

        // Impl -> review -> impl decision -> coordinator rejects.
        engine
            .on_agent_completed(&card.id, "kimi", "built [DONE]")
            .unwrap();
        engine
            .on_agent_completed(&card.id, "kimi", "found issues")
            .unwrap();
        let (card5, prompt) = engine
            .on_agent_completed(&card.id, "claude", "needs more tests")
            .unwrap();
        assert_eq!(card5.status, CardStatus::Implementing);
        assert!(prompt.unwrap().contains("coordinator sent back"));

        // Second pass approved end-to-end.
        engine
            .on_agent_completed(&card.id, "kimi", "fixed [DONE]")
            .unwrap();
        engine
            .on_agent_completed(&card.id, "kimi", "all good now")
            .unwrap();
        let (card6, prompt) = engine
            .on_agent_completed(&card.id, "claude", "[DONE]")
            .unwrap();
        assert_eq!(card6.status, CardStatus::Done);
        assert!(prompt.is_none());
    }

    #[test]
    fn delegation_parses_roles_from_combined_responses() {
        let mut engine = engine();
        let card = simple_card(&mut engine);
        let prompt = engine.build_delegation_prompt(&card.id).unwrap();
        assert!(prompt.contains("claude, codex, kimi"));

        let mut responses = HashMap::new();
        responses.insert("claude".to_string(), "Planner: @Claude".to_string());
        responses.insert(
            "codex".to_string(),
            "Implementer: @Codex, Reviewer: @Kimi".to_string(),
        );
        let updated = engine
            .parse_delegation_response(&card.id, &responses)
            .unwrap()
            .expect("all roles assigned");
        assert_eq!(updated.planner, "claude");
        assert_eq!(updated.implementer, "codex");
        assert_eq!(updated.reviewer, "kimi");
    }

    #[test]
    fn delegation_incomplete_returns_none() {
        let mut engine = engine();
        let card = simple_card(&mut engine);
        let mut responses = HashMap::new();
        responses.insert("claude".to_string(), "Planner: @Claude".to_string());
        let updated = engine.parse_delegation_response(&card.id, &responses).unwrap();
        assert!(updated.is_none());
    }
}
