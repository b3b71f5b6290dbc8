//! Rules engine (C13): economic/non-economic/workflow rules loaded from a
//! repository, cached, and evaluated against a merged trade-data map.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::CoreError;
use crate::model::WorkflowStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    Economic,
    NonEconomic,
    Workflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Exists,
    NotExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub logical_operator: LogicalOperator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    SetWorkflowStatus { status: WorkflowStatus },
    /// Additive action types the engine doesn't yet know: logged and
    /// skipped rather than rejected.
    #[serde(other)]
    Unknown,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub rule_type: RuleType,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub priority: i32,
    #[serde(default)]
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn load_rules(&self) -> Result<Vec<Rule>, CoreError>;
}

/// Rule definitions loaded once from a YAML document, the same typed
/// config-over-`serde_yaml` convention used for [`crate::config::AppConfig`].
pub struct YamlRuleRepository {
    rules: Vec<Rule>,
}

impl YamlRuleRepository {
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        let rules: Vec<Rule> = serde_yaml::from_str(yaml).map_err(|e| CoreError::FatalConfig(e.to_string()))?;
        Ok(Self { rules })
    }

    pub fn from_file(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::FatalConfig(format!("reading {path}: {e}")))?;
        Self::from_yaml(&content)
    }
}

#[async_trait]
impl RuleRepository for YamlRuleRepository {
    async fn load_rules(&self) -> Result<Vec<Rule>, CoreError> {
        Ok(self.rules.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationOutcome {
    pub workflow_status: Option<WorkflowStatus>,
    pub rules_applied: Vec<String>,
}

/// Caches the repository's rules until explicitly invalidated (spec
/// §4.13: "cache invalidated by rule updates").
pub struct RulesEngine {
    repository: Arc<dyn RuleRepository>,
    cache: RwLock<Option<Vec<Rule>>>,
}

impl RulesEngine {
    pub fn new(repository: Arc<dyn RuleRepository>) -> Self {
        Self {
            repository,
            cache: RwLock::new(None),
        }
    }

    pub async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
    }

    async fn rules(&self) -> Result<Vec<Rule>, CoreError> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return Ok(cached.clone());
        }
        let loaded = self.repository.load_rules().await?;
        *self.cache.write().await = Some(loaded.clone());
        Ok(loaded)
    }

    /// Evaluate economic, then non-economic, then workflow rules (in that
    /// order, ascending priority within a type) against `trade_data`.
    pub async fn evaluate(&self, trade_data: &serde_json::Value) -> Result<EvaluationOutcome, CoreError> {
        let mut rules = self.rules().await?;
        rules.retain(|r| r.enabled);
        rules.sort_by_key(|r| r.priority);

        let mut outcome = EvaluationOutcome::default();

        for rule_type in [RuleType::Economic, RuleType::NonEconomic] {
            for rule in rules.iter().filter(|r| r.rule_type == rule_type) {
                if matches(&rule.criteria, trade_data) {
                    apply_actions(rule, &mut outcome);
                }
            }
        }

        for rule in rules.iter().filter(|r| r.rule_type == RuleType::Workflow) {
            if matches(&rule.criteria, trade_data) {
                apply_actions(rule, &mut outcome);
                break;
            }
        }

        Ok(outcome)
    }
}

fn apply_actions(rule: &Rule, outcome: &mut EvaluationOutcome) {
    for action in &rule.actions {
        match action {
            Action::SetWorkflowStatus { status } => outcome.workflow_status = Some(*status),
            Action::Unknown => tracing::warn!(rule_id = %rule.id, "skipping unknown rule action type"),
        }
    }
    outcome.rules_applied.push(rule.id.clone());
}

fn matches(criteria: &[Criterion], data: &serde_json::Value) -> bool {
    let mut acc = true;
    for (i, criterion) in criteria.iter().enumerate() {
        let result = evaluate_criterion(criterion, data);
        acc = if i == 0 {
            result
        } else {
            match criterion.logical_operator {
                LogicalOperator::And => acc && result,
                LogicalOperator::Or => acc || result,
            }
        };
    }
    acc
}

fn field_at<'a>(data: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').try_fold(data, |value, segment| value.get(segment))
}

fn evaluate_criterion(criterion: &Criterion, data: &serde_json::Value) -> bool {
    let found = field_at(data, &criterion.field);

    match criterion.operator {
        Operator::Exists => found.is_some(),
        Operator::NotExists => found.is_none(),
        Operator::Equals => found.is_some_and(|v| Some(v) == criterion.value.as_ref()),
        Operator::NotEquals => found.is_none_or(|v| Some(v) != criterion.value.as_ref()),
        Operator::GreaterThan => compare_numeric(found, criterion.value.as_ref(), |a, b| a > b),
        Operator::GreaterThanOrEqual => compare_numeric(found, criterion.value.as_ref(), |a, b| a >= b),
        Operator::LessThan => compare_numeric(found, criterion.value.as_ref(), |a, b| a < b),
        Operator::LessThanOrEqual => compare_numeric(found, criterion.value.as_ref(), |a, b| a <= b),
    }
}

fn compare_numeric(
    found: Option<&serde_json::Value>,
    expected: Option<&serde_json::Value>,
    cmp: impl Fn(f64, f64) -> bool,
) -> bool {
    match (found.and_then(|v| v.as_f64()), expected.and_then(|v| v.as_f64())) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticRepository {
        rules: Vec<Rule>,
    }

    #[async_trait]
    impl RuleRepository for StaticRepository {
        async fn load_rules(&self) -> Result<Vec<Rule>, CoreError> {
            Ok(self.rules.clone())
        }
    }

    fn rule(id: &str, rule_type: RuleType, priority: i32, criteria: Vec<Criterion>, actions: Vec<Action>) -> Rule {
        Rule {
            id: id.into(),
            rule_type,
            enabled: true,
            priority,
            criteria,
            actions,
        }
    }

    #[tokio::test]
    async fn economic_rules_all_fire_in_priority_order() {
        let engine = RulesEngine::new(Arc::new(StaticRepository {
            rules: vec![
                rule("e2", RuleType::Economic, 2, vec![], vec![]),
                rule("e1", RuleType::Economic, 1, vec![], vec![]),
            ],
        }));
        let outcome = engine.evaluate(&json!({})).await.unwrap();
        assert_eq!(outcome.rules_applied, vec!["e1", "e2"]);
    }

    #[tokio::test]
    async fn workflow_stops_at_first_match() {
        let engine = RulesEngine::new(Arc::new(StaticRepository {
            rules: vec![
                rule(
                    "w1",
                    RuleType::Workflow,
                    1,
                    vec![],
                    vec![Action::SetWorkflowStatus {
                        status: WorkflowStatus::Approved,
                    }],
                ),
                rule(
                    "w2",
                    RuleType::Workflow,
                    2,
                    vec![],
                    vec![Action::SetWorkflowStatus {
                        status: WorkflowStatus::Rejected,
                    }],
                ),
            ],
        }));
        let outcome = engine.evaluate(&json!({})).await.unwrap();
        assert_eq!(outcome.rules_applied, vec!["w1"]);
        assert_eq!(outcome.workflow_status, Some(WorkflowStatus::Approved));
    }

    #[tokio::test]
    async fn criterion_matches_dotted_field_path() {
        let engine = RulesEngine::new(Arc::new(StaticRepository {
            rules: vec![rule(
                "r1",
                RuleType::Economic,
                1,
                vec![Criterion {
                    field: "security.assetClass".into(),
                    operator: Operator::Equals,
                    value: Some(json!("SWAP")),
                    logical_operator: LogicalOperator::And,
                }],
                vec![],
            )],
        }));
        let outcome = engine
            .evaluate(&json!({"security": {"assetClass": "SWAP"}}))
            .await
            .unwrap();
        assert_eq!(outcome.rules_applied, vec!["r1"]);

        let no_match = engine
            .evaluate(&json!({"security": {"assetClass": "BOND"}}))
            .await
            .unwrap();
        assert!(no_match.rules_applied.is_empty());
    }

    #[tokio::test]
    async fn multiple_criteria_combine_left_to_right() {
        let criteria = vec![
            Criterion {
                field: "quantity".into(),
                operator: Operator::GreaterThan,
                value: Some(json!(100)),
                logical_operator: LogicalOperator::And,
            },
            Criterion {
                field: "flagged".into(),
                operator: Operator::Equals,
                value: Some(json!(true)),
                logical_operator: LogicalOperator::Or,
            },
        ];
        let engine = RulesEngine::new(Arc::new(StaticRepository {
            rules: vec![rule("r1", RuleType::Economic, 1, criteria, vec![])],
        }));

        // quantity <= 100 but flagged=true -> OR makes it match.
        let outcome = engine.evaluate(&json!({"quantity": 50, "flagged": true})).await.unwrap();
        assert_eq!(outcome.rules_applied, vec!["r1"]);

        let no_match = engine.evaluate(&json!({"quantity": 50, "flagged": false})).await.unwrap();
        assert!(no_match.rules_applied.is_empty());
    }

    #[tokio::test]
    async fn disabled_rules_never_evaluate() {
        let mut r = rule("r1", RuleType::Economic, 1, vec![], vec![]);
        r.enabled = false;
        let engine = RulesEngine::new(Arc::new(StaticRepository { rules: vec![r] }));
        let outcome = engine.evaluate(&json!({})).await.unwrap();
        assert!(outcome.rules_applied.is_empty());
    }

    #[tokio::test]
    async fn cache_invalidation_picks_up_repository_changes() {
        let repo = Arc::new(tokio::sync::RwLock::new(vec![rule("r1", RuleType::Economic, 1, vec![], vec![])]));

        struct DynamicRepository {
            rules: Arc<tokio::sync::RwLock<Vec<Rule>>>,
        }
        #[async_trait]
        impl RuleRepository for DynamicRepository {
            async fn load_rules(&self) -> Result<Vec<Rule>, CoreError> {
                Ok(self.rules.read().await.clone())
            }
        }

        let engine = RulesEngine::new(Arc::new(DynamicRepository { rules: repo.clone() }));
        let first = engine.evaluate(&json!({})).await.unwrap();
        assert_eq!(first.rules_applied, vec!["r1"]);

        repo.write().await.push(rule("r2", RuleType::Economic, 2, vec![], vec![]));
        let cached = engine.evaluate(&json!({})).await.unwrap();
        assert_eq!(cached.rules_applied, vec!["r1"]);

        engine.invalidate_cache().await;
        let refreshed = engine.evaluate(&json!({})).await.unwrap();
        assert_eq!(refreshed.rules_applied, vec!["r1", "r2"]);
    }

    #[test]
    fn yaml_repository_parses_rule_definitions() {
        let yaml = r#"
- id: eco-1
  rule_type: ECONOMIC
  priority: 1
  criteria:
    - field: quantity
      operator: EXISTS
  actions: []
"#;
        let repo = YamlRuleRepository::from_yaml(yaml).unwrap();
        assert_eq!(repo.rules.len(), 1);
        assert_eq!(repo.rules[0].id, "eco-1");
    }
}
