//! Assignment service - binds admin instances to teams and users
//!
//! Given a freshly created ADMIN instance, selects a team (and optionally a
//! member) according to a configurable strategy, then drives the instance
//! through the review/approval stages. The team/user directory is supplied
//! by the outer layer; the identity provider itself stays external and all
//! ids are opaque strings.
//!
//! The round-robin rotation table is process-wide, in-memory state behind a
//! mutex. After a restart every key rotates from index 0 again; durable
//! rotation is an explicit non-goal.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::instance::{AssignmentStatus, AssignmentType, Instance};
use crate::store::{InstanceFilter, InstanceStore};

/// Strategy used to pick a team/user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Rotate assignments evenly
    RoundRobin,
    /// Lowest current workload wins
    WorkloadBased,
    /// Best specialization overlap wins, workload as tiebreaker
    ExpertiseBased,
    /// Uniform pick, for tests and fallbacks
    Random,
    /// Reserved; currently falls back to workload
    PriorityBased,
}

/// Assignment rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRule {
    pub strategy: AssignmentStrategy,
    #[serde(default)]
    pub preferred_teams: Vec<String>,
    #[serde(default)]
    pub required_specializations: Vec<String>,
    pub max_instances_per_user: usize,
    pub prefer_team_assignment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_role: Option<String>,
    #[serde(default)]
    pub auto_start: bool,
}

impl Default for AssignmentRule {
    fn default() -> Self {
        Self {
            strategy: AssignmentStrategy::WorkloadBased,
            preferred_teams: Vec::new(),
            required_specializations: Vec::new(),
            max_instances_per_user: 5,
            prefer_team_assignment: true,
            assignee_role: None,
            auto_start: false,
        }
    }
}

impl AssignmentRule {
    pub fn with_strategy(strategy: AssignmentStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn to_users(mut self) -> Self {
        self.prefer_team_assignment = false;
        self
    }

    pub fn preferred_teams(mut self, teams: Vec<String>) -> Self {
        self.preferred_teams = teams;
        self
    }

    pub fn required_specializations(mut self, specializations: Vec<String>) -> Self {
        self.required_specializations = specializations;
        self
    }

    pub fn assignee_role(mut self, role: impl Into<String>) -> Self {
        self.assignee_role = Some(role.into());
        self
    }
}

/// A team registered in the directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub team_id: String,
    pub name: String,
    pub is_active: bool,
    #[serde(default)]
    pub specializations: Vec<String>,
    /// Member user ids, in rotation order
    #[serde(default)]
    pub members: Vec<String>,
}

impl Team {
    pub fn new(team_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            name: name.into(),
            is_active: true,
            specializations: Vec::new(),
            members: Vec::new(),
        }
    }

    pub fn specializations(mut self, specializations: Vec<String>) -> Self {
        self.specializations = specializations;
        self
    }

    pub fn members(mut self, members: Vec<String>) -> Self {
        self.members = members;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// A person who can be assigned work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignee {
    pub user_id: String,
    pub is_active: bool,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub specializations: Vec<String>,
}

impl Assignee {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_active: true,
            roles: Vec::new(),
            specializations: Vec::new(),
        }
    }

    pub fn roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    pub fn specializations(mut self, specializations: Vec<String>) -> Self {
        self.specializations = specializations;
        self
    }
}

/// Policy engine binding instances to teams/users
pub struct AssignmentService {
    store: Arc<dyn InstanceStore>,
    teams: RwLock<Vec<Team>>,
    assignees: RwLock<Vec<Assignee>>,
    /// workflow_id -> rule override
    rules: RwLock<FxHashMap<String, AssignmentRule>>,
    default_rule: AssignmentRule,
    /// rotation key -> next index
    rotation: Mutex<FxHashMap<String, usize>>,
}

impl AssignmentService {
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self {
            store,
            teams: RwLock::new(Vec::new()),
            assignees: RwLock::new(Vec::new()),
            rules: RwLock::new(FxHashMap::default()),
            default_rule: AssignmentRule::default(),
            rotation: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn register_team(&self, team: Team) {
        let mut teams = self.teams.write();
        teams.retain(|t| t.team_id != team.team_id);
        teams.push(team);
    }

    pub fn register_assignee(&self, assignee: Assignee) {
        let mut assignees = self.assignees.write();
        assignees.retain(|a| a.user_id != assignee.user_id);
        assignees.push(assignee);
    }

    /// Install a per-workflow rule override
    pub fn set_rule(&self, workflow_id: impl Into<String>, rule: AssignmentRule) {
        self.rules.write().insert(workflow_id.into(), rule);
    }

    fn rule_for(&self, workflow_id: &str, explicit: Option<&AssignmentRule>) -> AssignmentRule {
        if let Some(rule) = explicit {
            return rule.clone();
        }
        self.rules
            .read()
            .get(workflow_id)
            .cloned()
            .unwrap_or_else(|| self.default_rule.clone())
    }

    /// Bind an instance to a team/user per the applicable rule.
    /// Returns false when no eligible team exists; the instance is left
    /// untouched in that case.
    pub async fn bind(
        &self,
        instance: &mut Instance,
        rule: Option<&AssignmentRule>,
    ) -> Result<bool, EngineError> {
        let rule = self.rule_for(&instance.dag_id, rule);
        let eligible = self.eligible_teams(&rule);
        if eligible.is_empty() {
            debug!(instance_id = %instance.instance_id, "no eligible team for assignment");
            return Ok(false);
        }

        let (team, user) = match rule.strategy {
            AssignmentStrategy::RoundRobin => self.round_robin(instance, &rule, &eligible).await?,
            AssignmentStrategy::WorkloadBased | AssignmentStrategy::PriorityBased => {
                self.workload_based(&rule, &eligible).await?
            }
            AssignmentStrategy::ExpertiseBased => self.expertise_based(&rule, &eligible).await?,
            AssignmentStrategy::Random => self.random_pick(instance, &rule, &eligible).await?,
        };

        let Some(team) = team else {
            return Ok(false);
        };

        instance.assign_to_team(team.clone(), "system", AssignmentType::Automatic, None);
        if let Some(user) = user {
            instance.assign_to_user(user, "system", AssignmentType::Automatic, None);
        }
        info!(
            instance_id = %instance.instance_id,
            team_id = %team,
            user_id = instance.assignment.as_ref().and_then(|a| a.user_id.as_deref()).unwrap_or("-"),
            strategy = ?rule.strategy,
            "instance assigned"
        );
        Ok(true)
    }

    fn eligible_teams(&self, rule: &AssignmentRule) -> Vec<Team> {
        self.teams
            .read()
            .iter()
            .filter(|team| team.is_active)
            .filter(|team| {
                rule.preferred_teams.is_empty() || rule.preferred_teams.contains(&team.team_id)
            })
            .filter(|team| {
                rule.required_specializations.is_empty()
                    || team
                        .specializations
                        .iter()
                        .any(|s| rule.required_specializations.contains(s))
            })
            .cloned()
            .collect()
    }

    /// Members of a team that pass the rule's role filter and are active
    fn eligible_members(&self, team: &Team, rule: &AssignmentRule) -> Vec<Assignee> {
        let assignees = self.assignees.read();
        team.members
            .iter()
            .filter_map(|user_id| assignees.iter().find(|a| &a.user_id == user_id))
            .filter(|a| a.is_active)
            .filter(|a| {
                rule.assignee_role
                    .as_deref()
                    .is_none_or(|role| a.roles.iter().any(|r| r == role))
            })
            .cloned()
            .collect()
    }

    async fn active_count_for_team(&self, team_id: &str) -> Result<usize, EngineError> {
        let filter = InstanceFilter {
            assigned_team_id: Some(team_id.to_string()),
            ..Default::default()
        };
        Ok(self
            .store
            .list_instances(&filter)
            .await?
            .iter()
            .filter(|i| is_active_assignment(i))
            .count())
    }

    async fn active_count_for_user(&self, user_id: &str) -> Result<usize, EngineError> {
        let filter = InstanceFilter {
            assigned_user_id: Some(user_id.to_string()),
            ..Default::default()
        };
        Ok(self
            .store
            .list_instances(&filter)
            .await?
            .iter()
            .filter(|i| is_active_assignment(i))
            .count())
    }

    /// Team workload normalized by team size
    async fn team_workload(&self, team: &Team) -> Result<f64, EngineError> {
        let count = self.active_count_for_team(&team.team_id).await? as f64;
        let size = team.members.len().max(1) as f64;
        Ok(count / size)
    }

    async fn workload_based(
        &self,
        rule: &AssignmentRule,
        eligible: &[Team],
    ) -> Result<(Option<String>, Option<String>), EngineError> {
        let mut best_team: Option<&Team> = None;
        let mut best_user: Option<String> = None;
        let mut best_score = f64::INFINITY;

        for team in eligible {
            let team_score = self.team_workload(team).await?;

            if rule.prefer_team_assignment {
                if team_score < best_score {
                    best_score = team_score;
                    best_team = Some(team);
                    best_user = None;
                }
            } else {
                for member in self.eligible_members(team, rule) {
                    let user_count = self.active_count_for_user(&member.user_id).await?;
                    if user_count >= rule.max_instances_per_user {
                        continue;
                    }
                    let combined = team_score * 0.3 + user_count as f64 * 0.7;
                    if combined < best_score {
                        best_score = combined;
                        best_team = Some(team);
                        best_user = Some(member.user_id.clone());
                    }
                }
            }
        }

        Ok((best_team.map(|t| t.team_id.clone()), best_user))
    }

    async fn round_robin(
        &self,
        instance: &Instance,
        rule: &AssignmentRule,
        eligible: &[Team],
    ) -> Result<(Option<String>, Option<String>), EngineError> {
        let team_key = format!("teams::{}", instance.dag_id);
        let team_index = self.next_rotation(&team_key, eligible.len());
        let team = &eligible[team_index];

        if rule.prefer_team_assignment {
            return Ok((Some(team.team_id.clone()), None));
        }

        let members = self.eligible_members(team, rule);
        if members.is_empty() {
            return Ok((Some(team.team_id.clone()), None));
        }

        let member_key = format!(
            "{}::{}::{}",
            team.team_id,
            rule.assignee_role.as_deref().unwrap_or("*"),
            instance.dag_id
        );
        // Walk the rotation until someone under the cap turns up
        for _ in 0..members.len() {
            let index = self.next_rotation(&member_key, members.len());
            let candidate = &members[index];
            let count = self.active_count_for_user(&candidate.user_id).await?;
            if count < rule.max_instances_per_user {
                return Ok((Some(team.team_id.clone()), Some(candidate.user_id.clone())));
            }
        }

        Ok((Some(team.team_id.clone()), None))
    }

    async fn expertise_based(
        &self,
        rule: &AssignmentRule,
        eligible: &[Team],
    ) -> Result<(Option<String>, Option<String>), EngineError> {
        let mut best_team: Option<&Team> = None;
        let mut best_score = f64::NEG_INFINITY;

        for team in eligible {
            let expertise = expertise_score(&team.specializations, &rule.required_specializations);
            let workload_factor = 1.0 - (self.team_workload(team).await? / 10.0).min(1.0);
            let combined = expertise * 0.7 + workload_factor * 0.3;
            if combined > best_score {
                best_score = combined;
                best_team = Some(team);
            }
        }

        let Some(team) = best_team else {
            return Ok((None, None));
        };

        if rule.prefer_team_assignment {
            return Ok((Some(team.team_id.clone()), None));
        }

        let mut best_user: Option<String> = None;
        let mut best_user_score = f64::NEG_INFINITY;
        for member in self.eligible_members(team, rule) {
            let count = self.active_count_for_user(&member.user_id).await?;
            if count >= rule.max_instances_per_user {
                continue;
            }
            let score = expertise_score(&member.specializations, &rule.required_specializations);
            if score > best_user_score {
                best_user_score = score;
                best_user = Some(member.user_id.clone());
            }
        }

        Ok((Some(team.team_id.clone()), best_user))
    }

    async fn random_pick(
        &self,
        instance: &Instance,
        rule: &AssignmentRule,
        eligible: &[Team],
    ) -> Result<(Option<String>, Option<String>), EngineError> {
        let team = &eligible[uniform_index(&instance.instance_id, eligible.len())];
        if rule.prefer_team_assignment {
            return Ok((Some(team.team_id.clone()), None));
        }
        let members = self.eligible_members(team, rule);
        if members.is_empty() {
            return Ok((Some(team.team_id.clone()), None));
        }
        let member = &members[uniform_index(&format!("{}:user", instance.instance_id), members.len())];
        Ok((Some(team.team_id.clone()), Some(member.user_id.clone())))
    }

    fn next_rotation(&self, key: &str, len: usize) -> usize {
        let mut rotation = self.rotation.lock();
        let counter = rotation.entry(key.to_string()).or_insert(0);
        let index = *counter % len;
        *counter += 1;
        index
    }

    // ------------------------------------------------------------------
    // Review stage operations: load, guard, save. The boolean mirrors the
    // instance-level guard; a false performs no write.
    // ------------------------------------------------------------------

    async fn with_instance<F>(&self, instance_id: &str, mutate: F) -> Result<bool, EngineError>
    where
        F: FnOnce(&mut Instance) -> bool,
    {
        let mut instance = self
            .store
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))?;

        if !mutate(&mut instance) {
            return Ok(false);
        }
        self.store.save_instance(&mut instance).await?;
        Ok(true)
    }

    pub async fn start_review(&self, instance_id: &str, reviewer_id: &str) -> Result<bool, EngineError> {
        self.with_instance(instance_id, |i| i.start_review(reviewer_id)).await
    }

    pub async fn approve_by_reviewer(
        &self,
        instance_id: &str,
        reviewer_id: &str,
        comments: Option<String>,
    ) -> Result<bool, EngineError> {
        self.with_instance(instance_id, |i| i.approve_by_reviewer(reviewer_id, comments))
            .await
    }

    pub async fn reject_by_reviewer(
        &self,
        instance_id: &str,
        reviewer_id: &str,
        reason: &str,
        comments: Option<String>,
    ) -> Result<bool, EngineError> {
        self.with_instance(instance_id, |i| i.reject_by_reviewer(reviewer_id, reason, comments))
            .await
    }

    pub async fn request_modifications(
        &self,
        instance_id: &str,
        reviewer_id: &str,
        modifications: Vec<Value>,
        comments: Option<String>,
    ) -> Result<bool, EngineError> {
        self.with_instance(instance_id, |i| {
            i.request_modifications(reviewer_id, modifications, comments)
        })
        .await
    }

    pub async fn final_approval(
        &self,
        instance_id: &str,
        approver_id: &str,
        comments: Option<String>,
    ) -> Result<bool, EngineError> {
        self.with_instance(instance_id, |i| i.final_approval(approver_id, comments))
            .await
    }

    pub async fn escalate(
        &self,
        instance_id: &str,
        reason: &str,
        escalated_by: &str,
    ) -> Result<bool, EngineError> {
        self.with_instance(instance_id, |i| i.escalate(reason, escalated_by)).await
    }

    /// Counts of assigned instances per stage and binding type
    pub async fn statistics(&self) -> Result<Map<String, Value>, EngineError> {
        let instances = self.store.list_instances(&InstanceFilter::default()).await?;

        let mut by_stage: Map<String, Value> = Map::new();
        let mut automatic = 0u64;
        let mut manual = 0u64;
        for instance in &instances {
            let Some(assignment) = instance.assignment.as_ref() else {
                continue;
            };
            let stage = serde_json::to_value(assignment.status)?
                .as_str()
                .unwrap_or("unknown")
                .to_string();
            let count = by_stage.get(&stage).and_then(Value::as_u64).unwrap_or(0);
            by_stage.insert(stage, Value::from(count + 1));
            match assignment.assignment_type {
                AssignmentType::Manual => manual += 1,
                _ => automatic += 1,
            }
        }

        let mut stats = Map::new();
        stats.insert("total_assignments".into(), Value::from(automatic + manual));
        stats.insert("automatic_assignments".into(), Value::from(automatic));
        stats.insert("manual_assignments".into(), Value::from(manual));
        stats.insert("by_stage".into(), Value::Object(by_stage));
        Ok(stats)
    }

    /// PENDING_REVIEW/ESCALATED -> PENDING_REVIEW under a fresh binding
    pub async fn reassign(&self, instance_id: &str, rule: Option<&AssignmentRule>) -> Result<bool, EngineError> {
        let mut instance = self
            .store
            .load_instance(instance_id)
            .await?
            .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))?;

        if !instance.can_be_assigned() {
            return Ok(false);
        }
        if !self.bind(&mut instance, rule).await? {
            return Ok(false);
        }
        self.store.save_instance(&mut instance).await?;
        Ok(true)
    }
}

fn is_active_assignment(instance: &Instance) -> bool {
    !instance.status.is_terminal()
        && matches!(
            instance.assignment_status(),
            Some(AssignmentStatus::PendingReview) | Some(AssignmentStatus::UnderReview)
        )
}

/// Specialization overlap ratio; without requirements, general competence
/// scales with breadth
fn expertise_score(have: &[String], required: &[String]) -> f64 {
    if required.is_empty() {
        return (have.len() as f64 / 5.0).min(1.0);
    }
    let matches = required.iter().filter(|r| have.contains(r)).count();
    matches as f64 / required.len() as f64
}

/// Deterministic uniform pick (hash of the instance id)
fn uniform_index(seed: &str, len: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    (hasher.finish() as usize) % len
}
