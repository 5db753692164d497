//! Core domain model and pure reporting logic for PRMS.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "prms-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    /// Lenient parse used during ingestion; anything unrecognized maps to `Other`.
    pub fn parse_lenient(input: &str) -> Self {
        match input.trim().to_ascii_lowercase().as_str() {
            "male" | "m" => Gender::Male,
            "female" | "f" => Gender::Female,
            _ => Gender::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "Male",
            Gender::Female => "Female",
            Gender::Other => "Other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Completed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Completed => "completed",
            MessageStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: Uuid,
    pub agent_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub address: Address,
    pub phone_number: String,
    pub email: String,
    pub gender: Gender,
    pub user_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pre-persistence user shape produced by ingestion normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub address: Address,
    pub phone_number: String,
    pub email: String,
    pub gender: Gender,
    pub user_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub id: Uuid,
    pub account_name: String,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCategory {
    pub id: Uuid,
    pub category_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCarrier {
    pub id: Uuid,
    pub company_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub id: Uuid,
    pub policy_number: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub category_id: Uuid,
    pub carrier_id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPolicy {
    pub policy_number: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub category_id: Uuid,
    pub carrier_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledMessage {
    pub id: Uuid,
    pub message: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Compact user shape embedded in policy-centric API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: Uuid,
    pub name: String,
    pub email: String,
}

impl UserSummary {
    pub fn from_user(user: &User) -> Self {
        Self {
            id: user.id,
            name: format!("{} {}", user.first_name, user.last_name),
            email: user.email.clone(),
        }
    }
}

/// Policy joined with its category, carrier and owning user, as served by
/// listings, search results and the aggregation fold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyView {
    pub id: Uuid,
    pub policy_number: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub category: String,
    pub carrier: String,
    pub user: UserSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyBrief {
    pub policy_number: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub category: String,
    pub carrier: String,
}

/// One group of the per-user aggregation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPolicySummary {
    pub user_id: Uuid,
    pub user_name: String,
    pub user_email: String,
    pub total_policies: usize,
    pub categories: Vec<String>,
    pub carriers: Vec<String>,
    pub policies: Vec<PolicyBrief>,
}

/// Group joined policy rows by owning user: total count, distinct
/// category/carrier name sets, constituent policies, sorted by descending
/// count (user name as tiebreak so output order is deterministic).
pub fn aggregate_policies(views: &[PolicyView]) -> Vec<UserPolicySummary> {
    let mut groups: Vec<UserPolicySummary> = Vec::new();

    for view in views {
        let index = match groups.iter().position(|g| g.user_id == view.user.id) {
            Some(index) => index,
            None => {
                groups.push(UserPolicySummary {
                    user_id: view.user.id,
                    user_name: view.user.name.clone(),
                    user_email: view.user.email.clone(),
                    total_policies: 0,
                    categories: Vec::new(),
                    carriers: Vec::new(),
                    policies: Vec::new(),
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[index];
        group.total_policies += 1;
        group.policies.push(PolicyBrief {
            policy_number: view.policy_number.clone(),
            start_date: view.start_date,
            end_date: view.end_date,
            category: view.category.clone(),
            carrier: view.carrier.clone(),
        });
    }

    for group in &mut groups {
        let categories: BTreeSet<String> =
            group.policies.iter().map(|p| p.category.clone()).collect();
        let carriers: BTreeSet<String> = group.policies.iter().map(|p| p.carrier.clone()).collect();
        group.categories = categories.into_iter().collect();
        group.carriers = carriers.into_iter().collect();
    }

    groups.sort_by(|a, b| {
        b.total_policies
            .cmp(&a.total_policies)
            .then_with(|| a.user_name.cmp(&b.user_name))
    });
    groups
}

/// Count of records created per entity type by one ingestion run, plus
/// collected row-level errors. Keys mirror the upload response contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    pub agents: usize,
    pub users: usize,
    pub user_accounts: usize,
    pub policy_categories: usize,
    pub policy_carriers: usize,
    pub policies: usize,
    pub errors: Vec<String>,
}
