//! Record store for PRMS: the `PolicyStore` trait, a Postgres-backed
//! implementation, and an in-memory implementation with identical semantics.
//!
//! All SQL is runtime-checked (`sqlx::query_as`, not `sqlx::query_as!`) so the
//! workspace builds without a live database. Natural-key uniqueness and
//! foreign-key integrity are enforced at this boundary in both
//! implementations; Postgres additionally declares the constraints in DDL and
//! absorbs get-or-create races with `ON CONFLICT DO NOTHING` + re-select.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use prms_core::{
    Address, Agent, Gender, MessageStatus, NewPolicy, NewUser, Policy, PolicyCarrier,
    PolicyCategory, PolicyView, ScheduledMessage, User, UserAccount, UserSummary,
};

pub const CRATE_NAME: &str = "prms-storage";

/// Workspace-root migrations, shared by `serve` and the `migrate` command.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },
    #[error("duplicate {entity}: {key}")]
    Duplicate { entity: &'static str, key: String },
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence seam for every domain record. Get-or-create methods return
/// the record plus whether this call created it, which is what ingestion
/// counts.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_or_create_agent(&self, agent_name: &str) -> Result<(Agent, bool)>;
    async fn list_agents(&self) -> Result<Vec<Agent>>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn create_user(&self, draft: NewUser) -> Result<User>;
    async fn list_users(&self) -> Result<Vec<User>>;
    /// Case-insensitive substring match on first name; first match wins.
    async fn find_user_by_name_fragment(&self, fragment: &str) -> Result<Option<User>>;

    async fn get_or_create_account(
        &self,
        user_id: Uuid,
        account_name: &str,
    ) -> Result<(UserAccount, bool)>;

    async fn get_or_create_category(&self, category_name: &str) -> Result<(PolicyCategory, bool)>;
    async fn get_or_create_carrier(&self, company_name: &str) -> Result<(PolicyCarrier, bool)>;

    async fn find_policy_by_number(&self, policy_number: &str) -> Result<Option<Policy>>;
    async fn create_policy(&self, draft: NewPolicy) -> Result<Policy>;
    async fn list_policies(&self) -> Result<Vec<PolicyView>>;
    async fn policies_for_user(&self, user_id: Uuid) -> Result<Vec<PolicyView>>;

    async fn create_message(
        &self,
        message: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<ScheduledMessage>;
    async fn get_message(&self, id: Uuid) -> Result<Option<ScheduledMessage>>;
    async fn list_messages(&self) -> Result<Vec<ScheduledMessage>>;
    /// Claim every due pending message in one statement: flip status to
    /// completed and stamp the realized activation time. Returns the claimed
    /// messages so the sweeper can log them.
    async fn complete_due_messages(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledMessage>>;
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn validate_policy_dates(start: NaiveDate, end: NaiveDate) -> Result<()> {
    if start >= end {
        return Err(StoreError::Invalid(format!(
            "policy start date {start} must precede end date {end}"
        )));
    }
    Ok(())
}

fn gender_from_db(value: &str) -> Gender {
    match value {
        "Male" => Gender::Male,
        "Female" => Gender::Female,
        _ => Gender::Other,
    }
}

fn status_from_db(value: &str) -> MessageStatus {
    match value {
        "completed" => MessageStatus::Completed,
        "failed" => MessageStatus::Failed,
        _ => MessageStatus::Pending,
    }
}

// ── Postgres ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: Uuid,
    agent_name: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AgentRow> for Agent {
    fn from(row: AgentRow) -> Self {
        Agent {
            id: row.id,
            agent_name: row.agent_name,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    first_name: String,
    last_name: String,
    date_of_birth: NaiveDate,
    street: String,
    city: String,
    state: String,
    zip_code: String,
    phone_number: String,
    email: String,
    gender: String,
    user_type: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            first_name: row.first_name,
            last_name: row.last_name,
            date_of_birth: row.date_of_birth,
            address: Address {
                street: row.street,
                city: row.city,
                state: row.state,
                zip_code: row.zip_code,
            },
            phone_number: row.phone_number,
            email: row.email,
            gender: gender_from_db(&row.gender),
            user_type: row.user_type,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    account_name: String,
    user_id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for UserAccount {
    fn from(row: AccountRow) -> Self {
        UserAccount {
            id: row.id,
            account_name: row.account_name,
            user_id: row.user_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CategoryRow {
    id: Uuid,
    category_name: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CategoryRow> for PolicyCategory {
    fn from(row: CategoryRow) -> Self {
        PolicyCategory {
            id: row.id,
            category_name: row.category_name,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CarrierRow {
    id: Uuid,
    company_name: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<CarrierRow> for PolicyCarrier {
    fn from(row: CarrierRow) -> Self {
        PolicyCarrier {
            id: row.id,
            company_name: row.company_name,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: Uuid,
    policy_number: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    category_id: Uuid,
    carrier_id: Uuid,
    user_id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PolicyRow> for Policy {
    fn from(row: PolicyRow) -> Self {
        Policy {
            id: row.id,
            policy_number: row.policy_number,
            start_date: row.start_date,
            end_date: row.end_date,
            category_id: row.category_id,
            carrier_id: row.carrier_id,
            user_id: row.user_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PolicyViewRow {
    id: Uuid,
    policy_number: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    category_name: String,
    company_name: String,
    user_id: Uuid,
    first_name: String,
    last_name: String,
    email: String,
}

impl From<PolicyViewRow> for PolicyView {
    fn from(row: PolicyViewRow) -> Self {
        PolicyView {
            id: row.id,
            policy_number: row.policy_number,
            start_date: row.start_date,
            end_date: row.end_date,
            category: row.category_name,
            carrier: row.company_name,
            user: UserSummary {
                id: row.user_id,
                name: format!("{} {}", row.first_name, row.last_name),
                email: row.email,
            },
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    message: String,
    scheduled_at: DateTime<Utc>,
    status: String,
    activated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<MessageRow> for ScheduledMessage {
    fn from(row: MessageRow) -> Self {
        ScheduledMessage {
            id: row.id,
            message: row.message,
            scheduled_at: row.scheduled_at,
            status: status_from_db(&row.status),
            activated_at: row.activated_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const POLICY_VIEW_SELECT: &str = r#"
    SELECT p.id, p.policy_number, p.start_date, p.end_date,
           c.category_name, r.company_name,
           u.id AS user_id, u.first_name, u.last_name, u.email
      FROM policies p
      JOIN policy_categories c ON c.id = p.category_id
      JOIN policy_carriers r ON r.id = p.carrier_id
      JOIN users u ON u.id = p.user_id
"#;

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_policy_insert_err(err: sqlx::Error, policy_number: &str) -> StoreError {
    if let Some(db_err) = err.as_database_error() {
        if db_err.is_foreign_key_violation() {
            return StoreError::Invalid(format!(
                "policy {policy_number} references a missing user, category or carrier"
            ));
        }
    }
    StoreError::Db(err)
}

#[async_trait]
impl PolicyStore for PgStore {
    async fn get_or_create_agent(&self, agent_name: &str) -> Result<(Agent, bool)> {
        let name = agent_name.trim();
        let select = "SELECT id, agent_name, created_at, updated_at FROM agents WHERE agent_name = $1";
        if let Some(row) = sqlx::query_as::<_, AgentRow>(select)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok((row.into(), false));
        }
        let inserted = sqlx::query_as::<_, AgentRow>(
            r#"
            INSERT INTO agents (id, agent_name) VALUES ($1, $2)
            ON CONFLICT (agent_name) DO NOTHING
            RETURNING id, agent_name, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        match inserted {
            Some(row) => Ok((row.into(), true)),
            // Lost a concurrent race; the row exists now.
            None => {
                let row = sqlx::query_as::<_, AgentRow>(select)
                    .bind(name)
                    .fetch_one(&self.pool)
                    .await?;
                Ok((row.into(), false))
            }
        }
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query_as::<_, AgentRow>(
            "SELECT id, agent_name, created_at, updated_at FROM agents ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Agent::from).collect())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, first_name, last_name, date_of_birth, street, city, state,
                   zip_code, phone_number, email, gender, user_type, created_at, updated_at
              FROM users WHERE email = $1
            "#,
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn create_user(&self, draft: NewUser) -> Result<User> {
        let email = normalize_email(&draft.email);
        let inserted = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (id, first_name, last_name, date_of_birth, street, city,
                               state, zip_code, phone_number, email, gender, user_type)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (email) DO NOTHING
            RETURNING id, first_name, last_name, date_of_birth, street, city, state,
                      zip_code, phone_number, email, gender, user_type, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&draft.first_name)
        .bind(&draft.last_name)
        .bind(draft.date_of_birth)
        .bind(&draft.address.street)
        .bind(&draft.address.city)
        .bind(&draft.address.state)
        .bind(&draft.address.zip_code)
        .bind(&draft.phone_number)
        .bind(&email)
        .bind(draft.gender.as_str())
        .bind(&draft.user_type)
        .fetch_optional(&self.pool)
        .await?;
        inserted.map(User::from).ok_or(StoreError::Duplicate {
            entity: "user",
            key: email,
        })
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, first_name, last_name, date_of_birth, street, city, state,
                   zip_code, phone_number, email, gender, user_type, created_at, updated_at
              FROM users ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn find_user_by_name_fragment(&self, fragment: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, first_name, last_name, date_of_birth, street, city, state,
                   zip_code, phone_number, email, gender, user_type, created_at, updated_at
              FROM users
             WHERE first_name ILIKE '%' || $1 || '%'
             ORDER BY created_at
             LIMIT 1
            "#,
        )
        .bind(fragment)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn get_or_create_account(
        &self,
        user_id: Uuid,
        account_name: &str,
    ) -> Result<(UserAccount, bool)> {
        let name = account_name.trim();
        let select = r#"
            SELECT id, account_name, user_id, created_at, updated_at
              FROM user_accounts WHERE user_id = $1 AND account_name = $2
        "#;
        if let Some(row) = sqlx::query_as::<_, AccountRow>(select)
            .bind(user_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok((row.into(), false));
        }
        let inserted = sqlx::query_as::<_, AccountRow>(
            r#"
            INSERT INTO user_accounts (id, account_name, user_id) VALUES ($1, $2, $3)
            ON CONFLICT (user_id, account_name) DO NOTHING
            RETURNING id, account_name, user_id, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        match inserted {
            Some(row) => Ok((row.into(), true)),
            None => {
                let row = sqlx::query_as::<_, AccountRow>(select)
                    .bind(user_id)
                    .bind(name)
                    .fetch_one(&self.pool)
                    .await?;
                Ok((row.into(), false))
            }
        }
    }

    async fn get_or_create_category(&self, category_name: &str) -> Result<(PolicyCategory, bool)> {
        let name = category_name.trim();
        let select =
            "SELECT id, category_name, created_at, updated_at FROM policy_categories WHERE category_name = $1";
        if let Some(row) = sqlx::query_as::<_, CategoryRow>(select)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok((row.into(), false));
        }
        let inserted = sqlx::query_as::<_, CategoryRow>(
            r#"
            INSERT INTO policy_categories (id, category_name) VALUES ($1, $2)
            ON CONFLICT (category_name) DO NOTHING
            RETURNING id, category_name, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        match inserted {
            Some(row) => Ok((row.into(), true)),
            None => {
                let row = sqlx::query_as::<_, CategoryRow>(select)
                    .bind(name)
                    .fetch_one(&self.pool)
                    .await?;
                Ok((row.into(), false))
            }
        }
    }

    async fn get_or_create_carrier(&self, company_name: &str) -> Result<(PolicyCarrier, bool)> {
        let name = company_name.trim();
        let select =
            "SELECT id, company_name, created_at, updated_at FROM policy_carriers WHERE company_name = $1";
        if let Some(row) = sqlx::query_as::<_, CarrierRow>(select)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok((row.into(), false));
        }
        let inserted = sqlx::query_as::<_, CarrierRow>(
            r#"
            INSERT INTO policy_carriers (id, company_name) VALUES ($1, $2)
            ON CONFLICT (company_name) DO NOTHING
            RETURNING id, company_name, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        match inserted {
            Some(row) => Ok((row.into(), true)),
            None => {
                let row = sqlx::query_as::<_, CarrierRow>(select)
                    .bind(name)
                    .fetch_one(&self.pool)
                    .await?;
                Ok((row.into(), false))
            }
        }
    }

    async fn find_policy_by_number(&self, policy_number: &str) -> Result<Option<Policy>> {
        let row = sqlx::query_as::<_, PolicyRow>(
            r#"
            SELECT id, policy_number, start_date, end_date, category_id, carrier_id,
                   user_id, created_at, updated_at
              FROM policies WHERE policy_number = $1
            "#,
        )
        .bind(policy_number.trim())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Policy::from))
    }

    async fn create_policy(&self, draft: NewPolicy) -> Result<Policy> {
        validate_policy_dates(draft.start_date, draft.end_date)?;
        let number = draft.policy_number.trim().to_string();
        let inserted = sqlx::query_as::<_, PolicyRow>(
            r#"
            INSERT INTO policies (id, policy_number, start_date, end_date,
                                  category_id, carrier_id, user_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (policy_number) DO NOTHING
            RETURNING id, policy_number, start_date, end_date, category_id, carrier_id,
                      user_id, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&number)
        .bind(draft.start_date)
        .bind(draft.end_date)
        .bind(draft.category_id)
        .bind(draft.carrier_id)
        .bind(draft.user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| map_policy_insert_err(err, &number))?;
        inserted.map(Policy::from).ok_or(StoreError::Duplicate {
            entity: "policy",
            key: number,
        })
    }

    async fn list_policies(&self) -> Result<Vec<PolicyView>> {
        let query = format!("{POLICY_VIEW_SELECT} ORDER BY p.created_at");
        let rows = sqlx::query_as::<_, PolicyViewRow>(&query)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(PolicyView::from).collect())
    }

    async fn policies_for_user(&self, user_id: Uuid) -> Result<Vec<PolicyView>> {
        let query = format!("{POLICY_VIEW_SELECT} WHERE p.user_id = $1 ORDER BY p.created_at");
        let rows = sqlx::query_as::<_, PolicyViewRow>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(PolicyView::from).collect())
    }

    async fn create_message(
        &self,
        message: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<ScheduledMessage> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO scheduled_messages (id, message, scheduled_at, status)
            VALUES ($1, $2, $3, 'pending')
            RETURNING id, message, scheduled_at, status, activated_at, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(message)
        .bind(scheduled_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<ScheduledMessage>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, message, scheduled_at, status, activated_at, created_at, updated_at
              FROM scheduled_messages WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ScheduledMessage::from))
    }

    async fn list_messages(&self) -> Result<Vec<ScheduledMessage>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, message, scheduled_at, status, activated_at, created_at, updated_at
              FROM scheduled_messages ORDER BY scheduled_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ScheduledMessage::from).collect())
    }

    async fn complete_due_messages(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledMessage>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE scheduled_messages
               SET status = 'completed', activated_at = $1, updated_at = $1
             WHERE status = 'pending' AND scheduled_at <= $1
            RETURNING id, message, scheduled_at, status, activated_at, created_at, updated_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ScheduledMessage::from).collect())
    }
}

// ── In-memory ────────────────────────────────────────────────────────────

/// Store used by tests and by `serve` when no `DATABASE_URL` is configured.
/// Mirrors the Postgres semantics, including natural-key uniqueness and
/// write-boundary foreign-key checks.
#[derive(Debug, Default)]
pub struct MemStore {
    inner: RwLock<MemInner>,
}

#[derive(Debug, Default)]
struct MemInner {
    agents: Vec<Agent>,
    users: Vec<User>,
    accounts: Vec<UserAccount>,
    categories: Vec<PolicyCategory>,
    carriers: Vec<PolicyCarrier>,
    policies: Vec<Policy>,
    messages: Vec<ScheduledMessage>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn policy_view(inner: &MemInner, policy: &Policy) -> Option<PolicyView> {
    let category = inner.categories.iter().find(|c| c.id == policy.category_id)?;
    let carrier = inner.carriers.iter().find(|c| c.id == policy.carrier_id)?;
    let user = inner.users.iter().find(|u| u.id == policy.user_id)?;
    Some(PolicyView {
        id: policy.id,
        policy_number: policy.policy_number.clone(),
        start_date: policy.start_date,
        end_date: policy.end_date,
        category: category.category_name.clone(),
        carrier: carrier.company_name.clone(),
        user: UserSummary::from_user(user),
    })
}

#[async_trait]
impl PolicyStore for MemStore {
    async fn get_or_create_agent(&self, agent_name: &str) -> Result<(Agent, bool)> {
        let name = agent_name.trim();
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.agents.iter().find(|a| a.agent_name == name) {
            return Ok((existing.clone(), false));
        }
        let now = Utc::now();
        let agent = Agent {
            id: Uuid::new_v4(),
            agent_name: name.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.agents.push(agent.clone());
        Ok((agent, true))
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.inner.read().await.agents.clone())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = normalize_email(email);
        let inner = self.inner.read().await;
        Ok(inner.users.iter().find(|u| u.email == email).cloned())
    }

    async fn create_user(&self, draft: NewUser) -> Result<User> {
        let email = normalize_email(&draft.email);
        let mut inner = self.inner.write().await;
        if inner.users.iter().any(|u| u.email == email) {
            return Err(StoreError::Duplicate {
                entity: "user",
                key: email,
            });
        }
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            first_name: draft.first_name,
            last_name: draft.last_name,
            date_of_birth: draft.date_of_birth,
            address: draft.address,
            phone_number: draft.phone_number,
            email,
            gender: draft.gender,
            user_type: draft.user_type,
            created_at: now,
            updated_at: now,
        };
        inner.users.push(user.clone());
        Ok(user)
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.inner.read().await.users.clone())
    }

    async fn find_user_by_name_fragment(&self, fragment: &str) -> Result<Option<User>> {
        let needle = fragment.to_ascii_lowercase();
        let inner = self.inner.read().await;
        Ok(inner
            .users
            .iter()
            .find(|u| u.first_name.to_ascii_lowercase().contains(&needle))
            .cloned())
    }

    async fn get_or_create_account(
        &self,
        user_id: Uuid,
        account_name: &str,
    ) -> Result<(UserAccount, bool)> {
        let name = account_name.trim();
        let mut inner = self.inner.write().await;
        if !inner.users.iter().any(|u| u.id == user_id) {
            return Err(StoreError::NotFound { entity: "user" });
        }
        if let Some(existing) = inner
            .accounts
            .iter()
            .find(|a| a.user_id == user_id && a.account_name == name)
        {
            return Ok((existing.clone(), false));
        }
        let now = Utc::now();
        let account = UserAccount {
            id: Uuid::new_v4(),
            account_name: name.to_string(),
            user_id,
            created_at: now,
            updated_at: now,
        };
        inner.accounts.push(account.clone());
        Ok((account, true))
    }

    async fn get_or_create_category(&self, category_name: &str) -> Result<(PolicyCategory, bool)> {
        let name = category_name.trim();
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.categories.iter().find(|c| c.category_name == name) {
            return Ok((existing.clone(), false));
        }
        let now = Utc::now();
        let category = PolicyCategory {
            id: Uuid::new_v4(),
            category_name: name.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.categories.push(category.clone());
        Ok((category, true))
    }

    async fn get_or_create_carrier(&self, company_name: &str) -> Result<(PolicyCarrier, bool)> {
        let name = company_name.trim();
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.carriers.iter().find(|c| c.company_name == name) {
            return Ok((existing.clone(), false));
        }
        let now = Utc::now();
        let carrier = PolicyCarrier {
            id: Uuid::new_v4(),
            company_name: name.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.carriers.push(carrier.clone());
        Ok((carrier, true))
    }

    async fn find_policy_by_number(&self, policy_number: &str) -> Result<Option<Policy>> {
        let number = policy_number.trim();
        let inner = self.inner.read().await;
        Ok(inner
            .policies
            .iter()
            .find(|p| p.policy_number == number)
            .cloned())
    }

    async fn create_policy(&self, draft: NewPolicy) -> Result<Policy> {
        validate_policy_dates(draft.start_date, draft.end_date)?;
        let number = draft.policy_number.trim().to_string();
        let mut inner = self.inner.write().await;
        if inner.policies.iter().any(|p| p.policy_number == number) {
            return Err(StoreError::Duplicate {
                entity: "policy",
                key: number,
            });
        }
        if !inner.users.iter().any(|u| u.id == draft.user_id)
            || !inner.categories.iter().any(|c| c.id == draft.category_id)
            || !inner.carriers.iter().any(|c| c.id == draft.carrier_id)
        {
            return Err(StoreError::Invalid(format!(
                "policy {number} references a missing user, category or carrier"
            )));
        }
        let now = Utc::now();
        let policy = Policy {
            id: Uuid::new_v4(),
            policy_number: number,
            start_date: draft.start_date,
            end_date: draft.end_date,
            category_id: draft.category_id,
            carrier_id: draft.carrier_id,
            user_id: draft.user_id,
            created_at: now,
            updated_at: now,
        };
        inner.policies.push(policy.clone());
        Ok(policy)
    }

    async fn list_policies(&self) -> Result<Vec<PolicyView>> {
        let inner = self.inner.read().await;
        Ok(inner
            .policies
            .iter()
            .filter_map(|p| policy_view(&inner, p))
            .collect())
    }

    async fn policies_for_user(&self, user_id: Uuid) -> Result<Vec<PolicyView>> {
        let inner = self.inner.read().await;
        Ok(inner
            .policies
            .iter()
            .filter(|p| p.user_id == user_id)
            .filter_map(|p| policy_view(&inner, p))
            .collect())
    }

    async fn create_message(
        &self,
        message: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<ScheduledMessage> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let record = ScheduledMessage {
            id: Uuid::new_v4(),
            message: message.to_string(),
            scheduled_at,
            status: MessageStatus::Pending,
            activated_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.messages.push(record.clone());
        Ok(record)
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<ScheduledMessage>> {
        let inner = self.inner.read().await;
        Ok(inner.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn list_messages(&self) -> Result<Vec<ScheduledMessage>> {
        let mut messages = self.inner.read().await.messages.clone();
        messages.sort_by_key(|m| m.scheduled_at);
        Ok(messages)
    }

    async fn complete_due_messages(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledMessage>> {
        let mut inner = self.inner.write().await;
        let mut claimed = Vec::new();
        for message in inner.messages.iter_mut() {
            if message.status == MessageStatus::Pending && message.scheduled_at <= now {
                message.status = MessageStatus::Completed;
                message.activated_at = Some(now);
                message.updated_at = now;
                claimed.push(message.clone());
            }
        }
        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed due messages");
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn draft_user(email: &str) -> NewUser {
        NewUser {
            first_name: "Jane".into(),
            last_name: "Doe".into(),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
            address: Address {
                street: "1 Main St".into(),
                city: "Springfield".into(),
                state: "IL".into(),
                zip_code: "62701".into(),
            },
            phone_number: "555-0100".into(),
            email: email.into(),
            gender: Gender::Female,
            user_type: "Standard".into(),
        }
    }

    #[tokio::test]
    async fn agent_get_or_create_is_idempotent() {
        let store = MemStore::new();
        let (first, created) = store.get_or_create_agent("  Sam Rivers ").await.unwrap();
        assert!(created);
        let (second, created) = store.get_or_create_agent("Sam Rivers").await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn user_email_is_normalized_and_unique() {
        let store = MemStore::new();
        store.create_user(draft_user("Jane@Example.COM")).await.unwrap();
        let found = store.find_user_by_email("jane@example.com").await.unwrap();
        assert!(found.is_some());
        let err = store.create_user(draft_user("JANE@example.com")).await;
        assert!(matches!(err, Err(StoreError::Duplicate { entity: "user", .. })));
    }

    #[tokio::test]
    async fn name_fragment_match_is_case_insensitive() {
        let store = MemStore::new();
        store.create_user(draft_user("jane@example.com")).await.unwrap();
        assert!(store.find_user_by_name_fragment("AN").await.unwrap().is_some());
        assert!(store.find_user_by_name_fragment("zzz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn policy_requires_existing_references_and_ordered_dates() {
        let store = MemStore::new();
        let user = store.create_user(draft_user("jane@example.com")).await.unwrap();
        let (category, _) = store.get_or_create_category("Auto").await.unwrap();
        let (carrier, _) = store.get_or_create_carrier("Acme Mutual").await.unwrap();

        let draft = NewPolicy {
            policy_number: "P-100".into(),
            start_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            category_id: category.id,
            carrier_id: carrier.id,
            user_id: user.id,
        };
        store.create_policy(draft.clone()).await.unwrap();

        // Duplicate policy number.
        let err = store.create_policy(draft.clone()).await;
        assert!(matches!(err, Err(StoreError::Duplicate { entity: "policy", .. })));

        // Dangling user reference.
        let mut dangling = draft.clone();
        dangling.policy_number = "P-101".into();
        dangling.user_id = Uuid::new_v4();
        assert!(matches!(store.create_policy(dangling).await, Err(StoreError::Invalid(_))));

        // Inverted dates.
        let mut inverted = draft;
        inverted.policy_number = "P-102".into();
        inverted.start_date = NaiveDate::from_ymd_opt(2027, 1, 1).unwrap();
        assert!(matches!(store.create_policy(inverted).await, Err(StoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn account_requires_existing_user() {
        let store = MemStore::new();
        let err = store.get_or_create_account(Uuid::new_v4(), "Household").await;
        assert!(matches!(err, Err(StoreError::NotFound { entity: "user" })));

        let user = store.create_user(draft_user("jane@example.com")).await.unwrap();
        let (_, created) = store.get_or_create_account(user.id, "Household").await.unwrap();
        assert!(created);
        let (_, created) = store.get_or_create_account(user.id, "Household").await.unwrap();
        assert!(!created);
    }

    #[tokio::test]
    async fn due_sweep_claims_only_due_pending_messages() {
        let store = MemStore::new();
        let now = Utc::now();
        let due = store
            .create_message("renewal reminder", now - Duration::seconds(30))
            .await
            .unwrap();
        let future = store
            .create_message("later", now + Duration::hours(1))
            .await
            .unwrap();

        let claimed = store.complete_due_messages(now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due.id);
        assert_eq!(claimed[0].status, MessageStatus::Completed);
        assert!(claimed[0].activated_at.is_some());

        let untouched = store.get_message(future.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, MessageStatus::Pending);

        // Second sweep finds nothing: the transition is one-way.
        assert!(store.complete_due_messages(now).await.unwrap().is_empty());
    }
}
