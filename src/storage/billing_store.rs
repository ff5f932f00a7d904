//! Billing rule and tag project storage.
//!
//! Provides CRUD for billing configs and tag projects, and the two reads the
//! billing index is rebuilt from.

use std::str::FromStr;

use crate::storage::StorageError;
use crate::storage::db::SqlitePool;
use crate::storage::facades::now_millis;
use crate::storage::types::{
    BillingConfigRecord, MatchType, NewBillingConfig, ProjectType, TagProject,
};

/// Name given to the billing project when it has to be created.
pub const DEFAULT_BILLING_PROJECT: &str = "billing";

type ConfigRow = (i64, String, String, String, String, f64, String);

fn config_from_row(row: ConfigRow) -> Result<BillingConfigRecord, StorageError> {
    let (id, bill_key, billing_tag, match_type, match_value, unit_price, description) = row;
    let match_type = MatchType::from_str(&match_type).map_err(|_| {
        StorageError::InvalidData(format!(
            "billing config {id}: unknown match_type '{match_type}'"
        ))
    })?;
    Ok(BillingConfigRecord {
        id,
        bill_key,
        billing_tag,
        match_type,
        match_value,
        unit_price,
        description,
    })
}

fn project_from_row(
    (id, name, project_type, description): (i64, String, String, String),
) -> TagProject {
    TagProject {
        id,
        name,
        project_type: ProjectType::from_str(&project_type).unwrap_or_default(),
        description,
    }
}

fn validate_config(config: &NewBillingConfig) -> Result<(), StorageError> {
    if config.bill_key.trim().is_empty() {
        return Err(StorageError::InvalidData("bill_key cannot be empty".to_string()));
    }
    if config.match_value.is_empty() {
        return Err(StorageError::InvalidData(
            "match_value cannot be empty".to_string(),
        ));
    }
    if !config.unit_price.is_finite() || config.unit_price < 0.0 {
        return Err(StorageError::InvalidData(format!(
            "unit_price must be a non-negative number, got {}",
            config.unit_price
        )));
    }
    Ok(())
}

/// Billing rule and tag project storage facade.
#[derive(Clone)]
pub struct BillingStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for BillingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BillingStore").finish_non_exhaustive()
    }
}

impl BillingStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Projects
    // =========================================================================

    /// The single billing project, if it exists.
    pub async fn billing_project(&self) -> Result<Option<TagProject>, StorageError> {
        let row: Option<(i64, String, String, String)> = sqlx::query_as(
            "SELECT id, name, type, description FROM tag_projects WHERE type = 'billing'",
        )
        .fetch_optional(self.pool.inner())
        .await?;
        Ok(row.map(project_from_row))
    }

    /// Return the billing project, creating it when missing.
    pub async fn ensure_billing_project(&self) -> Result<TagProject, StorageError> {
        if let Some(project) = self.billing_project().await? {
            return Ok(project);
        }

        let now = now_millis();
        sqlx::query(
            "INSERT INTO tag_projects (name, type, description, created_at, updated_at)
             VALUES (?, 'billing', 'Tags evaluated against billing rules', ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(DEFAULT_BILLING_PROJECT)
        .bind(now)
        .bind(now)
        .execute(self.pool.inner())
        .await?;

        match self.billing_project().await? {
            Some(project) => {
                tracing::info!(project = %project.name, id = project.id, "Billing project ready");
                Ok(project)
            }
            None => Err(StorageError::InvalidData(format!(
                "cannot create billing project: name '{DEFAULT_BILLING_PROJECT}' is taken by another project"
            ))),
        }
    }

    /// Create a tag project.
    ///
    /// Only one billing project may exist.
    pub async fn create_project(
        &self,
        name: &str,
        project_type: ProjectType,
        description: &str,
    ) -> Result<TagProject, StorageError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StorageError::InvalidData(
                "project name cannot be empty".to_string(),
            ));
        }
        if project_type == ProjectType::Billing && self.billing_project().await?.is_some() {
            return Err(StorageError::InvalidData(
                "a billing project already exists".to_string(),
            ));
        }

        let now = now_millis();
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO tag_projects (name, type, description, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(project_type.as_ref())
        .bind(description)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool.inner())
        .await?;

        Ok(TagProject {
            id,
            name: name.to_string(),
            project_type,
            description: description.to_string(),
        })
    }

    /// All projects ordered by id.
    pub async fn list_projects(&self) -> Result<Vec<TagProject>, StorageError> {
        let rows: Vec<(i64, String, String, String)> =
            sqlx::query_as("SELECT id, name, type, description FROM tag_projects ORDER BY id")
                .fetch_all(self.pool.inner())
                .await?;
        Ok(rows.into_iter().map(project_from_row).collect())
    }

    /// Delete a non-billing project, detaching its tags.
    pub async fn delete_project(&self, id: i64) -> Result<(), StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT type FROM tag_projects WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.inner())
            .await?;
        match row {
            None => return Err(StorageError::NotFound(format!("project {id}"))),
            Some((t,)) if t == ProjectType::Billing.as_ref() => {
                return Err(StorageError::InvalidData(
                    "the billing project cannot be deleted".to_string(),
                ));
            }
            Some(_) => {}
        }

        let mut tx = self.pool.begin_write().await?;
        sqlx::query("UPDATE tags SET project_id = NULL, updated_at = ? WHERE project_id = ?")
            .bind(now_millis())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tag_projects WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Assign a tag to a project by name, or detach it with `None`.
    ///
    /// The tag is registered if it was never seen.
    pub async fn assign_tag_project(
        &self,
        tag: &str,
        project: Option<&str>,
    ) -> Result<(), StorageError> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(StorageError::InvalidData("tag cannot be empty".to_string()));
        }

        let project_id = match project {
            Some(name) => {
                let row: Option<(i64,)> =
                    sqlx::query_as("SELECT id FROM tag_projects WHERE name = ?")
                        .bind(name)
                        .fetch_optional(self.pool.inner())
                        .await?;
                match row {
                    Some((id,)) => Some(id),
                    None => return Err(StorageError::NotFound(format!("project '{name}'"))),
                }
            }
            None => None,
        };

        let now = now_millis();
        sqlx::query(
            "INSERT INTO tags (name, project_id, created_at, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (name) DO UPDATE SET
                 project_id = excluded.project_id,
                 updated_at = excluded.updated_at",
        )
        .bind(tag)
        .bind(project_id)
        .bind(now)
        .bind(now)
        .execute(self.pool.inner())
        .await?;
        Ok(())
    }

    /// Names of every tag assigned to the billing project.
    pub async fn load_billing_tags(&self) -> Result<Vec<String>, StorageError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT t.name FROM tags t
             JOIN tag_projects p ON t.project_id = p.id
             WHERE p.type = 'billing'
             ORDER BY t.name",
        )
        .fetch_all(self.pool.inner())
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    // =========================================================================
    // Billing configs
    // =========================================================================

    /// Every billing rule, ordered by id.
    ///
    /// Rows with an unknown match type are skipped with a warning.
    pub async fn load_configs(&self) -> Result<Vec<BillingConfigRecord>, StorageError> {
        let rows: Vec<ConfigRow> = sqlx::query_as(
            "SELECT id, bill_key, billing_tag, match_type, match_value, unit_price, description
             FROM billing_configs ORDER BY id",
        )
        .fetch_all(self.pool.inner())
        .await?;

        let mut configs = Vec::with_capacity(rows.len());
        for row in rows {
            match config_from_row(row) {
                Ok(config) => configs.push(config),
                Err(e) => tracing::warn!(error = %e, "Skipping billing config"),
            }
        }
        Ok(configs)
    }

    /// Fetch one billing rule.
    pub async fn get_config(&self, id: i64) -> Result<Option<BillingConfigRecord>, StorageError> {
        let row: Option<ConfigRow> = sqlx::query_as(
            "SELECT id, bill_key, billing_tag, match_type, match_value, unit_price, description
             FROM billing_configs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool.inner())
        .await?;
        row.map(config_from_row).transpose()
    }

    /// Create a billing rule.
    pub async fn create_config(
        &self,
        config: &NewBillingConfig,
    ) -> Result<BillingConfigRecord, StorageError> {
        validate_config(config)?;

        let now = now_millis();
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO billing_configs
                 (bill_key, billing_tag, match_type, match_value, unit_price, description, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(config.bill_key.trim())
        .bind(&config.billing_tag)
        .bind(config.match_type.as_ref())
        .bind(&config.match_value)
        .bind(config.unit_price)
        .bind(&config.description)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool.inner())
        .await?;

        Ok(BillingConfigRecord {
            id,
            bill_key: config.bill_key.trim().to_string(),
            billing_tag: config.billing_tag.clone(),
            match_type: config.match_type,
            match_value: config.match_value.clone(),
            unit_price: config.unit_price,
            description: config.description.clone(),
        })
    }

    /// Replace a billing rule's fields.
    pub async fn update_config(
        &self,
        id: i64,
        config: &NewBillingConfig,
    ) -> Result<BillingConfigRecord, StorageError> {
        validate_config(config)?;

        let result = sqlx::query(
            "UPDATE billing_configs SET
                 bill_key = ?, billing_tag = ?, match_type = ?, match_value = ?,
                 unit_price = ?, description = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(config.bill_key.trim())
        .bind(&config.billing_tag)
        .bind(config.match_type.as_ref())
        .bind(&config.match_value)
        .bind(config.unit_price)
        .bind(&config.description)
        .bind(now_millis())
        .bind(id)
        .execute(self.pool.inner())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("billing config {id}")));
        }
        self.get_config(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("billing config {id}")))
    }

    /// Delete a billing rule. Returns false when it did not exist.
    pub async fn delete_config(&self, id: i64) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM billing_configs WHERE id = ?")
            .bind(id)
            .execute(self.pool.inner())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
