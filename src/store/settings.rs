use crate::config::DefaultSettings;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// Settings envelope shared by the session-level `settings` column and the
/// process-wide singleton row (spec.md §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPayload {
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub default_directory: Option<String>,
}

/// Fully resolved settings after merging a session's overrides over the
/// process-wide defaults (SPEC_FULL.md §2).
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub max_turns: u32,
    pub permission_mode: String,
    pub default_directory: Option<String>,
}

impl ResolvedSettings {
    pub fn merge(session_settings: Option<&str>, defaults: &DefaultSettings) -> Self {
        let parsed: Option<SettingsPayload> = session_settings.and_then(|s| serde_json::from_str(s).ok());
        Self {
            max_turns: parsed.as_ref().and_then(|p| p.max_turns).unwrap_or(defaults.max_turns),
            permission_mode: parsed
                .as_ref()
                .and_then(|p| p.permission_mode.clone())
                .unwrap_or_else(|| defaults.permission_mode.clone()),
            default_directory: parsed.and_then(|p| p.default_directory),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SettingsRow {
    #[allow(dead_code)]
    id: String,
    max_turns: i64,
    permission_mode: String,
    default_directory: Option<String>,
}

#[derive(Clone)]
pub struct SettingsRepo {
    pool: SqlitePool,
}

impl SettingsRepo {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Read the process-wide singleton, seeding it with `defaults` on first
    /// boot if the row does not yet exist.
    pub async fn get_or_init(&self, defaults: &DefaultSettings) -> Result<ResolvedSettings> {
        let existing: Option<SettingsRow> =
            sqlx::query_as("SELECT * FROM settings WHERE id = 'singleton'")
                .fetch_optional(&self.pool)
                .await?;

        if let Some(row) = existing {
            return Ok(ResolvedSettings {
                max_turns: row.max_turns as u32,
                permission_mode: row.permission_mode,
                default_directory: row.default_directory,
            });
        }

        sqlx::query(
            "INSERT INTO settings (id, max_turns, permission_mode, default_directory)
             VALUES ('singleton', ?, ?, NULL)",
        )
        .bind(defaults.max_turns)
        .bind(&defaults.permission_mode)
        .execute(&self.pool)
        .await?;

        Ok(ResolvedSettings {
            max_turns: defaults.max_turns,
            permission_mode: defaults.permission_mode.clone(),
            default_directory: None,
        })
    }

    pub async fn update(&self, payload: &SettingsPayload) -> Result<()> {
        if let Some(max_turns) = payload.max_turns {
            sqlx::query("UPDATE settings SET max_turns = ? WHERE id = 'singleton'")
                .bind(max_turns)
                .execute(&self.pool)
                .await?;
        }
        if let Some(mode) = &payload.permission_mode {
            sqlx::query("UPDATE settings SET permission_mode = ? WHERE id = 'singleton'")
                .bind(mode)
                .execute(&self.pool)
                .await?;
        }
        if let Some(dir) = &payload.default_directory {
            sqlx::query("UPDATE settings SET default_directory = ? WHERE id = 'singleton'")
                .bind(dir)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_inherits_missing_fields_from_defaults() {
        let defaults = DefaultSettings {
            max_turns: 200,
            permission_mode: "default".to_string(),
        };
        let resolved = ResolvedSettings::merge(Some(r#"{"permissionMode":"plan"}"#), &defaults);
        assert_eq!(resolved.max_turns, 200);
        assert_eq!(resolved.permission_mode, "plan");
    }

    #[test]
    fn merge_with_no_session_settings_uses_defaults() {
        let defaults = DefaultSettings {
            max_turns: 50,
            permission_mode: "plan".to_string(),
        };
        let resolved = ResolvedSettings::merge(None, &defaults);
        assert_eq!(resolved.max_turns, 50);
        assert_eq!(resolved.permission_mode, "plan");
    }
}
