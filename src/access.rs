use crate::error::{OrganizerError, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

/// Identity of the caller, taken from `params.userId`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: Option<i64>,
}

impl RequestContext {
    pub fn from_params(params: &Value) -> Self {
        Self {
            user_id: params.get("userId").and_then(|v| v.as_i64()),
        }
    }

    fn require_user(&self) -> Result<i64> {
        self.user_id
            .ok_or_else(|| OrganizerError::Authorization("missing userId".to_string()))
    }
}

pub fn is_admin(conn: &Connection, user_id: i64) -> Result<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM access_admins WHERE user_id = ?",
            [user_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

fn is_scheduler(conn: &Connection, user_id: i64, organization_id: i64) -> Result<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM access_schedulers WHERE user_id = ? AND organization_id = ?",
            (user_id, organization_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

/// Schedule writes need administrator rights or a scheduler grant for the
/// organization.
pub fn require_scheduler(conn: &Connection, ctx: &RequestContext, organization_id: i64) -> Result<()> {
    let user_id = ctx.require_user()?;
    if is_admin(conn, user_id)? || is_scheduler(conn, user_id, organization_id)? {
        return Ok(());
    }
    Err(OrganizerError::Authorization(format!(
        "user {} may not schedule for organization {}",
        user_id, organization_id
    )))
}

pub fn require_admin(conn: &Connection, ctx: &RequestContext) -> Result<()> {
    let user_id = ctx.require_user()?;
    if is_admin(conn, user_id)? {
        return Ok(());
    }
    Err(OrganizerError::Authorization(format!(
        "user {} is not an administrator",
        user_id
    )))
}

/// Access table is empty: nobody has been granted anything yet. The first
/// admin grant is then allowed without credentials so a workspace can be
/// bootstrapped.
fn is_unconfigured(conn: &Connection) -> Result<bool> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM access_admins", [], |r| r.get(0))?;
    Ok(n == 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Admin,
    Scheduler { organization_id: i64 },
}

impl Grant {
    pub fn from_params(params: &Value) -> Result<Self> {
        match params.get("role").and_then(|v| v.as_str()) {
            Some("admin") => Ok(Grant::Admin),
            Some("scheduler") => {
                let organization_id = params
                    .get("organizationId")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| OrganizerError::BadParams("missing organizationId".into()))?;
                Ok(Grant::Scheduler { organization_id })
            }
            _ => Err(OrganizerError::BadParams(
                "role must be admin or scheduler".into(),
            )),
        }
    }
}

pub fn grant(conn: &Connection, ctx: &RequestContext, target_user: i64, g: Grant) -> Result<()> {
    let bootstrap = g == Grant::Admin && is_unconfigured(conn)?;
    if !bootstrap {
        require_admin(conn, ctx)?;
    }
    match g {
        Grant::Admin => conn.execute(
            "INSERT OR IGNORE INTO access_admins(user_id) VALUES(?)",
            [target_user],
        )?,
        Grant::Scheduler { organization_id } => conn.execute(
            "INSERT OR IGNORE INTO access_schedulers(user_id, organization_id) VALUES(?, ?)",
            (target_user, organization_id),
        )?,
    };
    Ok(())
}

pub fn revoke(conn: &Connection, ctx: &RequestContext, target_user: i64, g: Grant) -> Result<bool> {
    require_admin(conn, ctx)?;
    let n = match g {
        Grant::Admin => conn.execute("DELETE FROM access_admins WHERE user_id = ?", [target_user])?,
        Grant::Scheduler { organization_id } => conn.execute(
            "DELETE FROM access_schedulers WHERE user_id = ? AND organization_id = ?",
            (target_user, organization_id),
        )?,
    };
    Ok(n > 0)
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessList {
    pub admins: Vec<i64>,
    pub schedulers: Vec<SchedulerGrant>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerGrant {
    pub user_id: i64,
    pub organization_id: i64,
}

pub fn list(conn: &Connection) -> Result<AccessList> {
    let mut out = AccessList::default();
    let mut stmt = conn.prepare("SELECT user_id FROM access_admins ORDER BY user_id")?;
    out.admins = stmt
        .query_map([], |r| r.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    let mut stmt = conn.prepare(
        "SELECT user_id, organization_id FROM access_schedulers ORDER BY user_id, organization_id",
    )?;
    out.schedulers = stmt
        .query_map([], |r| {
            Ok(SchedulerGrant {
                user_id: r.get(0)?,
                organization_id: r.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(out)
}
