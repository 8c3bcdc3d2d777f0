//! SQL query constants
//!
//! Contains all SQL used by the Postgres adapters.

/// Tables created on startup, in dependency order
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS groups (
        id UUID PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        admin_id UUID NOT NULL,
        governance JSONB,
        settings JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS group_members (
        group_id UUID NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
        user_id UUID NOT NULL,
        active BOOLEAN NOT NULL DEFAULT true,
        joined_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        removed_at TIMESTAMPTZ,
        PRIMARY KEY (group_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS loans (
        id UUID PRIMARY KEY,
        group_id UUID NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
        borrower_id UUID NOT NULL,
        amount BIGINT NOT NULL,
        status VARCHAR(32) NOT NULL DEFAULT 'pending',
        approved_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS governance_proposals (
        id UUID PRIMARY KEY,
        group_id UUID NOT NULL,
        status VARCHAR(16) NOT NULL,
        version BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        document JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_governance_proposals_group ON governance_proposals(group_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_governance_proposals_open ON governance_proposals(status) WHERE status = 'Open'",
];

pub const INSERT_PROPOSAL: &str = r#"
    INSERT INTO governance_proposals (id, group_id, status, version, created_at, expires_at, document)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
"#;

pub const GET_PROPOSAL: &str = r#"
    SELECT version, document
    FROM governance_proposals
    WHERE id = $1 AND group_id = $2
"#;

/// Conditional write: zero affected rows means another writer won
pub const UPDATE_PROPOSAL_IF_VERSION: &str = r#"
    UPDATE governance_proposals
    SET status = $3, version = $4, expires_at = $5, document = $6
    WHERE id = $1 AND version = $2
"#;

pub const PROPOSAL_EXISTS: &str = "SELECT 1 FROM governance_proposals WHERE id = $1";

pub const LIST_PROPOSALS_BY_GROUP: &str = r#"
    SELECT version, document
    FROM governance_proposals
    WHERE group_id = $1 AND ($2::VARCHAR IS NULL OR status = $2)
    ORDER BY created_at DESC
"#;

pub const LIST_OPEN_PROPOSALS: &str = r#"
    SELECT version, document
    FROM governance_proposals
    WHERE status = 'Open'
"#;

pub const GET_GROUP: &str = "SELECT admin_id, governance FROM groups WHERE id = $1";

pub const GET_GROUP_SETTINGS: &str = "SELECT settings FROM groups WHERE id = $1";

pub const LIST_ACTIVE_MEMBERS: &str = r#"
    SELECT user_id
    FROM group_members
    WHERE group_id = $1 AND active = true
    ORDER BY joined_at
"#;

/// Merge fields into the settings document; `||` overwrites matching keys
pub const MERGE_GROUP_SETTINGS: &str = r#"
    UPDATE groups SET settings = settings || $2 WHERE id = $1
"#;

pub const DEACTIVATE_MEMBER: &str = r#"
    UPDATE group_members
    SET active = false, removed_at = COALESCE(removed_at, now())
    WHERE group_id = $1 AND user_id = $2
"#;

/// Idempotent: an already approved loan keeps its original timestamp
pub const APPROVE_LOAN: &str = r#"
    UPDATE loans
    SET status = 'approved', approved_at = COALESCE(approved_at, now())
    WHERE id = $1 AND group_id = $2 AND borrower_id = $3
"#;
