//! Database schema definitions

/// SQL to create all tables
/// NOTE: All timestamps are epoch milliseconds; maps are stored as JSON TEXT
pub const CREATE_TABLES: &str = r#"
-- One benchmark per address (latest known peer-group ranking)
CREATE TABLE IF NOT EXISTS benchmark_records (
    address TEXT PRIMARY KEY NOT NULL,
    peer_group_id TEXT NOT NULL,
    overall_score REAL NOT NULL DEFAULT 0,
    overall_percentile REAL NOT NULL DEFAULT 0,
    component_scores TEXT NOT NULL DEFAULT '{}',
    component_percentiles TEXT NOT NULL DEFAULT '{}',
    benchmark_timestamp INTEGER NOT NULL,
    last_updated INTEGER NOT NULL,
    update_frequency_seconds INTEGER NOT NULL DEFAULT 300,
    is_stale INTEGER NOT NULL DEFAULT 0
);

-- Append-only peer group distribution snapshots
CREATE TABLE IF NOT EXISTS peer_group_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    peer_group_id TEXT NOT NULL,
    member_count INTEGER NOT NULL DEFAULT 0,
    average_score REAL NOT NULL DEFAULT 0,
    score_distribution TEXT NOT NULL,
    snapshot_timestamp INTEGER NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1
);

-- Background refresh queue
CREATE TABLE IF NOT EXISTS benchmark_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_type TEXT NOT NULL,
    target_address TEXT,
    peer_group_id TEXT,
    priority TEXT NOT NULL DEFAULT 'LOW',
    status TEXT NOT NULL DEFAULT 'PENDING',
    created_at INTEGER NOT NULL,
    scheduled_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3
);

-- Latest metrics + score supplied by upstream collaborators
CREATE TABLE IF NOT EXISTS address_inputs (
    address TEXT PRIMARY KEY NOT NULL,
    metrics TEXT NOT NULL,
    transactions TEXT NOT NULL DEFAULT '[]',
    score REAL NOT NULL,
    components TEXT NOT NULL DEFAULT '{}',
    updated_at INTEGER NOT NULL
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_benchmark_group ON benchmark_records(peer_group_id);
CREATE INDEX IF NOT EXISTS idx_benchmark_stale ON benchmark_records(is_stale, last_updated);
CREATE INDEX IF NOT EXISTS idx_snapshot_group ON peer_group_snapshots(peer_group_id, snapshot_timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_jobs_pending ON benchmark_jobs(status, scheduled_at);
CREATE INDEX IF NOT EXISTS idx_jobs_address ON benchmark_jobs(target_address, job_type)
"#;

/// Columns added after the first release. Re-running them yields
/// "duplicate column name", which the migration runner tolerates.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE benchmark_records ADD COLUMN classification_confidence REAL NOT NULL DEFAULT 30",
];
