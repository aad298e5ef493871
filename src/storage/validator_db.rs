use crate::core::{
    decimal_u256, unix_now_ms, Job, MinerScore, RebalanceHistoryEntry, Round, RoundStatus,
    RoundType, MIN_LIVE_PARTICIPATION_DAYS, MS_PER_DAY,
};
use crate::engine::backtester::{SwapEvent, SwapEventSource};
use crate::protocols::uniswap_v3::sqrt_price_x96_to_price;
use crate::storage::{
    blend_combined_score, ExecutionStatus, JobRepository, LiveExecution, MinerVault,
    NewLiveExecution, RebalanceDecision, ScoreUpdate, VaultRepository, VaultSnapshot,
};
use alloy::primitives::{Address, U256};
use anyhow::Context;
use async_trait::async_trait;
use rusqlite::ffi::ErrorCode;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const JOB_COLUMNS: &str = "job_id, sn_liquidity_manager_address, pair_address, chain_id, fee_rate, \
     round_duration_seconds, is_active";
const ROUND_COLUMNS: &str =
    "round_id, job_id, round_type, round_number, start_block, deadline_ms, status, winner_uid";
const SCORE_COLUMNS: &str = "job_id, miner_uid, miner_hotkey, evaluation_score, live_score, \
     combined_score, participation_days, first_participation_ms, last_participation_ms, \
     total_rounds, accepted_rounds, is_eligible";
const VAULT_COLUMNS: &str = "miner_uid, miner_hotkey, vault_address, chain_id, is_verified, \
     is_active, minimum_balance_usd, registered_at_ms, verified_at_ms";
const SNAPSHOT_COLUMNS: &str =
    "vault_address, token0_balance, token1_balance, total_value_usd, block_number, timestamp_ms";

#[derive(Debug, Clone)]
pub struct ValidatorDb {
    path: PathBuf,
}

impl ValidatorDb {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = Self {
            path: path.as_ref().to_path_buf(),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> anyhow::Result<()> {
        self.with_connection("ensure_schema", |conn| {
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS jobs (
                    job_id TEXT PRIMARY KEY NOT NULL,
                    sn_liquidity_manager_address TEXT NOT NULL,
                    pair_address TEXT NOT NULL,
                    chain_id INTEGER NOT NULL,
                    fee_rate REAL NOT NULL,
                    round_duration_seconds INTEGER NOT NULL,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    updated_at_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS rounds (
                    round_id TEXT PRIMARY KEY NOT NULL,
                    job_id TEXT NOT NULL,
                    round_type TEXT NOT NULL,
                    round_number INTEGER NOT NULL,
                    start_block INTEGER NOT NULL,
                    deadline_ms INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    winner_uid INTEGER,
                    performance TEXT,
                    created_at_ms INTEGER NOT NULL,
                    completed_at_ms INTEGER,
                    UNIQUE(job_id, round_type, round_number)
                );
                CREATE INDEX IF NOT EXISTS idx_rounds_job_type ON rounds(job_id, round_type, status);

                CREATE TABLE IF NOT EXISTS rebalance_decisions (
                    round_id TEXT NOT NULL,
                    job_id TEXT NOT NULL,
                    miner_uid INTEGER NOT NULL,
                    miner_hotkey TEXT NOT NULL,
                    accepted INTEGER NOT NULL,
                    rebalance_history TEXT,
                    refusal_reason TEXT,
                    response_time_ms INTEGER NOT NULL DEFAULT 0,
                    created_at_ms INTEGER NOT NULL,
                    PRIMARY KEY (round_id, miner_uid)
                );

                CREATE TABLE IF NOT EXISTS miner_scores (
                    job_id TEXT NOT NULL,
                    miner_uid INTEGER NOT NULL,
                    miner_hotkey TEXT NOT NULL,
                    evaluation_score REAL NOT NULL DEFAULT 0,
                    live_score REAL NOT NULL DEFAULT 0,
                    combined_score REAL NOT NULL DEFAULT 0,
                    participation_days INTEGER NOT NULL DEFAULT 0,
                    first_participation_ms INTEGER,
                    last_participation_ms INTEGER,
                    total_rounds INTEGER NOT NULL DEFAULT 0,
                    accepted_rounds INTEGER NOT NULL DEFAULT 0,
                    is_eligible INTEGER NOT NULL DEFAULT 0,
                    updated_at_ms INTEGER NOT NULL,
                    PRIMARY KEY (job_id, miner_uid)
                );

                CREATE TABLE IF NOT EXISTS live_executions (
                    execution_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    round_id TEXT NOT NULL,
                    job_id TEXT NOT NULL,
                    miner_uid INTEGER NOT NULL,
                    strategy TEXT NOT NULL,
                    tx_hash TEXT,
                    tx_status TEXT NOT NULL,
                    error TEXT,
                    created_at_ms INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_live_executions_round ON live_executions(round_id);

                CREATE TABLE IF NOT EXISTS miner_vaults (
                    vault_address TEXT PRIMARY KEY NOT NULL,
                    miner_uid INTEGER NOT NULL,
                    miner_hotkey TEXT NOT NULL,
                    chain_id INTEGER NOT NULL,
                    is_verified INTEGER NOT NULL DEFAULT 0,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    minimum_balance_usd REAL NOT NULL,
                    registered_at_ms INTEGER NOT NULL,
                    verified_at_ms INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_miner_vaults_uid ON miner_vaults(miner_uid, is_active);

                CREATE TABLE IF NOT EXISTS vault_snapshots (
                    snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    vault_address TEXT NOT NULL,
                    token0_balance TEXT NOT NULL,
                    token1_balance TEXT NOT NULL,
                    total_value_usd REAL NOT NULL,
                    block_number INTEGER NOT NULL,
                    timestamp_ms INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_vault_snapshots_vault_ts
                    ON vault_snapshots(vault_address, timestamp_ms);

                CREATE TABLE IF NOT EXISTS swaps (
                    pool_address TEXT NOT NULL,
                    block_number INTEGER NOT NULL,
                    log_index INTEGER NOT NULL,
                    sqrt_price_x96 TEXT NOT NULL,
                    tick INTEGER NOT NULL,
                    amount0 REAL NOT NULL,
                    amount1 REAL NOT NULL,
                    liquidity REAL,
                    PRIMARY KEY (pool_address, block_number, log_index)
                );
                "#,
            )
        })
    }

    /// Runs `op` on a worker thread so async callers never block the runtime.
    async fn blocking<T, F>(&self, label: &'static str, op: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ValidatorDb) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .with_context(|| format!("{label} worker failed"))?
    }

    pub fn upsert_job_sync(&self, job: &Job) -> anyhow::Result<()> {
        let manager = format!("{:#x}", job.sn_liquidity_manager_address);
        let pair = format!("{:#x}", job.pair_address);
        let now = unix_now_ms() as i64;
        self.with_connection("upsert_job", |conn| {
            conn.execute(
                r#"
                INSERT INTO jobs (
                    job_id, sn_liquidity_manager_address, pair_address, chain_id, fee_rate,
                    round_duration_seconds, is_active, updated_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(job_id) DO UPDATE SET
                    sn_liquidity_manager_address = excluded.sn_liquidity_manager_address,
                    pair_address = excluded.pair_address,
                    chain_id = excluded.chain_id,
                    fee_rate = excluded.fee_rate,
                    round_duration_seconds = excluded.round_duration_seconds,
                    is_active = excluded.is_active,
                    updated_at_ms = excluded.updated_at_ms
                "#,
                params![
                    job.job_id,
                    manager,
                    pair,
                    job.chain_id as i64,
                    job.fee_rate,
                    job.round_duration_seconds as i64,
                    job.is_active as i64,
                    now
                ],
            )
        })?;
        Ok(())
    }

    pub fn active_jobs_sync(&self) -> anyhow::Result<Vec<Job>> {
        self.with_connection("active_jobs", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE is_active = 1 ORDER BY job_id"
            ))?;
            let rows = stmt.query_map([], job_from_row)?;
            rows.collect()
        })
    }

    /// Any job by id, active or not.
    pub fn job_sync(&self, job_id: &str) -> anyhow::Result<Option<Job>> {
        self.with_connection("job", |conn| {
            conn.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
                params![job_id],
                job_from_row,
            )
            .optional()
        })
    }

    pub fn latest_round_number_sync(
        &self,
        job_id: &str,
        round_type: RoundType,
    ) -> anyhow::Result<u64> {
        let latest = self.with_connection("latest_round_number", |conn| {
            conn.query_row(
                "SELECT MAX(round_number) FROM rounds WHERE job_id = ?1 AND round_type = ?2",
                params![job_id, round_type.as_str()],
                |row| row.get::<_, Option<i64>>(0),
            )
        })?;
        Ok(latest.map(|n| n.max(0) as u64).unwrap_or(0))
    }

    pub fn create_round_sync(&self, round: &Round) -> anyhow::Result<()> {
        let now = unix_now_ms() as i64;
        self.with_connection("create_round", |conn| {
            conn.execute(
                r#"
                INSERT INTO rounds (
                    round_id, job_id, round_type, round_number, start_block, deadline_ms,
                    status, winner_uid, performance, created_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9)
                "#,
                params![
                    round.round_id,
                    round.job_id,
                    round.round_type.as_str(),
                    round.round_number as i64,
                    round.start_block as i64,
                    round.deadline_ms as i64,
                    round.status.as_str(),
                    round.winner_uid.map(i64::from),
                    now
                ],
            )
        })?;
        Ok(())
    }

    pub fn complete_round_sync(
        &self,
        round_id: &str,
        winner_uid: Option<u16>,
        performance: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let payload = serde_json::to_string(performance).context("encode round performance")?;
        let now = unix_now_ms() as i64;
        let changed = self.with_connection("complete_round", |conn| {
            conn.execute(
                "UPDATE rounds SET status = ?2, winner_uid = ?3, performance = ?4, completed_at_ms = ?5 \
                 WHERE round_id = ?1 AND status = ?6",
                params![
                    round_id,
                    RoundStatus::Completed.as_str(),
                    winner_uid.map(i64::from),
                    payload,
                    now,
                    RoundStatus::Active.as_str()
                ],
            )
        })?;
        if changed == 0 {
            anyhow::bail!("round {round_id} is not active");
        }
        Ok(())
    }

    pub fn round_sync(&self, round_id: &str) -> anyhow::Result<Option<Round>> {
        self.with_connection("round", |conn| {
            conn.query_row(
                &format!("SELECT {ROUND_COLUMNS} FROM rounds WHERE round_id = ?1"),
                params![round_id],
                round_from_row,
            )
            .optional()
        })
    }

    pub fn round_performance_sync(
        &self,
        round_id: &str,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        let raw = self.with_connection("round_performance", |conn| {
            conn.query_row(
                "SELECT performance FROM rounds WHERE round_id = ?1",
                params![round_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
        })?;
        match raw.flatten() {
            Some(text) => Ok(Some(
                serde_json::from_str(&text).context("decode round performance")?,
            )),
            None => Ok(None),
        }
    }

    pub fn save_rebalance_decisions_sync(
        &self,
        decisions: &[RebalanceDecision],
    ) -> anyhow::Result<()> {
        let mut encoded = Vec::with_capacity(decisions.len());
        for decision in decisions {
            let history = decision
                .rebalance_history
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .context("encode rebalance history")?;
            encoded.push((decision, history));
        }
        let now = unix_now_ms() as i64;
        self.with_connection("save_rebalance_decisions", |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    r#"
                    INSERT INTO rebalance_decisions (
                        round_id, job_id, miner_uid, miner_hotkey, accepted, rebalance_history,
                        refusal_reason, response_time_ms, created_at_ms
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                    ON CONFLICT(round_id, miner_uid) DO UPDATE SET
                        accepted = excluded.accepted,
                        rebalance_history = excluded.rebalance_history,
                        refusal_reason = excluded.refusal_reason,
                        response_time_ms = excluded.response_time_ms
                    "#,
                )?;
                for (decision, history) in &encoded {
                    stmt.execute(params![
                        decision.round_id,
                        decision.job_id,
                        i64::from(decision.miner_uid),
                        decision.miner_hotkey,
                        decision.accepted as i64,
                        history,
                        decision.refusal_reason,
                        decision.response_time_ms as i64,
                        now
                    ])?;
                }
            }
            tx.commit()
        })
    }

    pub fn rebalance_decision_sync(
        &self,
        round_id: &str,
        miner_uid: u16,
    ) -> anyhow::Result<Option<RebalanceDecision>> {
        let row = self.with_connection("rebalance_decision", |conn| {
            conn.query_row(
                "SELECT round_id, job_id, miner_uid, miner_hotkey, accepted, rebalance_history, \
                 refusal_reason, response_time_ms FROM rebalance_decisions \
                 WHERE round_id = ?1 AND miner_uid = ?2",
                params![round_id, i64::from(miner_uid)],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)? != 0,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()
        })?;
        let Some((round_id, job_id, uid, hotkey, accepted, history, refusal, response_ms)) = row
        else {
            return Ok(None);
        };
        let rebalance_history = history
            .map(|raw| serde_json::from_str::<Vec<RebalanceHistoryEntry>>(&raw))
            .transpose()
            .context("decode rebalance history")?;
        Ok(Some(RebalanceDecision {
            round_id,
            job_id,
            miner_uid: uid as u16,
            miner_hotkey: hotkey,
            accepted,
            rebalance_history,
            refusal_reason: refusal,
            response_time_ms: response_ms.max(0) as u64,
        }))
    }

    pub fn apply_score_updates_sync(
        &self,
        updates: &[ScoreUpdate],
        now_ms: u64,
    ) -> anyhow::Result<()> {
        self.with_connection("apply_score_updates", |conn| {
            let tx = conn.unchecked_transaction()?;
            for update in updates {
                let existing = tx
                    .query_row(
                        &format!(
                            "SELECT {SCORE_COLUMNS} FROM miner_scores WHERE job_id = ?1 AND miner_uid = ?2"
                        ),
                        params![update.job_id, i64::from(update.miner_uid)],
                        score_from_row,
                    )
                    .optional()?;
                let next = next_miner_score(existing, update, now_ms);
                tx.execute(
                    r#"
                    INSERT INTO miner_scores (
                        job_id, miner_uid, miner_hotkey, evaluation_score, live_score,
                        combined_score, participation_days, first_participation_ms,
                        last_participation_ms, total_rounds, accepted_rounds, is_eligible,
                        updated_at_ms
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                    ON CONFLICT(job_id, miner_uid) DO UPDATE SET
                        miner_hotkey = excluded.miner_hotkey,
                        evaluation_score = excluded.evaluation_score,
                        live_score = excluded.live_score,
                        combined_score = excluded.combined_score,
                        participation_days = excluded.participation_days,
                        first_participation_ms = excluded.first_participation_ms,
                        last_participation_ms = excluded.last_participation_ms,
                        total_rounds = excluded.total_rounds,
                        accepted_rounds = excluded.accepted_rounds,
                        is_eligible = excluded.is_eligible,
                        updated_at_ms = excluded.updated_at_ms
                    "#,
                    params![
                        next.job_id,
                        i64::from(next.miner_uid),
                        next.miner_hotkey,
                        next.evaluation_score,
                        next.live_score,
                        next.combined_score,
                        next.participation_days as i64,
                        next.first_participation_ms.map(|v| v as i64),
                        next.last_participation_ms.map(|v| v as i64),
                        next.total_rounds as i64,
                        next.accepted_rounds as i64,
                        next.is_eligible as i64,
                        now_ms as i64
                    ],
                )?;
            }
            tx.commit()
        })
    }

    pub fn miner_score_sync(
        &self,
        job_id: &str,
        miner_uid: u16,
    ) -> anyhow::Result<Option<MinerScore>> {
        self.with_connection("miner_score", |conn| {
            conn.query_row(
                &format!("SELECT {SCORE_COLUMNS} FROM miner_scores WHERE job_id = ?1 AND miner_uid = ?2"),
                params![job_id, i64::from(miner_uid)],
                score_from_row,
            )
            .optional()
        })
    }

    pub fn historic_combined_scores_sync(&self, job_id: &str) -> anyhow::Result<HashMap<u16, f64>> {
        let rows = self.with_connection("historic_combined_scores", |conn| {
            let mut stmt = conn.prepare(
                "SELECT miner_uid, combined_score FROM miner_scores WHERE job_id = ?1",
            )?;
            let mapped = stmt.query_map(params![job_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(rows.into_iter().map(|(uid, s)| (uid as u16, s)).collect())
    }

    pub fn latest_evaluation_ranking_sync(&self, job_id: &str) -> anyhow::Result<Vec<u16>> {
        let raw = self.with_connection("latest_evaluation_ranking", |conn| {
            conn.query_row(
                "SELECT performance FROM rounds WHERE job_id = ?1 AND round_type = ?2 AND status = ?3 \
                 ORDER BY round_number DESC LIMIT 1",
                params![
                    job_id,
                    RoundType::Evaluation.as_str(),
                    RoundStatus::Completed.as_str()
                ],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
        })?;
        let Some(text) = raw.flatten() else {
            return Ok(Vec::new());
        };
        let performance: serde_json::Value =
            serde_json::from_str(&text).context("decode evaluation performance")?;
        Ok(ranking_from_performance(&performance))
    }

    pub fn eligible_miners_sync(&self, job_id: &str, now_ms: u64) -> anyhow::Result<Vec<MinerScore>> {
        let cutoff = now_ms.saturating_sub(MIN_LIVE_PARTICIPATION_DAYS * MS_PER_DAY) as i64;
        let mut scores = self.with_connection("eligible_miners", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCORE_COLUMNS} FROM miner_scores WHERE job_id = ?1 \
                 AND first_participation_ms IS NOT NULL AND first_participation_ms <= ?2 \
                 ORDER BY miner_uid"
            ))?;
            let mapped = stmt.query_map(params![job_id, cutoff], score_from_row)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        for score in &mut scores {
            score.participation_days = participation_days(score.first_participation_ms, now_ms);
            score.is_eligible = true;
        }
        Ok(scores)
    }

    pub fn create_live_execution_sync(&self, record: &NewLiveExecution) -> anyhow::Result<i64> {
        let strategy = serde_json::to_string(&record.strategy).context("encode strategy")?;
        let (status, error) = match record.error.as_deref() {
            Some(error) => (
                ExecutionStatus::Failed,
                Some(serde_json::json!({ "error": error }).to_string()),
            ),
            None => (ExecutionStatus::Pending, None),
        };
        let now = unix_now_ms() as i64;
        self.with_connection("create_live_execution", |conn| {
            conn.execute(
                "INSERT INTO live_executions (round_id, job_id, miner_uid, strategy, tx_hash, tx_status, error, created_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.round_id,
                    record.job_id,
                    i64::from(record.miner_uid),
                    strategy,
                    record.tx_hash,
                    status.as_str(),
                    error,
                    now
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn live_execution_sync(&self, execution_id: i64) -> anyhow::Result<Option<LiveExecution>> {
        let row = self.with_connection("live_execution", |conn| {
            conn.query_row(
                "SELECT execution_id, round_id, job_id, miner_uid, strategy, tx_hash, tx_status, error, created_at_ms \
                 FROM live_executions WHERE execution_id = ?1",
                params![execution_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                },
            )
            .optional()
        })?;
        let Some((id, round_id, job_id, uid, strategy, tx_hash, status, error, created)) = row else {
            return Ok(None);
        };
        let tx_status = ExecutionStatus::from_db(status.trim())
            .with_context(|| format!("unknown execution status `{status}`"))?;
        let error = error.map(|raw| {
            serde_json::from_str::<serde_json::Value>(&raw)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or(raw)
        });
        Ok(Some(LiveExecution {
            execution_id: id,
            round_id,
            job_id,
            miner_uid: uid as u16,
            strategy: serde_json::from_str(&strategy).context("decode strategy")?,
            tx_hash,
            tx_status,
            error,
            created_at_ms: created.max(0) as u64,
        }))
    }

    pub fn register_vault_sync(&self, vault: &MinerVault) -> anyhow::Result<()> {
        let address = format!("{:#x}", vault.vault_address);
        self.with_connection("register_vault", |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE miner_vaults SET is_active = 0 WHERE miner_uid = ?1 AND vault_address != ?2",
                params![i64::from(vault.miner_uid), address],
            )?;
            tx.execute(
                r#"
                INSERT INTO miner_vaults (
                    vault_address, miner_uid, miner_hotkey, chain_id, is_verified, is_active,
                    minimum_balance_usd, registered_at_ms, verified_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(vault_address) DO UPDATE SET
                    is_verified = CASE
                        WHEN miner_vaults.miner_uid = excluded.miner_uid
                         AND miner_vaults.miner_hotkey = excluded.miner_hotkey
                        THEN MAX(miner_vaults.is_verified, excluded.is_verified)
                        ELSE excluded.is_verified
                    END,
                    verified_at_ms = CASE
                        WHEN miner_vaults.miner_uid = excluded.miner_uid
                         AND miner_vaults.miner_hotkey = excluded.miner_hotkey
                        THEN COALESCE(miner_vaults.verified_at_ms, excluded.verified_at_ms)
                        ELSE excluded.verified_at_ms
                    END,
                    miner_uid = excluded.miner_uid,
                    miner_hotkey = excluded.miner_hotkey,
                    chain_id = excluded.chain_id,
                    is_active = excluded.is_active,
                    minimum_balance_usd = excluded.minimum_balance_usd
                "#,
                params![
                    address,
                    i64::from(vault.miner_uid),
                    vault.miner_hotkey,
                    vault.chain_id as i64,
                    vault.is_verified as i64,
                    vault.is_active as i64,
                    vault.minimum_balance_usd,
                    vault.registered_at_ms as i64,
                    vault.verified_at_ms.map(|v| v as i64)
                ],
            )?;
            tx.commit()
        })
    }

    pub fn mark_vault_verified_sync(&self, vault_address: Address, at_ms: u64) -> anyhow::Result<()> {
        let address = format!("{vault_address:#x}");
        self.with_connection("mark_vault_verified", |conn| {
            conn.execute(
                "UPDATE miner_vaults SET is_verified = 1, verified_at_ms = ?2 WHERE vault_address = ?1",
                params![address, at_ms as i64],
            )
        })?;
        Ok(())
    }

    pub fn deactivate_vault_sync(&self, vault_address: Address) -> anyhow::Result<()> {
        let address = format!("{vault_address:#x}");
        self.with_connection("deactivate_vault", |conn| {
            conn.execute(
                "UPDATE miner_vaults SET is_active = 0 WHERE vault_address = ?1",
                params![address],
            )
        })?;
        Ok(())
    }

    pub fn vault_for_miner_sync(&self, miner_uid: u16) -> anyhow::Result<Option<MinerVault>> {
        self.with_connection("vault_for_miner", |conn| {
            conn.query_row(
                &format!(
                    "SELECT {VAULT_COLUMNS} FROM miner_vaults WHERE miner_uid = ?1 AND is_active = 1 \
                     ORDER BY registered_at_ms DESC LIMIT 1"
                ),
                params![i64::from(miner_uid)],
                vault_from_row,
            )
            .optional()
        })
    }

    pub fn verified_vaults_sync(&self) -> anyhow::Result<Vec<MinerVault>> {
        self.with_connection("verified_vaults", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {VAULT_COLUMNS} FROM miner_vaults WHERE is_verified = 1 AND is_active = 1 \
                 ORDER BY miner_uid"
            ))?;
            let mapped = stmt.query_map([], vault_from_row)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    pub fn record_vault_snapshot_sync(&self, snapshot: &VaultSnapshot) -> anyhow::Result<()> {
        let address = format!("{:#x}", snapshot.vault_address);
        self.with_connection("record_vault_snapshot", |conn| {
            conn.execute(
                &format!("INSERT INTO vault_snapshots ({SNAPSHOT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    address,
                    snapshot.token0_balance.to_string(),
                    snapshot.token1_balance.to_string(),
                    snapshot.total_value_usd,
                    snapshot.block_number as i64,
                    snapshot.timestamp_ms as i64
                ],
            )
        })?;
        Ok(())
    }

    pub fn vault_snapshot_at_or_before_sync(
        &self,
        vault_address: Address,
        at_ms: u64,
    ) -> anyhow::Result<Option<VaultSnapshot>> {
        let address = format!("{vault_address:#x}");
        let at = at_ms.min(i64::MAX as u64) as i64;
        self.with_connection("vault_snapshot_at_or_before", |conn| {
            conn.query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM vault_snapshots WHERE vault_address = ?1 \
                     AND timestamp_ms <= ?2 ORDER BY timestamp_ms DESC, snapshot_id DESC LIMIT 1"
                ),
                params![address, at],
                snapshot_from_row,
            )
            .optional()
        })
    }

    pub fn insert_swap_events_sync(&self, pool: Address, events: &[SwapEvent]) -> anyhow::Result<()> {
        let pool_hex = format!("{pool:#x}");
        self.with_connection("insert_swap_events", |conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO swaps (pool_address, block_number, log_index, sqrt_price_x96, tick, amount0, amount1, liquidity) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for event in events {
                    stmt.execute(params![
                        pool_hex,
                        event.block_number as i64,
                        event.log_index as i64,
                        event.sqrt_price_x96.to_string(),
                        event.tick,
                        event.amount0,
                        event.amount1,
                        event.liquidity
                    ])?;
                }
            }
            tx.commit()
        })
    }

    pub fn swap_events_sync(
        &self,
        pool: Address,
        start_block: u64,
        end_block: u64,
    ) -> anyhow::Result<Vec<SwapEvent>> {
        let pool_hex = format!("{pool:#x}");
        self.with_connection("swap_events", |conn| {
            let mut stmt = conn.prepare(
                "SELECT block_number, log_index, sqrt_price_x96, tick, amount0, amount1, liquidity \
                 FROM swaps WHERE pool_address = ?1 AND block_number >= ?2 AND block_number <= ?3 \
                 ORDER BY block_number ASC, log_index ASC",
            )?;
            let mapped = stmt.query_map(
                params![pool_hex, start_block as i64, end_block.min(i64::MAX as u64) as i64],
                swap_from_row,
            )?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    pub fn price_at_block_sync(&self, pool: Address, block: u64) -> anyhow::Result<Option<f64>> {
        let pool_hex = format!("{pool:#x}");
        let sqrt = self.with_connection("price_at_block", |conn| {
            conn.query_row(
                "SELECT sqrt_price_x96 FROM swaps WHERE pool_address = ?1 AND block_number <= ?2 \
                 ORDER BY block_number DESC, log_index DESC LIMIT 1",
                params![pool_hex, block.min(i64::MAX as u64) as i64],
                |row| u256_column(row, 0),
            )
            .optional()
        })?;
        Ok(sqrt.map(sqrt_price_x96_to_price))
    }

    fn with_connection<T, F>(&self, context: &str, op: F) -> anyhow::Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        let max_attempts = 6u32;
        let mut last_err = String::new();

        for attempt in 1..=max_attempts {
            let conn = Connection::open(&self.path).with_context(|| {
                format!("failed to open sqlite database {}", self.path.display())
            })?;
            conn.busy_timeout(Duration::from_millis(5_000))
                .context("failed to configure sqlite busy timeout")?;

            match op(&conn) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last_err = err.to_string();
                    if is_sqlite_locked_error(&err) && attempt < max_attempts {
                        continue;
                    }
                    return Err(anyhow::anyhow!(
                        "{} failed for {}: {}",
                        context,
                        self.path.display(),
                        last_err
                    ));
                }
            }
        }

        Err(anyhow::anyhow!(
            "{} failed for {} after {} attempt(s): {}",
            context,
            self.path.display(),
            max_attempts,
            last_err
        ))
    }
}

fn participation_days(first_participation_ms: Option<u64>, now_ms: u64) -> u64 {
    first_participation_ms
        .map(|first| now_ms.saturating_sub(first) / MS_PER_DAY)
        .unwrap_or(0)
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        job_id: row.get(0)?,
        sn_liquidity_manager_address: address_column(row, 1)?,
        pair_address: address_column(row, 2)?,
        chain_id: row.get::<_, i64>(3)? as u64,
        fee_rate: row.get(4)?,
        round_duration_seconds: row.get::<_, i64>(5)?.max(0) as u64,
        is_active: row.get::<_, i64>(6)? != 0,
    })
}

/// Folds one round outcome into a miner's running record.
fn next_miner_score(existing: Option<MinerScore>, update: &ScoreUpdate, now_ms: u64) -> MinerScore {
    let previous_combined = existing
        .as_ref()
        .filter(|s| s.accepted_rounds > 0)
        .map(|s| s.combined_score);
    let mut next = existing.unwrap_or_else(|| MinerScore {
        job_id: update.job_id.clone(),
        miner_uid: update.miner_uid,
        miner_hotkey: update.miner_hotkey.clone(),
        evaluation_score: 0.0,
        live_score: 0.0,
        combined_score: 0.0,
        participation_days: 0,
        first_participation_ms: None,
        last_participation_ms: None,
        total_rounds: 0,
        accepted_rounds: 0,
        is_eligible: false,
    });
    next.miner_hotkey = update.miner_hotkey.clone();
    next.total_rounds += 1;
    if update.accepted {
        // SQLite turns NaN into NULL; rank it as the worst score instead.
        let score = if update.score.is_nan() {
            f64::NEG_INFINITY
        } else {
            update.score
        };
        next.accepted_rounds += 1;
        match update.round_type {
            RoundType::Evaluation => next.evaluation_score = score,
            RoundType::Live => next.live_score = score,
        }
        next.combined_score = blend_combined_score(previous_combined, score);
        next.first_participation_ms.get_or_insert(now_ms);
        next.last_participation_ms = Some(now_ms);
    } else if update.round_type == RoundType::Evaluation {
        next.evaluation_score = 0.0;
    }
    next.participation_days = participation_days(next.first_participation_ms, now_ms);
    next.is_eligible = next.participation_days >= MIN_LIVE_PARTICIPATION_DAYS;
    next
}

/// Uids from a `{"scores": {uid: score}}` payload, best first, ties by uid.
fn ranking_from_performance(performance: &serde_json::Value) -> Vec<u16> {
    let Some(scores) = performance.get("scores").and_then(|s| s.as_object()) else {
        return Vec::new();
    };
    let mut ranked: Vec<(u16, f64)> = scores
        .iter()
        .filter_map(|(uid, score)| {
            let uid = uid.trim().parse::<u16>().ok()?;
            Some((uid, score.as_f64().unwrap_or(f64::NEG_INFINITY)))
        })
        .collect();
    ranked.sort_by(|(uid_a, a), (uid_b, b)| {
        b.partial_cmp(a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| uid_a.cmp(uid_b))
    });
    ranked.into_iter().map(|(uid, _)| uid).collect()
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn address_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Address> {
    let raw: String = row.get(idx)?;
    raw.trim()
        .parse::<Address>()
        .map_err(|e| conversion_error(idx, format!("bad address `{raw}`: {e}")))
}

fn u256_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<U256> {
    let raw: String = row.get(idx)?;
    decimal_u256::parse(&raw).ok_or_else(|| conversion_error(idx, format!("bad amount `{raw}`")))
}

fn round_from_row(row: &Row<'_>) -> rusqlite::Result<Round> {
    let round_type: String = row.get(2)?;
    let status: String = row.get(6)?;
    Ok(Round {
        round_id: row.get(0)?,
        job_id: row.get(1)?,
        round_type: RoundType::from_db(round_type.trim())
            .ok_or_else(|| conversion_error(2, format!("bad round type `{round_type}`")))?,
        round_number: row.get::<_, i64>(3)?.max(0) as u64,
        start_block: row.get::<_, i64>(4)?.max(0) as u64,
        deadline_ms: row.get::<_, i64>(5)?.max(0) as u64,
        status: RoundStatus::from_db(status.trim())
            .ok_or_else(|| conversion_error(6, format!("bad round status `{status}`")))?,
        winner_uid: row.get::<_, Option<i64>>(7)?.map(|v| v as u16),
    })
}

fn score_from_row(row: &Row<'_>) -> rusqlite::Result<MinerScore> {
    Ok(MinerScore {
        job_id: row.get(0)?,
        miner_uid: row.get::<_, i64>(1)? as u16,
        miner_hotkey: row.get(2)?,
        evaluation_score: row.get(3)?,
        live_score: row.get(4)?,
        combined_score: row.get(5)?,
        participation_days: row.get::<_, i64>(6)?.max(0) as u64,
        first_participation_ms: row.get::<_, Option<i64>>(7)?.map(|v| v.max(0) as u64),
        last_participation_ms: row.get::<_, Option<i64>>(8)?.map(|v| v.max(0) as u64),
        total_rounds: row.get::<_, i64>(9)?.max(0) as u64,
        accepted_rounds: row.get::<_, i64>(10)?.max(0) as u64,
        is_eligible: row.get::<_, i64>(11)? != 0,
    })
}

fn vault_from_row(row: &Row<'_>) -> rusqlite::Result<MinerVault> {
    Ok(MinerVault {
        miner_uid: row.get::<_, i64>(0)? as u16,
        miner_hotkey: row.get(1)?,
        vault_address: address_column(row, 2)?,
        chain_id: row.get::<_, i64>(3)? as u64,
        is_verified: row.get::<_, i64>(4)? != 0,
        is_active: row.get::<_, i64>(5)? != 0,
        minimum_balance_usd: row.get(6)?,
        registered_at_ms: row.get::<_, i64>(7)?.max(0) as u64,
        verified_at_ms: row.get::<_, Option<i64>>(8)?.map(|v| v.max(0) as u64),
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<VaultSnapshot> {
    Ok(VaultSnapshot {
        vault_address: address_column(row, 0)?,
        token0_balance: u256_column(row, 1)?,
        token1_balance: u256_column(row, 2)?,
        total_value_usd: row.get(3)?,
        block_number: row.get::<_, i64>(4)?.max(0) as u64,
        timestamp_ms: row.get::<_, i64>(5)?.max(0) as u64,
    })
}

fn swap_from_row(row: &Row<'_>) -> rusqlite::Result<SwapEvent> {
    Ok(SwapEvent {
        block_number: row.get::<_, i64>(0)?.max(0) as u64,
        log_index: row.get::<_, i64>(1)?.max(0) as u64,
        sqrt_price_x96: u256_column(row, 2)?,
        tick: row.get(3)?,
        amount0: row.get(4)?,
        amount1: row.get(5)?,
        liquidity: row.get(6)?,
    })
}

fn is_sqlite_locked_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => {
            matches!(
                code.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            )
        }
        _ => {
            let msg = err.to_string().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
    }
}

#[async_trait]
impl JobRepository for ValidatorDb {
    async fn active_jobs(&self) -> anyhow::Result<Vec<Job>> {
        self.blocking("active_jobs", |db| db.active_jobs_sync()).await
    }

    async fn upsert_job(&self, job: &Job) -> anyhow::Result<()> {
        let job = job.clone();
        self.blocking("upsert_job", move |db| db.upsert_job_sync(&job))
            .await
    }

    async fn latest_round_number(
        &self,
        job_id: &str,
        round_type: RoundType,
    ) -> anyhow::Result<u64> {
        let job_id = job_id.to_string();
        self.blocking("latest_round_number", move |db| {
            db.latest_round_number_sync(&job_id, round_type)
        })
        .await
    }

    async fn create_round(&self, round: &Round) -> anyhow::Result<()> {
        let round = round.clone();
        self.blocking("create_round", move |db| db.create_round_sync(&round))
            .await
    }

    async fn complete_round(
        &self,
        round_id: &str,
        winner_uid: Option<u16>,
        performance: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let round_id = round_id.to_string();
        let performance = performance.clone();
        self.blocking("complete_round", move |db| {
            db.complete_round_sync(&round_id, winner_uid, &performance)
        })
        .await
    }

    async fn round(&self, round_id: &str) -> anyhow::Result<Option<Round>> {
        let round_id = round_id.to_string();
        self.blocking("round", move |db| db.round_sync(&round_id))
            .await
    }

    async fn save_rebalance_decisions(
        &self,
        decisions: &[RebalanceDecision],
    ) -> anyhow::Result<()> {
        let decisions = decisions.to_vec();
        self.blocking("save_rebalance_decisions", move |db| {
            db.save_rebalance_decisions_sync(&decisions)
        })
        .await
    }

    async fn rebalance_decision(
        &self,
        round_id: &str,
        miner_uid: u16,
    ) -> anyhow::Result<Option<RebalanceDecision>> {
        let round_id = round_id.to_string();
        self.blocking("rebalance_decision", move |db| {
            db.rebalance_decision_sync(&round_id, miner_uid)
        })
        .await
    }

    async fn apply_score_updates(
        &self,
        updates: &[ScoreUpdate],
        now_ms: u64,
    ) -> anyhow::Result<()> {
        let updates = updates.to_vec();
        self.blocking("apply_score_updates", move |db| {
            db.apply_score_updates_sync(&updates, now_ms)
        })
        .await
    }

    async fn miner_score(
        &self,
        job_id: &str,
        miner_uid: u16,
    ) -> anyhow::Result<Option<MinerScore>> {
        let job_id = job_id.to_string();
        self.blocking("miner_score", move |db| {
            db.miner_score_sync(&job_id, miner_uid)
        })
        .await
    }

    async fn historic_combined_scores(&self, job_id: &str) -> anyhow::Result<HashMap<u16, f64>> {
        let job_id = job_id.to_string();
        self.blocking("historic_combined_scores", move |db| {
            db.historic_combined_scores_sync(&job_id)
        })
        .await
    }

    async fn latest_evaluation_ranking(&self, job_id: &str) -> anyhow::Result<Vec<u16>> {
        let job_id = job_id.to_string();
        self.blocking("latest_evaluation_ranking", move |db| {
            db.latest_evaluation_ranking_sync(&job_id)
        })
        .await
    }

    async fn eligible_miners(&self, job_id: &str) -> anyhow::Result<Vec<MinerScore>> {
        let job_id = job_id.to_string();
        let now = unix_now_ms();
        self.blocking("eligible_miners", move |db| {
            db.eligible_miners_sync(&job_id, now)
        })
        .await
    }

    async fn create_live_execution(&self, record: &NewLiveExecution) -> anyhow::Result<i64> {
        let record = record.clone();
        self.blocking("create_live_execution", move |db| {
            db.create_live_execution_sync(&record)
        })
        .await
    }

    async fn live_execution(&self, execution_id: i64) -> anyhow::Result<Option<LiveExecution>> {
        self.blocking("live_execution", move |db| {
            db.live_execution_sync(execution_id)
        })
        .await
    }
}

#[async_trait]
impl VaultRepository for ValidatorDb {
    async fn register_vault(&self, vault: &MinerVault) -> anyhow::Result<()> {
        let vault = vault.clone();
        self.blocking("register_vault", move |db| db.register_vault_sync(&vault))
            .await
    }

    async fn mark_vault_verified(&self, vault_address: Address, at_ms: u64) -> anyhow::Result<()> {
        self.blocking("mark_vault_verified", move |db| {
            db.mark_vault_verified_sync(vault_address, at_ms)
        })
        .await
    }

    async fn deactivate_vault(&self, vault_address: Address) -> anyhow::Result<()> {
        self.blocking("deactivate_vault", move |db| {
            db.deactivate_vault_sync(vault_address)
        })
        .await
    }

    async fn vault_for_miner(&self, miner_uid: u16) -> anyhow::Result<Option<MinerVault>> {
        self.blocking("vault_for_miner", move |db| {
            db.vault_for_miner_sync(miner_uid)
        })
        .await
    }

    async fn verified_vaults(&self) -> anyhow::Result<Vec<MinerVault>> {
        self.blocking("verified_vaults", |db| db.verified_vaults_sync())
            .await
    }

    async fn record_vault_snapshot(&self, snapshot: &VaultSnapshot) -> anyhow::Result<()> {
        let snapshot = snapshot.clone();
        self.blocking("record_vault_snapshot", move |db| {
            db.record_vault_snapshot_sync(&snapshot)
        })
        .await
    }

    async fn latest_vault_snapshot(
        &self,
        vault_address: Address,
    ) -> anyhow::Result<Option<VaultSnapshot>> {
        self.blocking("latest_vault_snapshot", move |db| {
            db.vault_snapshot_at_or_before_sync(vault_address, u64::MAX)
        })
        .await
    }

    async fn vault_snapshot_at_or_before(
        &self,
        vault_address: Address,
        at_ms: u64,
    ) -> anyhow::Result<Option<VaultSnapshot>> {
        self.blocking("vault_snapshot_at_or_before", move |db| {
            db.vault_snapshot_at_or_before_sync(vault_address, at_ms)
        })
        .await
    }
}

#[async_trait]
impl SwapEventSource for ValidatorDb {
    async fn swap_events(
        &self,
        pool: Address,
        start_block: u64,
        end_block: u64,
    ) -> anyhow::Result<Vec<SwapEvent>> {
        self.blocking("swap_events", move |db| {
            db.swap_events_sync(pool, start_block, end_block)
        })
        .await
    }

    async fn price_at_block(&self, pool: Address, block: u64) -> anyhow::Result<Option<f64>> {
        self.blocking("price_at_block", move |db| db.price_at_block_sync(pool, block))
            .await
    }
}
