use anyhow::Context;
use sn98_validator::engine::{score_pol_strategy, Backtester, ScoreParams};
use sn98_validator::storage::ValidatorDb;
use std::str::FromStr;
use std::sync::Arc;

fn parse_arg<T: FromStr>(raw: &str, name: &str) -> anyhow::Result<T>
where
    <T as FromStr>::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid {name} '{raw}': {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 5 {
        return Err(anyhow::anyhow!(
            "usage: backtest_replay <db_path> <round_id> <miner_uid> <end_block>"
        ));
    }
    let db = Arc::new(ValidatorDb::open(&args[1])?);
    let round_id = args[2].as_str();
    let miner_uid: u16 = parse_arg(&args[3], "miner_uid")?;
    let end_block: u64 = parse_arg(&args[4], "end_block")?;

    let round = db
        .round_sync(round_id)?
        .with_context(|| format!("round {round_id} not found"))?;
    let job = db
        .job_sync(&round.job_id)?
        .with_context(|| format!("job {} not found", round.job_id))?;
    let decision = db
        .rebalance_decision_sync(round_id, miner_uid)?
        .with_context(|| format!("no decision for miner {miner_uid} in {round_id}"))?;
    let history = decision
        .rebalance_history
        .filter(|h| !h.is_empty())
        .with_context(|| format!("miner {miner_uid} has no rebalance history in {round_id}"))?;
    // The seed entry carries the round's starting inventory.
    let initial_inventory = history[0].inventory;

    let backtester = Backtester::new(db.clone());
    let metrics = backtester
        .evaluate_positions_performance(
            job.pair_address,
            &history,
            round.start_block,
            end_block,
            initial_inventory,
            job.fee_rate,
        )
        .await?;
    let score = score_pol_strategy(&metrics, ScoreParams::default());
    let recorded = db
        .round_performance_sync(round_id)?
        .and_then(|p| p.get("scores")?.get(miner_uid.to_string())?.as_f64());

    eprintln!(
        "[REPLAY] round={} miner={} accepted={} blocks={}..{} rebalances={}",
        round_id,
        miner_uid,
        decision.accepted,
        round.start_block,
        end_block,
        history.len().saturating_sub(1)
    );
    let report = serde_json::json!({
        "round_id": round_id,
        "miner_uid": miner_uid,
        "score": score,
        "recorded_score": recorded,
        "metrics": metrics,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
