use anyhow::Result;
use multichat::convo::{ConvoConfig, ConvoSide, ConversationController};
use multichat::document::{ChromiumHost, DiskFileStore, HostConfig};
use multichat::target::TargetSet;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let host = if let Ok(ws) = std::env::var("CHROME_WS_URL") {
        if !ws.trim().is_empty() {
            ChromiumHost::connect(&ws).await?
        } else {
            ChromiumHost::launch(HostConfig { headless: false, user_agent: None }).await?
        }
    } else {
        ChromiumHost::launch(HostConfig { headless: false, user_agent: None }).await?
    };

    let config_path =
        std::env::var("TARGETS_JSON").unwrap_or_else(|_| "targets.json".to_string());
    let json = std::fs::read_to_string(&config_path)?;
    let targets = TargetSet::from_json(&json)?;

    let mut ids = targets.ids().into_iter();
    let (a_id, b_id) = match (ids.next(), ids.next()) {
        (Some(a), Some(b)) => (a, b),
        _ => anyhow::bail!("need at least two targets in {config_path}"),
    };
    let target_a = targets.get(&a_id).cloned().ok_or_else(|| anyhow::anyhow!("missing {a_id}"))?;
    let target_b = targets.get(&b_id).cloned().ok_or_else(|| anyhow::anyhow!("missing {b_id}"))?;

    let doc_a = Arc::new(host.open_document(&target_a.url).await?);
    let doc_b = Arc::new(host.open_document(&target_b.url).await?);

    let store = Arc::new(DiskFileStore::new(std::env::temp_dir().join("multichat_runs")));
    let mut controller = ConversationController::new(
        ConvoSide::new(target_a, doc_a),
        ConvoSide::new(target_b, doc_b),
    )
    .with_config(ConvoConfig {
        max_turns: 6,
        turn_delay: Duration::from_secs(3),
        response_timeout: Duration::from_secs(90),
        ..ConvoConfig::default()
    })
    .with_store(store);

    let summary = controller
        .run(
            "Is remote work better than office work? Keep answers short.",
            Some("You are debating {topic}. Argue in favor, reply to your partner."),
            Some("You are debating {topic}. Argue against, reply to your partner."),
        )
        .await?;

    println!(
        "conversation {} finished after {} turns ({:?})",
        summary.session_id, summary.turns, summary.stop_reason
    );
    Ok(())
}
