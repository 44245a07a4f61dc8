use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;

use grader::config::{CliArgs, Config};
use grader::database::{self as db, SqliteStore};
use grader::grader::Grader;
use grader::pool::GradingPool;
use grader::submission::SubmissionDescriptor;

fn load_submission(path: &Path) -> anyhow::Result<SubmissionDescriptor> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open submission {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    let submission: SubmissionDescriptor = serde_json::from_reader(reader)
        .with_context(|| format!("Failed to parse submission {}", path.display()))?;
    submission.validate()?;
    Ok(submission)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        grader: grader_config,
        store: store_config,
    } = cli.to_config().context("Failed to load configuration")?;

    let db_path = match store_config.path {
        Some(path) => path,
        None => db::get_db_path()?,
    };
    if cli.flush_data {
        db::remove_db(&db_path);
    }

    let store = Arc::new(
        SqliteStore::open(&db_path)
            .await
            .context("Failed to initialize result store")?,
    );

    let submissions = cli
        .submissions
        .iter()
        .map(|path| load_submission(path))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let grader = Grader::from_config(&grader_config)?;
    let mut pool = GradingPool::start(grader_config.workers, grader, store.clone())?;

    // ======= PREPARATION END, EXECUTION START =======

    let mut pending = JoinSet::new();
    for submission in submissions {
        let submission_id = submission.submission_id.clone();
        store
            .insert_pending(&submission_id)
            .await
            .with_context(|| format!("Failed to register submission {submission_id}"))?;

        let rx = pool.submit_with_notification(submission).await?;
        let store = store.clone();
        pending.spawn(async move {
            if rx.await.is_err() {
                log::error!("Submission {submission_id} was dropped before grading finished");
            }
            store.fetch(&submission_id).await
        });
    }

    // ===== EXECUTION END, WAITING FOR RESULTS ======

    let mut records = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl-c received, shutting down...");
                break;
            }
            Some(res_worker) = pool.join_next() => {
                log::error!("A worker terminated unexpectedly: {:?}", res_worker);
                break;
            }
            res = pending.join_next() => match res {
                Some(Ok(Ok(Some(record)))) => records.push(record),
                Some(Ok(Ok(None))) => log::error!("A graded submission is missing from the result store"),
                Some(Ok(Err(e))) => log::error!("Failed to read result store: {e}"),
                Some(Err(e)) => log::error!("Result collector failed: {e}"),
                None => break,
            },
        }
    }

    pool.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&records)?);
    log::info!("Shutdown complete");
    Ok(())
}
