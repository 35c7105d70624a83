use std::error::Error;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use serde::{Deserialize, Serialize};
use taskq_core::{QueueCounts, QueueEvent, QueueOptions, TaskError, TaskQueue, from_async};
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Run simulated jobs through a concurrency-bounded task queue.
#[derive(Debug, Parser)]
#[command(name = "taskq", version)]
struct Args {
    /// Number of generated jobs (ignored with --jobs).
    #[arg(short = 'n', long, default_value_t = 20)]
    items: u32,

    /// JSON file with an array of jobs: [{"id": 1, "name": "a"}, ...]
    #[arg(long)]
    jobs: Option<PathBuf>,

    /// JSON file with queue options; overrides the flags below.
    #[arg(long)]
    options: Option<PathBuf>,

    #[arg(short, long, default_value_t = 4)]
    concurrency: usize,

    /// Probability that a single attempt fails.
    #[arg(long, default_value_t = 0.2)]
    fail_rate: f64,

    #[arg(long, default_value_t = 2)]
    max_retry: u32,

    #[arg(long)]
    continue_on_error: bool,

    /// Dispatch newest jobs first.
    #[arg(long)]
    lifo: bool,

    /// Upper bound of the simulated work time per attempt, in milliseconds.
    #[arg(long, default_value_t = 50)]
    max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    id: u32,
    name: String,
}

#[derive(Debug, Serialize)]
struct Summary {
    outcome: &'static str,
    error: Option<String>,
    options: QueueOptions,
    counts: QueueCounts,
}

fn load_options(args: &Args) -> Result<QueueOptions, Box<dyn Error>> {
    if let Some(path) = &args.options {
        return Ok(QueueOptions::from_json(&std::fs::read_to_string(path)?)?);
    }
    let options = QueueOptions {
        concurrency: args.concurrency,
        fifo: !args.lifo,
        continue_on_error: args.continue_on_error,
        max_retry_times: args.max_retry,
    };
    options.validate()?;
    Ok(options)
}

fn load_jobs(args: &Args) -> Result<Vec<Job>, Box<dyn Error>> {
    match &args.jobs {
        Some(path) => Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?),
        None => Ok((1..=args.items)
            .map(|id| Job {
                id,
                name: format!("job-{id}"),
            })
            .collect()),
    }
}

/// Pretend to do some work: sleep a random while, fail now and then.
async fn simulate(job: Job, delay: Duration, fail: bool) -> Result<String, TaskError> {
    sleep(delay).await;
    if fail {
        return Err(TaskError::new(format!("{} failed after {delay:?}", job.name)));
    }
    Ok(format!("{} done", job.name))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let options = load_options(&args)?;
    let jobs = load_jobs(&args)?;

    let fail_rate = args.fail_rate.clamp(0.0, 1.0);
    let max_delay_ms = args.max_delay_ms.max(1);

    let queue = TaskQueue::builder(from_async(move |job: Job| {
        let (delay, fail) = {
            let mut rng = rand::thread_rng();
            (
                Duration::from_millis(rng.gen_range(1..=max_delay_ms)),
                rng.gen_bool(fail_rate),
            )
        };
        simulate(job, delay, fail)
    }))
    .options(options.clone())
    .data(jobs)
    .abort_handler(|job: &Job| warn!(job = %job.name, "job cancelled"))
    .build()?;

    let (tx, rx) = oneshot::channel::<Option<TaskError>>();
    let done = Mutex::new(Some(tx));
    queue.subscribe(move |event| {
        match event {
            QueueEvent::TaskFinished { task, value } => info!(job = %task.name, "{value}"),
            QueueEvent::Error { task, error } => warn!(job = %task.name, %error, "attempt failed"),
            QueueEvent::TaskAborted { task } => warn!(job = %task.name, "job aborted"),
            QueueEvent::Pause | QueueEvent::Resume => info!(event = event.name(), "queue"),
            QueueEvent::Finish | QueueEvent::Abort { .. } => {}
        }

        let outcome = match event {
            QueueEvent::Finish => None,
            QueueEvent::Abort { reason } => Some(
                reason
                    .cloned()
                    .unwrap_or_else(|| TaskError::aborted("queue aborted")),
            ),
            _ => return,
        };
        let sender = done.lock().ok().and_then(|mut slot| slot.take());
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    });

    info!(
        total = queue.total_count(),
        concurrency = queue.concurrency(),
        "starting queue"
    );
    queue.start();

    let error = rx.await.unwrap_or(None);
    let summary = Summary {
        outcome: if error.is_none() { "finished" } else { "aborted" },
        error: error.map(|e| e.to_string()),
        options,
        counts: queue.counts(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
