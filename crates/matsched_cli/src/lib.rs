//! Command-line interface for matsched.
//!
//! The binary wires the whole substrate explicitly: queue, GPU manager,
//! scheduler, worker pool, worker monitor, webhook dispatcher, and alert
//! checker are constructed here and handed to each other; nothing is
//! global. The `demo` subcommand drives the stack end-to-end on mock
//! devices and a mock calculator.

use clap::{Parser, Subcommand};
use colored::Colorize;
use indexmap::IndexMap;
use matsched_core::{
    CallbackConfig, CancelToken, ModelCatalog, SchedError, Settings, StructureRef, TaskError,
    TaskPriority, TaskState, TaskType,
};
use matsched_exec::{
    ExecutorRegistry, MockModelLoader, SubmitRequest, SyntheticStructureSource, TaskLogService,
    TaskService, WorkerPool,
};
use matsched_notify::{
    AlertChecker, AlertNotifier, AlertRuleEngine, DiskFreeCollector, FnCollector,
    WebhookDispatcher, WebhookPolicy,
};
use matsched_sched::{
    GpuManager, InMemoryTaskRepository, MemoryEstimator, MockProbe, PriorityQueue, Scheduler,
    TaskFilter, TaskRepository, WorkerManager,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::info;

/// GPU job scheduler for ML-potential simulation workloads.
#[derive(Debug, Parser)]
#[command(name = "matsched", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the full substrate on mock GPUs with a mock calculator.
    Demo {
        /// Number of mock devices.
        #[arg(long, default_value_t = 2)]
        gpus: u32,

        /// Number of tasks to submit.
        #[arg(long, default_value_t = 6)]
        tasks: usize,

        /// Model name from the catalog.
        #[arg(long, default_value = "mace-mp-0-medium")]
        model: String,

        /// Optional webhook URL receiving task callbacks.
        #[arg(long)]
        callback_url: Option<String>,
    },

    /// List the built-in alert rules.
    Rules,

    /// List the model catalog.
    Models,
}

/// Runs a parsed command, returning the process exit code.
pub async fn run(cli: Cli) -> Result<i32, SchedError> {
    match cli.command {
        Commands::Demo {
            gpus,
            tasks,
            model,
            callback_url,
        } => run_demo(gpus, tasks, &model, callback_url).await,
        Commands::Rules => {
            print_rules().await;
            Ok(0)
        }
        Commands::Models => {
            print_models();
            Ok(0)
        }
    }
}

async fn print_rules() {
    let engine = AlertRuleEngine::with_builtin();
    for rule in engine.list_rules(false).await {
        let level = match rule.level {
            matsched_notify::AlertLevel::Critical => "CRITICAL".red().bold(),
            matsched_notify::AlertLevel::Warning => "WARNING".yellow(),
            matsched_notify::AlertLevel::Info => "INFO".normal(),
        };
        println!(
            "{:<18} {:<8} {} {} {:<6}  cooldown {}s",
            rule.id,
            level,
            rule.condition.metric,
            rule.condition.operator.as_str(),
            rule.condition.threshold,
            rule.cooldown_seconds,
        );
    }
}

fn print_models() {
    for record in ModelCatalog::builtin().list() {
        println!(
            "{:<20} {:<10} {:>6} MiB",
            record.name.as_str().bold(),
            format!("{:?}", record.family).to_lowercase(),
            record.memory_mb,
        );
    }
}

async fn run_demo(
    gpu_count: u32,
    task_count: usize,
    model: &str,
    callback_url: Option<String>,
) -> Result<i32, SchedError> {
    let settings = Settings::from_env();
    let shutdown = CancelToken::new();

    // Shared state.
    let probe = Arc::new(MockProbe::new(gpu_count));
    let gpus = Arc::new(GpuManager::new(
        probe,
        None,
        &[],
        settings.max_models_per_gpu,
        settings.memory_safety_margin_mb,
    ));
    let repo: Arc<InMemoryTaskRepository> = Arc::new(InMemoryTaskRepository::new());
    let queue = Arc::new(PriorityQueue::new());
    let catalog = Arc::new(RwLock::new(ModelCatalog::builtin()));
    let estimator = MemoryEstimator::new(Arc::clone(&catalog));

    if !catalog.read().await.is_usable(model) {
        return Err(SchedError::Validation(format!("unknown model: {model}")));
    }

    // Worker registry and the lost-worker recovery path.
    let (workers, mut lost_rx) = WorkerManager::new(
        settings.heartbeat_interval,
        settings.heartbeat_timeout,
    );
    let workers = Arc::new(workers);
    tokio::spawn({
        let repo = Arc::clone(&repo);
        let gpus = Arc::clone(&gpus);
        async move {
            while let Some(lost) = lost_rx.recv().await {
                if let Some(task_id) = lost.task_id {
                    let _ = repo.set_error(task_id, TaskError::new("worker_lost")).await;
                    let _ = repo.transition(task_id, TaskState::Failed).await;
                }
                gpus.release(lost.gpu_id).await;
            }
        }
    });
    tokio::spawn({
        let workers = Arc::clone(&workers);
        let shutdown = shutdown.clone();
        async move { workers.run(shutdown).await }
    });

    // Worker pool and scheduler.
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let logs = Arc::new(TaskLogService::default());
    let pool = Arc::new(WorkerPool::new(
        Arc::clone(&gpus),
        Arc::clone(&repo) as Arc<dyn TaskRepository>,
        Arc::new(MockModelLoader::new()),
        Arc::new(SyntheticStructureSource),
        Arc::new(ExecutorRegistry::standard()),
        Arc::clone(&workers),
        estimator.clone(),
        event_tx.clone(),
        Arc::clone(&logs),
        settings.heartbeat_interval,
    ));
    let dispatch = pool.spawn(shutdown.clone()).await;

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&queue),
        Arc::clone(&gpus),
        Arc::clone(&repo) as Arc<dyn TaskRepository>,
        estimator,
        dispatch,
        settings.poll_interval,
    ));
    tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });

    // Callback delivery.
    let dispatcher = Arc::new(WebhookDispatcher::new(WebhookPolicy {
        max_retries: settings.webhook_max_retries,
        ..WebhookPolicy::default()
    }));
    tokio::spawn({
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            while let Some(event) = event_rx.recv().await {
                let Some(callback) = event.callback.clone() else {
                    continue;
                };
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    dispatcher
                        .send(&callback, event.event, event.task_id, event.data)
                        .await;
                });
            }
        }
    });

    // Alert checker with live collectors.
    let mut checker = AlertChecker::new(
        AlertRuleEngine::with_builtin(),
        AlertNotifier::new(None, None, 1000),
        settings.alert_check_interval,
    );
    checker.add_collector(Box::new(FnCollector::new({
        let gpus = Arc::clone(&gpus);
        move || {
            let gpus = Arc::clone(&gpus);
            async move {
                let summary = gpus.summary().await;
                let mut metrics = IndexMap::new();
                metrics.insert("available_gpus".to_string(), summary.free_gpus as f64);
                metrics.insert("total_gpus".to_string(), summary.total_gpus as f64);
                let min_free = summary
                    .gpus
                    .iter()
                    .map(|g| g.memory_free_mb as f64 / 1024.0)
                    .fold(f64::INFINITY, f64::min);
                if min_free.is_finite() {
                    metrics.insert("min_gpu_free_memory_gb".to_string(), min_free);
                }
                let max_temp = summary
                    .gpus
                    .iter()
                    .map(|g| g.temperature_c as f64)
                    .fold(0.0_f64, f64::max);
                metrics.insert("max_gpu_temp".to_string(), max_temp);
                Ok(metrics)
            }
        }
    })));
    checker.add_collector(Box::new(FnCollector::new({
        let queue = Arc::clone(&queue);
        move || {
            let queue = Arc::clone(&queue);
            async move {
                let mut metrics = IndexMap::new();
                metrics.insert("queue_length".to_string(), queue.len().await as f64);
                Ok(metrics)
            }
        }
    })));
    checker.add_collector(Box::new(FnCollector::new({
        let workers = Arc::clone(&workers);
        move || {
            let workers = Arc::clone(&workers);
            async move {
                let mut metrics = IndexMap::new();
                metrics.insert(
                    "active_workers".to_string(),
                    workers.active_count().await as f64,
                );
                Ok(metrics)
            }
        }
    })));
    checker.add_collector(Box::new(DiskFreeCollector));
    let checker = Arc::new(checker);
    tokio::spawn({
        let checker = Arc::clone(&checker);
        let shutdown = shutdown.clone();
        async move { checker.run(shutdown).await }
    });

    // Submit the demo workload.
    let service = TaskService::new(
        Arc::clone(&repo) as Arc<dyn TaskRepository>,
        Arc::clone(&queue),
        Arc::clone(&catalog),
        pool.cancel_registry(),
        event_tx,
        logs,
    );

    let mut submitted = Vec::with_capacity(task_count);
    for index in 0..task_count {
        let task_type = if index % 2 == 0 {
            TaskType::SinglePoint
        } else {
            TaskType::Optimization
        };
        let priority = match index % 3 {
            0 => TaskPriority::Normal,
            1 => TaskPriority::High,
            _ => TaskPriority::Low,
        };
        let mut request = SubmitRequest::new(
            task_type,
            model,
            StructureRef {
                id: format!("demo-{index}"),
                n_atoms: 8,
                formula: "C8".into(),
                lattice: [[12.0, 0.0, 0.0], [0.0, 12.0, 0.0], [0.0, 0.0, 12.0]],
            },
        );
        request.priority = priority;
        if let Some(url) = &callback_url {
            request.callback = Some(CallbackConfig::new(url.clone()));
        }
        let receipt = service.submit(request).await?;
        println!(
            "submitted {} {:<13} priority {:<8} queue position {}",
            receipt.task_id,
            task_type.to_string(),
            priority.to_string(),
            receipt.queue_position,
        );
        submitted.push(receipt.task_id);
    }

    // Wait for every task to reach a terminal state.
    let started = Instant::now();
    let deadline = Duration::from_secs(120);
    loop {
        let rows = repo.list(TaskFilter::default(), task_count, 0).await?;
        let done = rows
            .iter()
            .filter(|t| matsched_core::Lifecycle::is_terminal(t.state))
            .count();
        if done == task_count {
            break;
        }
        if started.elapsed() > deadline {
            println!("{}", "demo timed out waiting for tasks".red());
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    println!();
    for task_id in &submitted {
        let task = repo.get(*task_id).await?;
        let state = match task.state {
            TaskState::Completed => "completed".green(),
            TaskState::Failed => "failed".red(),
            TaskState::Cancelled | TaskState::Timeout => task.state.as_str().yellow(),
            _ => task.state.as_str().normal(),
        };
        let duration = match (task.started_at, task.completed_at) {
            (Some(start), Some(end)) => format!(
                "{:.2}s",
                (end - start).num_milliseconds() as f64 / 1000.0
            ),
            _ => "-".to_string(),
        };
        println!("{} {:<13} {} {}", task.id, task.task_type.to_string(), state, duration);
    }

    // Final snapshots.
    let stats = scheduler.stats().snapshot();
    println!(
        "\nscheduler: {} attempts, {} scheduled, {} no-gpu ticks",
        stats.schedule_attempts, stats.schedule_successes, stats.no_free_gpu
    );
    let summary = gpus.summary().await;
    println!(
        "gpus: {} total, {} free, {} busy, {} error",
        summary.total_gpus, summary.free_gpus, summary.busy_gpus, summary.error_gpus
    );
    let alerts = checker.check_once().await;
    println!("alerts on final check: {}", alerts.len());
    if callback_url.is_some() {
        // Give in-flight callbacks a moment before reading stats.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let stats = dispatcher.stats().await;
        println!(
            "callbacks: {} sent, {} ok, {} failed",
            stats.total, stats.success, stats.failed
        );
    }

    info!("demo_finished");
    shutdown.cancel();
    Ok(0)
}
