//! Ingestion dispatch: one router task and one actor task per program.
//!
//! The router owns the map program → actor queue. Each actor owns a
//! `ProgramIngestor` and processes its jobs strictly in order, so the window
//! read-modify-write for a program never runs concurrently. Different programs
//! are handled by different actors in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::ingest::{MeasurementRecord, ProgramIngestor};
use super::rules::RuleEngine;
use super::MonitoringError;
use crate::config::EngineConfig;
use crate::db::Store;
use crate::models::MeasurementInput;

type Reply = oneshot::Sender<Result<MeasurementRecord, MonitoringError>>;

enum RouterCommand {
    Ingest {
        program_id: Uuid,
        input: MeasurementInput,
        reply: Reply,
    },
    /// Drop the actor of a program that is no longer active.
    Retire { program_id: Uuid },
}

struct ProgramJob {
    input: MeasurementInput,
    reply: Reply,
}

/// Cloneable handle used by request handlers and device agents.
#[derive(Debug, Clone)]
pub struct IngestionHandle {
    tx: mpsc::Sender<RouterCommand>,
}

impl std::fmt::Debug for RouterCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ingest { program_id, .. } => f.debug_struct("Ingest").field("program_id", program_id).finish(),
            Self::Retire { program_id } => f.debug_struct("Retire").field("program_id", program_id).finish(),
        }
    }
}

impl IngestionHandle {
    /// Ingest one measurement. Resolves once the measurement is persisted and
    /// its alerts have been dispatched.
    pub async fn ingest(
        &self,
        program_id: Uuid,
        input: MeasurementInput,
    ) -> Result<MeasurementRecord, MonitoringError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::Ingest {
                program_id,
                input,
                reply,
            })
            .await
            .map_err(|_| MonitoringError::Unavailable)?;
        rx.await.map_err(|_| MonitoringError::Unavailable)?
    }

    /// Ask the router to drop a program's actor. Best effort.
    pub fn retire(&self, program_id: Uuid) {
        if let Err(e) = self.tx.try_send(RouterCommand::Retire { program_id }) {
            tracing::debug!(program_id = %program_id, error = %e, "Retire request not queued");
        }
    }
}

/// Running ingestion pipeline. Dropping it stops the router as `shutdown` does.
pub struct IngestionDispatcher {
    handle: IngestionHandle,
    shutdown_tx: Option<oneshot::Sender<()>>,
    router: Option<JoinHandle<()>>,
}

impl IngestionDispatcher {
    /// Spawn the router task. Must be called inside a tokio runtime.
    pub fn start(store: Arc<Store>, rules: RuleEngine, config: EngineConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.router_queue_depth.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let router = tokio::spawn(run_router(store, rules, config, rx, shutdown_rx));
        tracing::info!("Ingestion dispatcher started");

        Self {
            handle: IngestionHandle { tx },
            shutdown_tx: Some(shutdown_tx),
            router: Some(router),
        }
    }

    pub fn handle(&self) -> IngestionHandle {
        self.handle.clone()
    }

    /// Stop accepting new work. Actors finish the jobs already queued.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            tracing::info!("Ingestion dispatcher shutdown signal sent");
        }
    }

    /// Wait for the router task to exit.
    pub async fn join(&mut self) {
        if let Some(router) = self.router.take() {
            if let Err(e) = router.await {
                tracing::error!("Ingestion router task failed: {e}");
            }
        }
    }
}

async fn run_router(
    store: Arc<Store>,
    rules: RuleEngine,
    config: EngineConfig,
    mut rx: mpsc::Receiver<RouterCommand>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut actors: HashMap<Uuid, mpsc::Sender<ProgramJob>> = HashMap::new();

    loop {
        let command = tokio::select! {
            _ = &mut shutdown_rx => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            RouterCommand::Ingest {
                program_id,
                input,
                reply,
            } => {
                let actor = actors
                    .entry(program_id)
                    .or_insert_with(|| spawn_actor(program_id, &store, &rules, &config));
                // Never wait on one program's queue: a full queue is reported
                // to the caller while the router keeps serving other programs.
                match actor.try_send(ProgramJob { input, reply }) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(job)) => {
                        tracing::warn!(program_id = %program_id, "Program queue full, measurement rejected");
                        let _ = job.reply.send(Err(MonitoringError::QueueFull(program_id)));
                    }
                    Err(mpsc::error::TrySendError::Closed(job)) => {
                        // Actor exited; start a fresh one (its window reloads from the log).
                        tracing::warn!(program_id = %program_id, "Program actor gone, respawning");
                        let fresh = spawn_actor(program_id, &store, &rules, &config);
                        if let Err(e) = fresh.try_send(job) {
                            let job = match e {
                                mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
                            };
                            let _ = job.reply.send(Err(MonitoringError::Unavailable));
                        }
                        actors.insert(program_id, fresh);
                    }
                }
            }
            RouterCommand::Retire { program_id } => {
                if actors.remove(&program_id).is_some() {
                    tracing::debug!(program_id = %program_id, "Program actor retired");
                }
            }
        }
    }

    tracing::info!(actors = actors.len(), "Ingestion router stopped");
}

fn spawn_actor(
    program_id: Uuid,
    store: &Arc<Store>,
    rules: &RuleEngine,
    config: &EngineConfig,
) -> mpsc::Sender<ProgramJob> {
    let (tx, mut rx) = mpsc::channel::<ProgramJob>(config.program_queue_depth.max(1));
    let mut ingestor = ProgramIngestor::new(program_id, store.clone(), rules.clone(), config);

    tokio::spawn(async move {
        tracing::debug!(program_id = %program_id, "Program actor started");
        while let Some(job) = rx.recv().await {
            let ProgramJob { input, reply } = job;
            // SQLite and notifier calls block; keep them off the async workers.
            let joined = tokio::task::spawn_blocking(move || {
                let result = ingestor.ingest(input);
                (ingestor, result)
            })
            .await;
            let result = match joined {
                Ok((returned, result)) => {
                    ingestor = returned;
                    result
                }
                Err(e) => {
                    tracing::error!(program_id = %program_id, "Program ingest task failed: {e}");
                    let _ = reply.send(Err(MonitoringError::Unavailable));
                    return;
                }
            };
            if let Err(e) = &result {
                tracing::warn!(program_id = %program_id, error = %e, "Measurement rejected");
            }
            // Caller may have gone away; the measurement is processed regardless.
            let _ = reply.send(result);
        }
        tracing::debug!(program_id = %program_id, "Program actor stopped");
    });

    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{MonitoringProgram, ProgramStatus};
    use crate::monitoring::ingest::tests::{active_program, input};
    use crate::notify::{LogNotifier, Notification, Notifier, NotifyError, TargetRole};
    use std::time::{Duration, Instant};

    /// Notifier that takes a while to answer.
    struct SlowNotifier(Duration);

    impl Notifier for SlowNotifier {
        fn notify(&self, _: &str, _: TargetRole, _: &Notification) -> Result<(), NotifyError> {
            std::thread::sleep(self.0);
            Ok(())
        }
    }

    fn start() -> (Arc<Store>, IngestionDispatcher) {
        let store = Arc::new(Store::in_memory("tenant-test").unwrap());
        let rules = RuleEngine::new(store.clone(), Arc::new(LogNotifier));
        let dispatcher = IngestionDispatcher::start(store.clone(), rules, EngineConfig::default());
        (store, dispatcher)
    }

    #[tokio::test]
    async fn ingests_through_actor() {
        let (store, dispatcher) = start();
        let program = active_program(&store);
        let handle = dispatcher.handle();

        for _ in 0..9 {
            handle.ingest(program.id, input("heart_rate", 10.0)).await.unwrap();
        }
        let spike = handle.ingest(program.id, input("heart_rate", 100.0)).await.unwrap();
        assert!(spike.measurement.is_anomaly);
    }

    #[tokio::test]
    async fn concurrent_ingestion_is_serialized_per_program() {
        let (store, dispatcher) = start();
        let programs: Vec<MonitoringProgram> = (0..3).map(|_| active_program(&store)).collect();
        let handle = dispatcher.handle();

        let mut tasks = Vec::new();
        for program in &programs {
            for i in 0..20 {
                let handle = handle.clone();
                let program_id = program.id;
                tasks.push(tokio::spawn(async move {
                    handle.ingest(program_id, input("heart_rate", 60.0 + i as f64)).await
                }));
            }
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        for program in &programs {
            let count = store
                .with_conn(|conn| db::count_measurements(conn, &program.id))
                .unwrap();
            assert_eq!(count, 20);
        }
    }

    #[tokio::test]
    async fn errors_are_returned_to_caller() {
        let (store, dispatcher) = start();
        let program = active_program(&store);
        store
            .with_conn(|conn| {
                db::update_program_status(conn, &program.id, ProgramStatus::Active, ProgramStatus::Paused)
            })
            .unwrap();

        let result = dispatcher.handle().ingest(program.id, input("heart_rate", 70.0)).await;
        assert!(matches!(result, Err(MonitoringError::InvalidState(_))));
        let unknown = dispatcher.handle().ingest(Uuid::new_v4(), input("heart_rate", 70.0)).await;
        assert!(matches!(unknown, Err(MonitoringError::ProgramNotFound(_))));
    }

    #[tokio::test]
    async fn retired_actor_is_replaced_on_next_ingest() {
        let (store, dispatcher) = start();
        let program = active_program(&store);
        let handle = dispatcher.handle();
        handle.ingest(program.id, input("heart_rate", 70.0)).await.unwrap();
        handle.retire(program.id);
        handle.ingest(program.id, input("heart_rate", 71.0)).await.unwrap();
        let count = store.with_conn(|conn| db::count_measurements(conn, &program.id)).unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn shutdown_stops_router() {
        let (store, mut dispatcher) = start();
        let program = active_program(&store);
        let handle = dispatcher.handle();
        dispatcher.shutdown();
        dispatcher.join().await;

        let result = handle.ingest(program.id, input("heart_rate", 70.0)).await;
        assert!(matches!(result, Err(MonitoringError::Unavailable)));
        // Second shutdown is a no-op.
        dispatcher.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn busy_program_does_not_delay_others() {
        use crate::models::{ActionKind, AlertCondition, AlertRule, AlertSeverity, RuleAction};

        let store = Arc::new(Store::in_memory("tenant-test").unwrap());
        let rules = RuleEngine::new(store.clone(), Arc::new(SlowNotifier(Duration::from_millis(200))));
        let config = EngineConfig {
            program_queue_depth: 1,
            ..EngineConfig::default()
        };
        let dispatcher = IngestionDispatcher::start(store.clone(), rules, config);
        let handle = dispatcher.handle();

        let busy = active_program(&store);
        let quiet = active_program(&store);
        let rule = AlertRule {
            id: Uuid::new_v4(),
            program_id: busy.id,
            parameter: "heart_rate".into(),
            condition: AlertCondition::Above,
            threshold: 0.0,
            severity: AlertSeverity::Medium,
            enabled: true,
            actions: vec![RuleAction::enabled(ActionKind::NotifyClinician)],
            created_at: chrono::Utc::now(),
        };
        store.with_conn(|conn| db::insert_alert_rule(conn, &rule)).unwrap();

        let mut backlog = Vec::new();
        for i in 0..6 {
            let handle = handle.clone();
            let program_id = busy.id;
            backlog.push(tokio::spawn(async move {
                handle.ingest(program_id, input("heart_rate", 70.0 + i as f64)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        handle.ingest(quiet.id, input("heart_rate", 70.0)).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(150));

        let mut accepted = 0;
        let mut rejected = 0;
        for task in backlog {
            match task.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(MonitoringError::QueueFull(id)) => {
                    assert_eq!(id, busy.id);
                    rejected += 1;
                }
                Err(e) => panic!("unexpected ingest error: {e}"),
            }
        }
        assert!(accepted >= 1);
        assert_eq!(accepted + rejected, 6);
    }
}
