//! Wiring for one tenant: store, services and the background tasks that
//! serve it. Built once at startup and torn down on shutdown.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::db::{DatabaseError, Store};
use crate::device_registry::DeviceRegistry;
use crate::monitoring::{
    AlertReview, Housekeeper, HousekeepingTask, IngestionDispatcher, IngestionHandle, ProgramService,
    RuleEngine,
};
use crate::notify::{LogNotifier, Notifier};
use crate::session::{
    LocalRoomProvider, PrescriptionService, ProviderError, ProviderRegistry, QosSampler,
    QualityDegraded, SessionManager, SimulatedQualitySource,
};
use crate::signing::{DigestSigner, PrescriptionSigner};

const SIGNING_KEY_FILE: &str = "signing.key";
const QUALITY_EVENT_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid signing key at {0}")]
    InvalidSigningKey(String),
}

pub struct Engine {
    store: Arc<Store>,
    config: EngineConfig,
    sessions: SessionManager,
    prescriptions: PrescriptionService,
    programs: ProgramService,
    devices: DeviceRegistry,
    alerts: AlertReview,
    providers: Arc<ProviderRegistry>,
    dispatcher: IngestionDispatcher,
    housekeeping: HousekeepingTask,
    quality_events: Option<mpsc::Receiver<QualityDegraded>>,
}

impl Engine {
    /// Open the tenant's database under the data directory and start serving it.
    pub fn open_tenant(tenant_id: &str, config: EngineConfig) -> Result<Self, EngineError> {
        let store = Arc::new(Store::open_tenant(tenant_id)?);
        Self::start(store, config, Arc::new(LogNotifier))
    }

    /// Build services over `store` and spawn the background tasks.
    /// Must be called inside a tokio runtime.
    pub fn start(
        store: Arc<Store>,
        config: EngineConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, EngineError> {
        let signer: Arc<dyn PrescriptionSigner> = match store.path() {
            Some(db_path) => Arc::new(load_or_create_signer(db_path)?),
            None => Arc::new(DigestSigner::random()),
        };

        let providers = Arc::new(ProviderRegistry::new());
        providers.register(Arc::new(LocalRoomProvider::new("local")), 0)?;

        let (quality_tx, quality_rx) = mpsc::channel(QUALITY_EVENT_BUFFER);
        let sampler = QosSampler::new(store.clone(), Arc::new(SimulatedQualitySource), &config)
            .with_events(quality_tx);

        let prescriptions = PrescriptionService::new(store.clone(), signer);
        let sessions = SessionManager::new(
            store.clone(),
            providers.clone(),
            prescriptions.clone(),
            sampler,
        );

        let programs = ProgramService::new(store.clone());
        let rules = RuleEngine::new(store.clone(), notifier);
        let dispatcher = IngestionDispatcher::start(store.clone(), rules.clone(), config.clone());

        let housekeeper = Housekeeper::new(programs.clone(), rules)
            .with_ingestion(dispatcher.handle())
            .with_prescriptions(prescriptions.clone());
        let housekeeping = HousekeepingTask::spawn(housekeeper, config.housekeeping_interval());

        tracing::info!(tenant_id = store.tenant_id(), "Engine started");

        Ok(Self {
            devices: DeviceRegistry::new(store.clone()),
            alerts: AlertReview::new(store.clone()),
            store,
            config,
            sessions,
            prescriptions,
            programs,
            providers,
            dispatcher,
            housekeeping,
            quality_events: Some(quality_rx),
        })
    }

    pub fn tenant_id(&self) -> &str {
        self.store.tenant_id()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn prescriptions(&self) -> &PrescriptionService {
        &self.prescriptions
    }

    pub fn programs(&self) -> &ProgramService {
        &self.programs
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn alerts(&self) -> &AlertReview {
        &self.alerts
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn ingestion(&self) -> IngestionHandle {
        self.dispatcher.handle()
    }

    /// Receiver for `QualityDegraded` events. Can be taken once.
    pub fn take_quality_events(&mut self) -> Option<mpsc::Receiver<QualityDegraded>> {
        self.quality_events.take()
    }

    /// Stop background work and wait for it to finish.
    pub async fn shutdown(&mut self) {
        for session in self
            .sessions
            .list_by_status(crate::models::SessionStatus::InProgress)
            .unwrap_or_default()
        {
            self.sessions.sampler().deactivate(&session.id);
        }
        self.housekeeping.shutdown();
        self.dispatcher.shutdown();
        self.housekeeping.join().await;
        self.dispatcher.join().await;
        tracing::info!(tenant_id = self.store.tenant_id(), "Engine stopped");
    }
}

/// Read the tenant's signing secret next to its database, creating it on first use.
fn load_or_create_signer(db_path: &Path) -> Result<DigestSigner, EngineError> {
    let key_path = db_path.with_file_name(SIGNING_KEY_FILE);
    if key_path.exists() {
        let secret = std::fs::read(&key_path)?;
        if secret.len() < 32 {
            return Err(EngineError::InvalidSigningKey(key_path.display().to_string()));
        }
        return Ok(DigestSigner::new(secret));
    }

    let secret: [u8; 32] = rand::random();
    if let Some(parent) = key_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&key_path, secret)?;
    tracing::info!(path = %key_path.display(), "Signing key created");
    Ok(DigestSigner::new(secret.to_vec()))
}
