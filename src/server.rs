use crate::catchers;
use crate::channels::ChannelSender;
use crate::checker::CheckContext;
use crate::config::EngineConfig;
use crate::db::Db;
use crate::error::Result;
use crate::maintenance::MaintenanceGate;
use crate::routes;
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::sse::EventBroadcaster;
use rocket::{Build, Rocket};
use std::sync::Arc;

const EVENT_BUFFER: usize = 256;

/// Fully wired engine: storage, check pipeline and scheduler.
pub struct Engine {
    pub config: EngineConfig,
    pub db: Arc<Db>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub checks: Arc<CheckContext>,
    pub scheduler: Arc<Scheduler>,
}

impl Engine {
    /// Open the configured database (bootstrapping the schema) and wire the engine.
    pub fn open(config: EngineConfig, sender: Arc<dyn ChannelSender>) -> Result<Self> {
        let db = Arc::new(Db::new(&config.database_path)?);
        Self::with_db(config, db, sender)
    }

    pub fn with_db(config: EngineConfig, db: Arc<Db>, sender: Arc<dyn ChannelSender>) -> Result<Self> {
        let broadcaster = Arc::new(EventBroadcaster::new(EVENT_BUFFER));
        let checks = Arc::new(CheckContext::new(db.clone(), &config, sender, broadcaster.clone())?);
        let scheduler = Arc::new(Scheduler::new(checks.clone(), SchedulerSettings::from_config(&config)));
        Ok(Engine {
            config,
            db,
            broadcaster,
            checks,
            scheduler,
        })
    }

    /// Rocket instance serving the read/trigger API over this engine's state.
    /// Starting and stopping the scheduler is left to the caller.
    pub fn rocket(&self) -> Rocket<Build> {
        rocket::build()
            .manage(self.db.clone())
            .manage(self.broadcaster.clone())
            .manage(self.checks.notifier.clone())
            .manage(self.scheduler.clone())
            .manage(MaintenanceGate::new(self.db.clone()))
            .mount("/api/v1", routes::all())
            .register("/", catchers::all())
    }
}
