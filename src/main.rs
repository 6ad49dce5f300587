use fleetwatch::channels::{ChannelDispatcher, ChannelSender};
use fleetwatch::config::EngineConfig;
use fleetwatch::{logging, Engine};
use rocket::fairing::AdHoc;
use rocket_cors::{AllowedOrigins, CorsOptions};
use std::sync::Arc;
use tracing::{error, info};

#[rocket::launch]
fn rocket() -> _ {
    logging::init_logging();

    let config = EngineConfig::from_env().expect("Invalid configuration");
    info!(
        database = %config.database_path,
        max_concurrent_checks = config.max_concurrent_checks,
        timeout_secs = config.check_timeout.as_secs(),
        smtp = config.smtp.is_some(),
        "configuration loaded"
    );

    let sender: Arc<dyn ChannelSender> =
        Arc::new(ChannelDispatcher::new(config.smtp.clone()).expect("Failed to build notification client"));
    let engine = Engine::open(config, sender).expect("Failed to initialize database");

    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .to_cors()
        .expect("CORS configuration failed");

    let starter = engine.scheduler.clone();
    let stopper = engine.scheduler.clone();

    engine
        .rocket()
        .attach(cors)
        .attach(AdHoc::on_liftoff("Scheduler", move |rocket| {
            Box::pin(async move {
                match starter.start() {
                    Ok(n) => info!(services = n, "monitoring started"),
                    Err(e) => {
                        error!("cannot load services, shutting down: {}", e);
                        rocket.shutdown().notify();
                    }
                }
            })
        }))
        .attach(AdHoc::on_shutdown("Scheduler", move |_| {
            Box::pin(async move {
                info!("draining in-flight checks");
                stopper.shutdown().await;
            })
        }))
}
