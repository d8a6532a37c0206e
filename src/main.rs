use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use vllm_deployer::{server, AppState, ConfigurationProfile, EngineParameters};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    log::info!("Starting vLLM deployer server...");

    let profile = match ConfigurationProfile::detect().await {
        Ok(p) => p,
        Err(e) => {
            log::error!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };
    profile.log_summary();
    log::info!(
        "Engine command: {}",
        EngineParameters::from_profile(&profile).command_line().join(" ")
    );

    let bind = (profile.host.clone(), profile.port);
    let state = match AppState::new(profile) {
        Ok(s) => web::Data::new(s),
        Err(e) => {
            log::error!("Cannot set up engine client: {}", e);
            std::process::exit(2);
        }
    };
    if state.demo_mode() {
        log::warn!("ENGINE_URL is not set; serving demo responses");
    }

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(Cors::permissive())
            .app_data(state.clone())
            .configure(server::configure)
    })
    .bind(bind)?
    .run()
    .await
}
