use actix_web::{web, App, HttpServer};
use std::time::Duration;
use vllm_deployer::health::{wait_until_healthy, HealthGate, HealthOutcome, HttpProbe};
use vllm_deployer::platform::{Accelerator, HostInfo, Platform};
use vllm_deployer::{server, AppState, ConfigurationProfile, EnvSettings};

/// Serve the wrapper in demo mode on an ephemeral port and return its base URL.
fn start_wrapper() -> String {
    let profile = ConfigurationProfile::resolve(
        HostInfo {
            platform: Platform::Linux,
            arch: "x86_64".to_string(),
            apple_silicon: false,
            accelerator: Accelerator::None,
            gpu_devices: 0,
            warnings: vec![],
        },
        EnvSettings::default(),
    );
    let state = web::Data::new(AppState::new(profile).unwrap());
    let server = HttpServer::new(move || App::new().app_data(state.clone()).configure(server::configure))
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
    let addr = server.addrs()[0];
    actix_rt::spawn(server.run());
    format!("http://{}", addr)
}

#[actix_rt::test]
async fn test_gate_passes_against_running_wrapper() {
    let base = start_wrapper();
    let probe = HttpProbe::new(format!("{}/health", base)).unwrap();

    let outcome = HealthGate::new(5, Duration::from_millis(50)).wait(&probe).await;
    assert!(outcome.is_healthy(), "{:?}", outcome);
    assert_eq!(outcome.attempts(), 1);
}

#[actix_rt::test]
async fn test_gate_exhausts_on_missing_route() {
    let base = start_wrapper();
    let probe = HttpProbe::new(format!("{}/not-here", base)).unwrap();

    let outcome = HealthGate::new(3, Duration::from_millis(10)).wait(&probe).await;
    match outcome {
        HealthOutcome::Exhausted {
            attempts,
            deadline_exceeded,
            recent_failures,
        } => {
            assert_eq!(attempts, 3);
            assert!(!deadline_exceeded);
            assert_eq!(recent_failures.len(), 3);
            assert!(recent_failures[2].contains("HTTP 404"));
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
}

#[actix_rt::test]
async fn test_wait_until_healthy() {
    let base = start_wrapper();
    assert!(wait_until_healthy(&format!("{}/health", base), 3, Duration::from_millis(10)).await);
    assert!(!wait_until_healthy("http://127.0.0.1:9/health", 2, Duration::from_millis(10)).await);
}

#[actix_rt::test]
async fn test_deadline_bounds_total_wait() {
    let probe = HttpProbe::new("http://127.0.0.1:9/health").unwrap();
    let gate = HealthGate::new(100, Duration::from_millis(200)).with_deadline(Duration::from_millis(500));

    let started = std::time::Instant::now();
    let outcome = gate.wait(&probe).await;
    assert!(!outcome.is_healthy());
    assert!(outcome.attempts() < 100);
    assert!(started.elapsed() < Duration::from_secs(5));
}
