use affinity_lab::geo::{GeoPolygonStore, ReverseGeocoder};
use affinity_lab::query::http::HttpQueryExecutor;
use affinity_lab::run::{LabContext, LogSink, ProgressSink, RunOrchestrator};
use affinity_lab::store::{FsBlobStore, SqliteRunStatusStore};
use affinity_lab::{LabConfig, LabError, LabResult, RunRequest};
use std::path::Path;
use std::sync::Arc;

const DEFAULT_GEO_DOWNLOAD_BASE: &str = "https://boundaries.affinity-lab.io/postal";

fn usage() -> ! {
    eprintln!(
        "usage:\n\
         \x20 lab_runner run <request.json>                 run synchronously (single or batch)\n\
         \x20 lab_runner async-start <request.json>         submit the materializing join\n\
         \x20 lab_runner async-advance <dataset> <country>  submit origins once the join is done\n\
         \x20 lab_runner async-complete <dataset> <country> collect, score and clean up\n\
         \x20 lab_runner status <dataset> <country>         print the current run status\n\
         \x20 lab_runner cancel <dataset> <country>         request cooperative cancellation"
    );
    std::process::exit(2);
}

fn load_request(path: &str) -> LabResult<RunRequest> {
    let raw = std::fs::read_to_string(path)?;
    let req: RunRequest = serde_json::from_str(&raw)?;
    req.validate()?;
    Ok(req)
}

fn build_context(config: LabConfig) -> LabResult<LabContext> {
    let executor = HttpQueryExecutor::new(&config.engine_url, config.engine_token.clone())?;
    let blobs = FsBlobStore::new(&config.blob_dir)?;
    let status = SqliteRunStatusStore::new(&config.status_db_path)?;
    let download_base = std::env::var("LAB_GEO_DOWNLOAD_BASE")
        .unwrap_or_else(|_| DEFAULT_GEO_DOWNLOAD_BASE.to_string());
    let polygons = GeoPolygonStore::new(Path::new(&config.geo_cache_dir), &download_base)?;
    Ok(LabContext {
        executor: Arc::new(executor),
        blobs: Arc::new(blobs),
        status: Arc::new(status),
        geocoder: Arc::new(ReverseGeocoder::new(Arc::new(polygons))),
        config,
    })
}

#[tokio::main]
async fn main() -> LabResult<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = LabConfig::from_env();
    log::info!("🧪 Affinity Lab starting");
    log::info!("   engine: {}", config.engine_url);
    log::info!("   blobs:  {}", config.blob_dir);

    let args: Vec<String> = std::env::args().collect();
    let sink: Arc<dyn ProgressSink> = Arc::new(LogSink);

    match args.get(1).map(String::as_str) {
        Some("run") => {
            let Some(path) = args.get(2) else { usage() };
            let req = load_request(path)?;
            let orchestrator = RunOrchestrator::new(build_context(config)?);
            let report = orchestrator.run_sync(&req, sink).await?;
            log::info!(
                "run {} finished: {} recipe(s) scored, {} failed, {} skipped",
                report.run_id,
                report.results.len(),
                report.failed.len(),
                report.skipped.len()
            );
            for result in &report.results {
                log::info!(
                    "   {}: {} devices, {} zipcodes, {} ms",
                    result.recipe_name,
                    result.stats.matched_devices,
                    result.stats.scored_zipcodes,
                    result.stats.elapsed_ms
                );
            }
            for (name, reason) in &report.failed {
                log::error!("   {} failed: {}", name, reason);
            }
        }
        Some("async-start") => {
            let Some(path) = args.get(2) else { usage() };
            let req = load_request(path)?;
            let orchestrator = RunOrchestrator::new(build_context(config)?);
            let state = orchestrator.start_async(&req).await?;
            log::info!(
                "async run {} submitted, visits materializing into {}",
                state.run_id,
                state.visits_table
            );
        }
        Some("async-advance") => {
            let (Some(dataset), Some(country)) = (args.get(2), args.get(3)) else { usage() };
            let orchestrator = RunOrchestrator::new(build_context(config)?);
            let state = orchestrator.advance_async(dataset, country).await?;
            log::info!("async run {} now in phase {:?}", state.run_id, state.phase);
        }
        Some("async-complete") => {
            let (Some(dataset), Some(country)) = (args.get(2), args.get(3)) else { usage() };
            let orchestrator = RunOrchestrator::new(build_context(config)?);
            let report = orchestrator.complete_async(dataset, country, sink).await?;
            log::info!(
                "async run {} finished: {} recipe(s) scored, {} failed",
                report.run_id,
                report.results.len(),
                report.failed.len()
            );
        }
        Some("status") => {
            let (Some(dataset), Some(country)) = (args.get(2), args.get(3)) else { usage() };
            let store = SqliteRunStatusStore::new(&config.status_db_path)?;
            use affinity_lab::store::RunStatusStore;
            match store.get(dataset, country).await? {
                Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
                None => println!("no run recorded for {}/{}", dataset, country),
            }
        }
        Some("cancel") => {
            let (Some(dataset), Some(country)) = (args.get(2), args.get(3)) else { usage() };
            let store = SqliteRunStatusStore::new(&config.status_db_path)?;
            use affinity_lab::store::RunStatusStore;
            let Some(mut status) = store.get(dataset, country).await? else {
                return Err(LabError::Configuration(format!(
                    "no run recorded for {}/{}",
                    dataset, country
                )));
            };
            status.cancel_requested = true;
            store.put(&status).await?;
            log::info!(
                "cancellation requested for run {} ({}/{})",
                status.run_id,
                dataset,
                country
            );
        }
        _ => usage(),
    }
    Ok(())
}
