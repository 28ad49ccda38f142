use std::net::SocketAddr;

use fitpulse::{
    init_logging, log_app_bind, log_app_start, log_pipeline_config, logging_config_from_env,
    pipeline_config_from_env, preprocess_router, ColumnSchema,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("preprocess_server", &logging_cfg);

    let addr: SocketAddr = std::env::var("FITPULSE_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let pipeline_cfg = pipeline_config_from_env();
    let schema = ColumnSchema::from_config(&pipeline_cfg)?;
    log_pipeline_config(&pipeline_cfg, schema.fingerprint());

    let app = preprocess_router(pipeline_cfg)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
