use std::path::PathBuf;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(taskdir_backend::config::default_config_path);

    if let Err(e) = taskdir_backend::run(&config_path).await {
        log::error!("[taskdir.startup] {}", e);
        std::process::exit(1);
    }
}
