// CLI modules
mod cli;

use cli::{Args, Parser};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(3);
        }
    };

    if let Err(e) = drivefs_daemon::spawn_service(&config).await {
        std::process::exit(e.exit_code());
    }
}
