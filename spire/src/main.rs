use std::{net::SocketAddr, path::PathBuf, time::Duration};

use spire::{
    app,
    config::{Config, Settings},
    identity::Identity,
    store,
};

const HELP: &str = "
spire

USAGE:
    spire [options]

FLAGS:
    -h, --help              Print this message

OPTIONS
    -p, --port             Port to run spire on (default: 8080)
    --host                 Host to run spire on (default: 0.0.0.0)
    -c, --config           JSON configuration file (default: $SPIRE_CONFIG)
    -d, --data-dir         Directory to keep data in (default: temporary)
";

/// How often expired requests, assertion IDs and sessions are swept.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

struct AppArgs {
    /// Port on which the app should run.
    port: i32,
    /// Host to run the app on.
    host: String,
    /// Falls back to `SPIRE_CONFIG`.
    config: Option<PathBuf>,
    /// Persistent store location. A temporary store is used when absent.
    data_dir: Option<PathBuf>,
}

fn parse_args() -> Result<AppArgs, pico_args::Error> {
    let mut pargs = pico_args::Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        eprintln!("{}", HELP);
        std::process::exit(1);
    }

    let args = AppArgs {
        port: pargs.opt_value_from_str(["-p", "--port"])?.unwrap_or(8080),
        host: pargs
            .opt_value_from_str("--host")?
            .unwrap_or_else(|| "0.0.0.0".into()),
        config: pargs.opt_value_from_str(["-c", "--config"])?,
        data_dir: pargs.opt_value_from_str(["-d", "--data-dir"])?,
    };

    Ok(args)
}

#[tokio::main]
async fn main() {
    let args = parse_args().expect("Failed to parse args");

    let config_path = args
        .config
        .or_else(|| std::env::var_os("SPIRE_CONFIG").map(PathBuf::from))
        .expect("No configuration file, pass --config or set SPIRE_CONFIG");
    let config = Config::from_file(&config_path).expect("Failed to load configuration");
    let store = match &args.data_dir {
        Some(dir) => store::MemoryStore::open(dir).expect("Failed to open store"),
        None => store::MemoryStore::new().expect("Failed to construct in-memory store"),
    };
    for tenant in &config.tenants {
        for seed in &tenant.identities {
            store
                .insert_identity(&Identity::from_seed(&tenant.id, seed))
                .expect("Failed to seed identity");
        }
    }
    let settings = Settings::new(config).expect("Invalid configuration");

    let purge_store = store.clone();
    let session_lifetime = settings.session_lifetime();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = store::purge_expired(&purge_store, session_lifetime).await {
                tracing::error!("Failed to purge expired records: {}", e);
            }
        }
    });

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .expect("Invalid address");

    // Run the app on 0.0.0.0 so that it works in a container.
    warp::serve(app(store, settings).await).run(addr).await;
}
