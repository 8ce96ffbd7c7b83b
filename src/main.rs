//! fleetkv probe
//!
//! Connects to a seed host, waits for the first tend cycle and prints what
//! the client sees: nodes, their addresses and partition ownership per
//! namespace. Extra info names given with `--info` are sent to every node.

use anyhow::Context;
use fleetkv::{AuthConfig, Client, ClientConfig, Host, DEFAULT_PORT};
use std::collections::BTreeMap;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Environment variable holding the hashed credential for `--user`.
const CREDENTIAL_ENV: &str = "FLEETKV_CREDENTIAL";

/// Probe configuration
struct Config {
    /// Seed host
    host: String,
    /// Seed port
    port: u16,
    /// User name, credential taken from the environment
    user: Option<String>,
    /// Info names to query on every node
    info: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            user: None,
            info: Vec::new(),
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = value(&args, i, "--host");
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = value(&args, i, "--port").parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid port number");
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--user" | "-U" => {
                    config.user = Some(value(&args, i, "--user"));
                    i += 2;
                }
                "--info" | "-i" => {
                    config.info.push(value(&args, i, "--info"));
                    i += 2;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("fleetkv version {}", fleetkv::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = ClientConfig::with_hosts(vec![Host::new(self.host.clone(), self.port)]);
        if let Some(user) = &self.user {
            let credential = std::env::var(CREDENTIAL_ENV)
                .with_context(|| format!("--user needs {} to be set", CREDENTIAL_ENV))?;
            config.auth = Some(AuthConfig {
                user: user.clone(),
                credential: credential.into_bytes(),
            });
        }
        Ok(config)
    }
}

fn value(args: &[String], i: usize, flag: &str) -> String {
    match args.get(i + 1) {
        Some(v) => v.clone(),
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"
fleetkv probe - inspect a cluster the way the client sees it

USAGE:
    fleetkv [OPTIONS]

OPTIONS:
    -h, --host <HOST>    Seed host (default: 127.0.0.1)
    -p, --port <PORT>    Seed port (default: {})
    -U, --user <USER>    Log in as USER, credential read from ${}
    -i, --info <NAME>    Info name to query on every node (repeatable)
    -v, --version        Print version information
        --help           Print this help message

EXAMPLES:
    fleetkv --host 10.0.0.1
    fleetkv -i build -i statistics
    RUST_LOG=fleetkv=debug fleetkv
"#,
        DEFAULT_PORT, CREDENTIAL_ENV
    );
}

fn report(client: &Client, names: &[String]) -> anyhow::Result<()> {
    let nodes = client.nodes();
    println!("nodes: {}", nodes.len());
    for node in nodes.iter() {
        let addrs: Vec<String> = node.addresses().addrs().iter().map(|a| a.to_string()).collect();
        println!(
            "  {} [{}] active={} peers={} partition-generation={}",
            node.name(),
            addrs.join(", "),
            node.is_active(),
            node.peers_count(),
            node.partition_generation()
        );
    }

    let partitions = client.cluster().partitions();
    let namespaces: BTreeMap<_, _> = partitions.iter().collect();
    for (namespace, table) in namespaces {
        let mut owners: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
        let mut unowned = 0;
        for p in &table.partitions {
            match &p.master {
                Some(n) => owners.entry(n.name()).or_default().0 += 1,
                None => unowned += 1,
            }
            if let Some(n) = &p.prole {
                owners.entry(n.name()).or_default().1 += 1;
            }
        }
        println!("namespace {} (strong consistency: {})", namespace, table.sc_mode);
        for (name, (master, prole)) in owners {
            println!("  {:<20} master={:<5} prole={}", name, master, prole);
        }
        if unowned > 0 {
            println!("  unowned partitions: {}", unowned);
        }
    }

    if !names.is_empty() {
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        for node in nodes.iter() {
            let response = client
                .info_node(node.name(), &names)
                .with_context(|| format!("info on node {}", node.name()))?;
            println!("info {}:", node.name());
            for (name, value) in response.iter() {
                println!("  {} = {}", name, value);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let client_config = config.client_config()?;
    let names = config.info;
    info!(seed = %format!("{}:{}", config.host, config.port), "Connecting");

    // The client blocks while seeding, keep it off the runtime threads
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let client = Client::new(client_config).context("cannot connect to cluster")?;
        report(&client, &names)?;
        client.close();
        Ok(())
    })
    .await??;

    info!("Probe complete");
    Ok(())
}
