use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mesh_upstream::config::{Config, ConfigError, LoggingConfig};
use mesh_upstream::utils::{
    format_error, format_health_ratio, format_host, parse_match_criteria, pick_distribution,
};
use mesh_upstream::{LoadBalancerContext, Upstream, UpstreamError};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mesh-upstream")]
#[command(about = "Cluster membership and load balancing core for a service-mesh data plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file and print the clusters it defines
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Generate example configuration files
    Config {
        /// Load balancer type (random, round_robin, weighted_round_robin or subset)
        #[arg(short, long, default_value = "subset")]
        lb_type: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Run selections against a configured cluster and print where they land
    Route {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// Cluster to select from
        #[arg(long)]
        cluster: String,
        /// Request metadata as key=value pairs, comma separated
        #[arg(short, long)]
        meta: Option<String>,
        /// Number of selections
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    run(cli).map_err(|e| {
        if let Some(err) = e.downcast_ref::<UpstreamError>() {
            eprintln!("{}", format_error(err));
        }
        e
    })
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Validate { config } => validate_config(config),
        Commands::Config { lb_type, output } => generate_config(lb_type, output),
        Commands::Route {
            config,
            cluster,
            meta,
            count,
        } => route(config, cluster, meta, count),
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

fn generate_config(lb_type: String, output: PathBuf) -> Result<()> {
    println!("Generating {} configuration file: {:?}", lb_type, output);

    Config::create_example_config(&output, &lb_type).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  mesh-upstream validate --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    let config = match Config::load_from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
                ConfigError::InvalidLbConfig { cluster, source } => {
                    eprintln!("  Load balancer error in cluster {}: {}", cluster, source)
                }
            }
            return Err(e.into());
        }
    };

    let upstream = Upstream::from_config(&config).context("Failed to build clusters")?;
    println!("✓ Configuration file is valid");
    println!("  Clusters: {}", upstream.clusters().len());

    for name in upstream.clusters().cluster_names() {
        let Some(cluster) = upstream.clusters().get_cluster(&name) else {
            continue;
        };
        println!(
            "  {} ({:?}, {} healthy)",
            name,
            cluster.lb_type(),
            format_health_ratio(cluster.host_set())
        );
        if let Some(subset) = cluster.balancer().as_subset() {
            let index = subset.index();
            let mut criteria: Vec<String> = index.criteria().map(|c| c.to_string()).collect();
            criteria.sort();
            println!(
                "    fallback: {:?}, {} subsets",
                subset.info().fallback_policy(),
                criteria.len()
            );
            for c in criteria {
                println!("      {}", c);
            }
        }
        for (i, host) in cluster.hosts().iter().enumerate() {
            println!("    {}: {}", i + 1, format_host(host));
        }
    }

    Ok(())
}

fn route(config_path: PathBuf, cluster: String, meta: Option<String>, count: usize) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    init_logging(&config.logging)?;

    let upstream = Upstream::from_config(&config)?;
    let criteria = meta
        .as_deref()
        .map(parse_match_criteria)
        .transpose()
        .map_err(anyhow::Error::msg)
        .context("Invalid --meta")?;
    let context = criteria.as_ref().map(|c| c as &dyn LoadBalancerContext);

    tracing::info!("Routing {} requests to cluster {}", count, cluster);
    let mut picks = Vec::with_capacity(count);
    for _ in 0..count {
        match upstream.choose_host(&cluster, context)? {
            Some(host) => picks.push(host),
            None => bail!("No host available in cluster {}", cluster),
        }
    }

    for (address, share) in pick_distribution(&picks) {
        println!("{:<24} {:>6.2}%", address, share * 100.0);
    }

    Ok(())
}

fn show_version() {
    println!("mesh-upstream v{}", env!("CARGO_PKG_VERSION"));
    println!("Cluster membership and load balancing core for a service-mesh data plane");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Incremental host membership updates preserving host identity");
    println!("  • Health flag bitmask with incrementally maintained healthy cache");
    println!("  • Random, round robin and weighted round robin balancing");
    println!("  • Metadata subset load balancing with fallback policies");
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::debug!("Logging initialized at level: {}", logging.level);
    Ok(())
}
