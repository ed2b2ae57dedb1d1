pub mod types;
pub mod config;
pub mod crs;
pub mod data;
pub mod fetch;
pub mod processing;
pub mod export;
pub mod render;
pub mod site;
pub mod scrape;
pub mod package;
pub mod pipeline;
pub mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file; defaults apply when it does not exist
    #[arg(short, long, value_name = "FILE", default_value = "config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, merge and export the localities dataset
    Build {
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        site_dir: Option<PathBuf>,
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        state_fips: Option<String>,
        /// TIGER vintage to try first
        #[arg(long)]
        year: Option<u16>,
        #[arg(long, value_name = "FILE")]
        mineral_csv: Option<PathBuf>,
        /// Skip the network and run one sample place through the pipeline
        #[arg(long)]
        use_sample: bool,
        /// Zip the output directory after export
        #[arg(long)]
        pack_output: bool,
    },
    /// Copy exports into the site folder and write map.html
    Site {
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        site_dir: Option<PathBuf>,
    },
    /// Render the interactive mineral map from the mineral CSV
    MineralMap {
        #[arg(long, value_name = "FILE")]
        data_csv: Option<PathBuf>,
        #[arg(long)]
        site_dir: Option<PathBuf>,
    },
    /// Rebuild the mineral CSV from a saved Leaflet map page
    Scrape {
        #[arg(long, value_name = "FILE")]
        input: PathBuf,
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Serve the site folder locally
    Serve {
        #[arg(long)]
        site_dir: Option<PathBuf>,
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut app_config = config::AppConfig::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Build {
            output_dir,
            site_dir,
            state,
            state_fips,
            year,
            mineral_csv,
            use_sample,
            pack_output,
        } => {
            app_config.apply_overrides(config::Overrides {
                output_dir,
                site_dir,
                state,
                state_fips,
                year,
                mineral_csv,
                ..Default::default()
            });

            let options = pipeline::BuildOptions { use_sample, pack_output };
            match pipeline::run_build(&app_config, options).await {
                Ok(Some(paths)) => info!("Build complete: {:?}", paths.geojson),
                Ok(None) => warn!("Build finished without exports"),
                Err(e) => {
                    error!("Pipeline aborted: {:#}", e);
                    return Err(e);
                }
            }
        }
        Commands::Site { output_dir, site_dir } => {
            app_config.apply_overrides(config::Overrides { output_dir, site_dir, ..Default::default() });
            site::build_site(&app_config.output.output_dir, &app_config.output.site_dir)?;
        }
        Commands::MineralMap { data_csv, site_dir } => {
            app_config.apply_overrides(config::Overrides {
                mineral_csv: data_csv,
                site_dir,
                ..Default::default()
            });
            let csv_path = &app_config.input.mineral_csv;
            let site_dir = &app_config.output.site_dir;
            if !csv_path.exists() {
                error!("Data file not found: {:?}", csv_path);
                return Ok(());
            }
            let sites = data::read_mineral_sites(csv_path)?;
            render::render_mineral_map(&sites, &site_dir.join("mineral_map.html"))?;
        }
        Commands::Scrape { input, output } => {
            app_config.apply_overrides(config::Overrides { mineral_csv: output, ..Default::default() });
            scrape::scrape_map_file(&input, &app_config.input.mineral_csv)?;
        }
        Commands::Serve { site_dir, port } => {
            app_config.apply_overrides(config::Overrides { site_dir, port, ..Default::default() });
            server::start_server(&app_config.output.site_dir, app_config.server.port).await?;
        }
    }

    Ok(())
}
