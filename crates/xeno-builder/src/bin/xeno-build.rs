//! xeno-build: construct and start a guest domain from the control domain.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use snafu::Snafu;
use xeno_builder::config::{
    BuildConfig, DomainRequest, DEFAULT_MEM_DEVICE_PATH, DEFAULT_PRIVCMD_PATH,
};
use xeno_builder::control::Privcmd;
use xeno_builder::domain::{build_domain, save_layout};
use xeno_builder::error::BuildError;
use xeno_builder::frames::DevMem;
use xeno_builder::image::KernelImage;
use xeno_builder::layout::{domain_bytes, pages_for, TablePlan};

/// CLI errors for the builder binary.
#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("{source}"), context(false))]
    Build { source: BuildError },
}

#[derive(Parser)]
#[command(name = "xeno-build")]
#[command(about = "Build the initial memory image and page tables of a guest domain")]
#[command(version)]
struct Cli {
    /// Privileged-command device
    #[arg(long, global = true, default_value = DEFAULT_PRIVCMD_PATH)]
    privcmd: PathBuf,

    /// Physical-memory device
    #[arg(long, global = true, default_value = DEFAULT_MEM_DEVICE_PATH)]
    mem_device: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and start a domain
    Build {
        /// Write the final guest layout as JSON
        #[arg(long)]
        layout_json: Option<PathBuf>,

        /// Domain to build (must not be 0)
        domain_id: u32,

        /// Kernel image
        kernel: PathBuf,

        /// Number of virtual network interfaces
        num_vifs: u32,

        /// Optional leading initrd=<path>, then the guest command line
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        boot_params: Vec<String>,
    },

    /// Validate a kernel image and show the table plan for a domain size
    Inspect {
        /// Kernel image
        kernel: PathBuf,

        /// Domain size in pages
        #[arg(long)]
        pages: Option<u64>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Build {
            layout_json,
            domain_id,
            kernel,
            num_vifs,
            boot_params,
        } => {
            let config = BuildConfig {
                privcmd_path: cli.privcmd,
                mem_device_path: cli.mem_device,
                layout_json,
            };
            let request = DomainRequest::new(domain_id, kernel, num_vifs, boot_params);
            cmd_build(&config, &request)
        }
        Commands::Inspect { kernel, pages } => cmd_inspect(kernel, pages),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn cmd_build(config: &BuildConfig, request: &DomainRequest) -> Result<(), CliError> {
    request.validate().map_err(BuildError::from)?;

    let mut control = Privcmd::open(&config.privcmd_path)?;
    let mut mem = DevMem::open(&config.mem_device_path)?;
    let built = build_domain(&mut control, &mut mem, request)?;

    if let Some(path) = &config.layout_json {
        save_layout(&built.layout, path)?;
    }

    println!("Domain {} started", request.domain);
    println!("  Root table:   {:#x}", built.layout.root_table);
    println!("  Load address: {:#x}", built.layout.load_addr);
    println!("  Start info:   {:#x}", built.layout.start_info_addr);
    println!("  Shared info:  {:#x}", built.layout.shared_info_addr);
    if let Some(module) = built.layout.module {
        println!("  Initrd:       {:#x} ({} bytes)", module.addr, module.len);
    }
    println!("  Updates:      {}", built.updates);
    Ok(())
}

fn cmd_inspect(kernel: PathBuf, pages: Option<u64>) -> Result<(), CliError> {
    let header = KernelImage::inspect(&kernel)?;

    println!("=== Kernel ===");
    println!("Path: {}", kernel.display());
    println!("Load address: {:#x}", header.load_addr);
    println!(
        "Payload: {} bytes ({} pages)",
        header.payload_len,
        pages_for(header.payload_len)
    );

    if let Some(pages) = pages {
        let plan = TablePlan::new(header.load_addr, pages).map_err(BuildError::from)?;
        let bytes = domain_bytes(pages).map_err(BuildError::from)?;
        header.check_fits(bytes).map_err(BuildError::from)?;

        println!("\n=== Table plan ({} pages) ===", pages);
        println!("Leaf tables: {}", plan.leaf_tables);
        println!("Table pages: {}", plan.table_pages);
        println!("Tables from frame index: {}", plan.pt_start);
        match plan.start_info_index() {
            Some(index) => println!("Start info frame index: {}", index),
            None => println!("Start info frame index: none (domain too small)"),
        }
        println!("Update requests: {}", plan.request_capacity());
    }
    Ok(())
}
