use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use lazarus_core::{
    default_executable, prepare_revival, require_load_bias, write_mappings, write_symbols,
    ElfImage, OpenMode, RevivalConfig, DEFAULT_RUNTIME_LIBRARY, REQUIRED_SYMBOLS,
};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Prepares crashed JVM cores for revival
#[derive(Parser)]
#[command(
    name = "lazarus",
    about = "Relocate runtime libraries and extract what a revived process needs from a core dump",
    version,
    author
)]
struct Cli {
    /// Log every record and relocation step
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ConfigArgs {
    /// Directory holding the runtime library, instead of the path the core recorded
    #[arg(long, env = "LAZARUS_LIBDIR")]
    libdir: Option<PathBuf>,

    /// Name of the runtime library among the core's file mappings
    #[arg(long, env = "LAZARUS_RUNTIME_LIB", default_value = DEFAULT_RUNTIME_LIBRARY)]
    runtime_lib: String,

    /// Name of the main executable among the core's file mappings
    #[arg(long, env = "LAZARUS_EXE_NAME")]
    exe_name: Option<String>,
}

impl From<ConfigArgs> for RevivalConfig {
    fn from(args: ConfigArgs) -> Self {
        RevivalConfig {
            library_dir: args.libdir,
            runtime_library: args.runtime_lib,
            executable: args.exe_name,
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Build a revival directory for a core dump
    Prepare {
        core: PathBuf,
        /// Revival directory to create
        #[arg(short, long)]
        out: PathBuf,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Move a shared object in place by a signed displacement
    Relocate {
        lib: PathBuf,
        /// Hex (0x...) or decimal, optionally negative
        #[arg(allow_hyphen_values = true)]
        displacement: String,
    },
    /// Write the mapping descriptor of a core dump
    Mappings {
        core: PathBuf,
        /// Name of the main executable among the core's file mappings
        #[arg(long)]
        exe_name: Option<String>,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Write the addresses of the runtime symbols a revived process needs
    Symbols {
        lib: PathBuf,
        /// Symbol to look up instead of the default set; repeatable
        #[arg(long = "symbol")]
        symbols: Vec<String>,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// List the files a core dump had mapped
    Notes {
        core: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Translate a virtual address to a file offset
    Offset {
        elf: PathBuf,
        addr: String,
    },
}

#[derive(Tabled)]
struct MappingRow {
    #[tabled(rename = "Start")]
    start: String,
    #[tabled(rename = "End")]
    end: String,
    #[tabled(rename = "Offset")]
    offset: String,
    #[tabled(rename = "Path")]
    path: String,
}

fn parse_signed(text: &str) -> Result<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => digits.parse(),
    }
    .with_context(|| format!("not a number: {text:?}"))?;
    Ok(if negative { -magnitude } else { magnitude })
}

fn parse_address(text: &str) -> Result<u64> {
    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    }
    .with_context(|| format!("not an address: {text:?}"))
}

fn output(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(io::stdout().lock()),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Command::Prepare { core, out, config } => {
            require_load_bias()?;
            let prepared = prepare_revival(&core, &out, &config.into())?;
            println!(
                "{} {} moved by {:#x}, {} symbols, {} segments",
                "Prepared".green().bold(),
                prepared.library.display(),
                prepared.displacement,
                prepared.symbols,
                prepared.segments
            );
        }

        Command::Relocate { lib, displacement } => {
            let displacement = parse_signed(&displacement)?;
            let mut image = ElfImage::open(&lib, OpenMode::ReadWrite)?;
            image.relocate(displacement)?;
            match image.load_bias() {
                Some(bias) => println!("{}: load bias now 0x{bias:x}", lib.display()),
                None => println!("{}: relocated (no PT_LOAD)", lib.display()),
            }
        }

        Command::Mappings { core, exe_name, out } => {
            let mut image = ElfImage::open(&core, OpenMode::ReadOnly)?;
            let exe_name = match exe_name {
                Some(name) => name,
                None => default_executable(&mut image)?,
            };
            let mut out = output(out.as_deref())?;
            let segments = write_mappings(&mut image, &exe_name, &mut out)?;
            out.flush()?;
            log::info!("{} segments written", segments.len());
        }

        Command::Symbols { lib, symbols, out } => {
            let image = ElfImage::open(&lib, OpenMode::ReadOnly)?;
            let wanted: Vec<&str> = if symbols.is_empty() {
                REQUIRED_SYMBOLS.to_vec()
            } else {
                symbols.iter().map(String::as_str).collect()
            };
            let mut out = output(out.as_deref())?;
            let found = write_symbols(&image, &wanted, &mut out)?;
            out.flush()?;
            if found < wanted.len() {
                log::warn!("{} of {} symbols not found", wanted.len() - found, wanted.len());
            }
        }

        Command::Notes { core, json } => {
            let mut image = ElfImage::open(&core, OpenMode::ReadOnly)?;
            let mappings = image.shared_library_mappings()?;
            if json {
                println!("{}", serde_json::to_string_pretty(mappings)?);
            } else if mappings.is_empty() {
                println!("No file mappings recorded.");
            } else {
                let rows = mappings.iter().map(|m| MappingRow {
                    start: format!("0x{:x}", m.start),
                    end: format!("0x{:x}", m.end),
                    offset: format!("0x{:x}", m.file_offset),
                    path: m.path.clone(),
                });
                let mut table = Table::new(rows);
                table.with(Style::rounded());
                println!("{}", format!("{} file mappings", mappings.len()).bold());
                println!("{table}");
            }
        }

        Command::Offset { elf, addr } => {
            let addr = parse_address(&addr)?;
            let image = ElfImage::open(&elf, OpenMode::ReadOnly)?;
            match image.file_offset_for_vaddr(addr) {
                Some(offset) => println!("0x{addr:x} -> file offset 0x{offset:x}"),
                None => bail!("0x{addr:x} is not covered by any PT_LOAD segment"),
            }
        }
    }

    Ok(())
}
