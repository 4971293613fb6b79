use std::error::Error;
use std::io::{self, Write};
use std::net::TcpListener;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dls::reader::remote::{self, RemoteClient, RemoteConfig};
use dls::{CatalogConfig, Data, Directory, JobDir, Time};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dls", version, about = "Data logging service storage tools")]
struct Cli {
    /// Data directory.
    #[arg(long = "dir", env = "DLS_DIR", global = true)]
    dir: Option<PathBuf>,
    /// Read from a directory server instead (`host:port`).
    #[arg(long = "remote", global = true)]
    remote: Option<String>,
    /// Ignore the chunk caches.
    #[arg(long = "no-cache", global = true)]
    no_cache: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List jobs, or the channels of one job.
    List {
        #[arg(short = 'j', long = "job")]
        job: Option<u32>,
    },
    /// Rewrite the chunk caches.
    Index {
        #[arg(short = 'j', long = "job")]
        job: Option<u32>,
    },
    /// Write channel values as CSV to stdout.
    Export {
        #[arg(short = 'j', long = "job")]
        job: u32,
        /// Channel index or name.
        #[arg(short = 'c', long = "channel")]
        channel: String,
        /// Start time in microseconds since the epoch.
        #[arg(long = "start", default_value_t = 0)]
        start: Time,
        /// End time in microseconds since the epoch (exclusive).
        #[arg(long = "end", default_value_t = Time::MAX)]
        end: Time,
        #[arg(long = "min-values", default_value_t = 0)]
        min_values: u32,
        #[arg(long = "decimation", default_value_t = 1)]
        decimation: u32,
    },
    /// Serve the data directory to remote readers.
    Serve {
        #[arg(long = "listen", default_value = "127.0.0.1:53584")]
        listen: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = CatalogConfig {
        use_index_cache: !cli.no_cache,
        ..CatalogConfig::default()
    };
    let directory = match (&cli.dir, &cli.remote) {
        (_, Some(addr)) => {
            Directory::connect(RemoteClient::new(addr, RemoteConfig::default()), config)
        }
        (Some(dir), None) => Directory::open(dir, config)?,
        (None, None) => return Err("no data directory, use --dir or DLS_DIR".into()),
    };

    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::List { job: None } => cmd_list_jobs(&directory, &mut out)?,
        Commands::List { job: Some(job) } => cmd_list_channels(directory.job(job)?, &mut out)?,
        Commands::Index { job } => cmd_index(&directory, job)?,
        Commands::Export {
            job,
            channel,
            start,
            end,
            min_values,
            decimation,
        } => cmd_export(
            directory.job(job)?,
            &channel,
            (start, end),
            min_values,
            decimation,
            &mut out,
        )?,
        Commands::Serve { listen } => {
            if directory.is_remote() {
                return Err("serve needs a local data directory".into());
            }
            let listener = TcpListener::bind(&listen)?;
            remote::serve(&listener, &directory)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn cmd_list_jobs(directory: &Directory, out: &mut dyn Write) -> Result<(), Box<dyn Error>> {
    for mut job in directory.jobs()? {
        job.fetch_channels()?;
        writeln!(out, "job{}\t{} channels", job.id(), job.channels().count())?;
    }
    Ok(())
}

fn cmd_list_channels(mut job: JobDir, out: &mut dyn Write) -> Result<(), Box<dyn Error>> {
    job.fetch_channels()?;
    for channel in job.channels_mut() {
        channel.fetch_chunks()?;
        let range = match channel.range() {
            Some((start, end)) => format!("{}..{}", start, end),
            None => "empty".to_string(),
        };
        writeln!(
            out,
            "channel{}\t{}\t{}\t{}\t{} chunks\t{}",
            channel.index(),
            channel.name(),
            channel.unit(),
            channel.scalar(),
            channel.chunk_count(),
            range
        )?;
    }
    Ok(())
}

fn cmd_index(directory: &Directory, job: Option<u32>) -> Result<(), Box<dyn Error>> {
    let jobs = match job {
        Some(id) => vec![directory.job(id)?],
        None => directory.jobs()?,
    };
    for mut job in jobs {
        job.fetch_channels()?;
        let id = job.id();
        for channel in job.channels_mut() {
            let update = channel
                .fetch_chunks()
                .and_then(|_| channel.update_index());
            if let Err(e) = update {
                warn!("job{}/channel{}: {}", id, channel.index(), e);
            }
        }
        info!("Indexed job{}", id);
    }
    Ok(())
}

fn cmd_export(
    mut job: JobDir,
    channel: &str,
    (start, end): (Time, Time),
    min_values: u32,
    decimation: u32,
    out: &mut dyn Write,
) -> Result<(), Box<dyn Error>> {
    job.fetch_channels()?;
    let index = match channel.parse::<u32>() {
        Ok(index) => index,
        Err(_) => job
            .find_channel(channel)
            .map(|c| c.index())
            .ok_or_else(|| format!("no channel {} in job{}", channel, job.id()))?,
    };
    let job_id = job.id();
    let channel = job
        .channel_mut(index)
        .ok_or_else(|| format!("no channel{} in job{}", index, job_id))?;
    channel.fetch_chunks()?;

    writeln!(out, "time,meta,level,value")?;
    let mut failure = None;
    let mut sink = |data: Data| -> Option<Data> {
        if failure.is_none() {
            for (time, value) in data.iter() {
                let line = writeln!(out, "{},{},{},{}", time, data.meta_type, data.meta_level, value);
                if let Err(e) = line {
                    failure = Some(e);
                    break;
                }
            }
        }
        Some(data)
    };
    let summary = channel.fetch_data(start, end, min_values, decimation, &mut sink)?;
    if let Some(e) = failure {
        return Err(e.into());
    }
    info!(
        "Exported {} values from {} blocks at level {}",
        summary.values, summary.blocks, summary.level
    );
    Ok(())
}
