//! Looks into the broker segment from outside: dumps the event and process
//! tables, wakes routers, runs maintenance, sends events and resets the
//! segment.
//!
//! ```bash
//! shmspy events --all
//! shmspy send --to X --kind shutdown --ttl 1:00 "bye"
//! SHM_BROKER_SEGMENT=/other.mem shmspy status
//! ```

use clap::{Parser, Subcommand};
use shm_broker::{Broker, BrokerConfig, Event, EventKind, ProcessRecord, Segment};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "shmspy")]
#[command(about = "Inspect and poke the shared memory event broker")]
#[command(version)]
struct Args {
    /// Segment name, overrides SHM_BROKER_SEGMENT
    #[arg(short, long)]
    segment: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dump the event table
    Events {
        /// Include free slots
        #[arg(short, long)]
        all: bool,
    },

    /// Dump the process table
    Processes {
        /// Include free slots
        #[arg(short, long)]
        all: bool,
    },

    /// Segment usage and schema version
    Status,

    /// Post every process's wake signal
    Wake,

    /// Run maintenance now
    Maintenance,

    /// Store an event and wake every process
    Send {
        #[arg(long, default_value = "shmspy")]
        topic: String,
        #[arg(long)]
        to: String,
        #[arg(long, default_value = "shmspy")]
        from: String,
        /// Event type name, e.g. "generic" or "shutdown"
        #[arg(long, default_value = "generic")]
        kind: String,
        /// Time to live as [-]h[:mm][:ss], the broker default if unset
        #[arg(long)]
        ttl: Option<String>,
        #[arg(default_value = "")]
        payload: String,
    },

    /// Destroy the segment
    Reset {
        /// Reset even while processes are registered
        #[arg(long)]
        force: bool,
    },
}

type CmdResult = Result<(), Box<dyn std::error::Error>>;

fn main() {
    env_logger::init();
    let args = Args::parse();
    let mut config = BrokerConfig::from_env();
    if let Some(segment) = &args.segment {
        config = config.with_segment(segment);
    }

    let result = match args.command {
        Commands::Events { all } => with_broker(config, |b| cmd_events(b, all)),
        Commands::Processes { all } => with_broker(config, |b| cmd_processes(b, all)),
        Commands::Status => with_broker(config, cmd_status),
        Commands::Wake => with_broker(config, cmd_wake),
        Commands::Maintenance => with_broker(config, cmd_maintenance),
        Commands::Send {
            topic,
            to,
            from,
            kind,
            ttl,
            payload,
        } => with_broker(config, |b| {
            cmd_send(b, &topic, &to, &from, &kind, ttl.as_deref(), &payload)
        }),
        Commands::Reset { force } => cmd_reset(config, force),
    };

    if let Err(e) = result {
        eprintln!("shmspy: {}", e);
        std::process::exit(1);
    }
}

// Everything but send works on an existing segment only.
fn with_broker(config: BrokerConfig, f: impl FnOnce(&Arc<Broker>) -> CmdResult) -> CmdResult {
    if !Segment::exists(&config.segment_name)? {
        return Err(format!("no broker segment {}", config.segment_name).into());
    }
    let broker = Broker::open(config)?;
    return f(&broker);
}

fn print_table(header: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
    }
    let line = |cells: Vec<&str>| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", c, width = *w))
            .collect();
        println!("{}", padded.join("  ").trim_end());
    };
    line(header.to_vec());
    for row in rows {
        line(row.iter().map(|c| c.as_str()).collect());
    }
}

fn cmd_events(broker: &Arc<Broker>, all: bool) -> CmdResult {
    let rows = broker.events_as_rows(all);
    print_table(&Event::ROW_HEADER, &rows);
    println!("{} events", rows.len());
    return Ok(());
}

fn cmd_processes(broker: &Arc<Broker>, all: bool) -> CmdResult {
    let rows = broker.processes_as_rows(all);
    print_table(&ProcessRecord::ROW_HEADER, &rows);
    println!("{} processes", rows.len());
    return Ok(());
}

fn cmd_status(broker: &Arc<Broker>) -> CmdResult {
    println!("schema version {}", broker.shmem_version());
    println!("{}", serde_json::to_string_pretty(&broker.status())?);
    match broker.maintenance_winner() {
        Some(p) => println!("maintenance process {} (bid {})", p.id(), p.bid()),
        None => println!("no maintenance process"),
    }
    return Ok(());
}

fn cmd_wake(broker: &Arc<Broker>) -> CmdResult {
    println!("posted {} wake signals", broker.trigger_processes());
    return Ok(());
}

fn cmd_maintenance(broker: &Arc<Broker>) -> CmdResult {
    match broker.perform_maintenance("shmspy", |_| {}) {
        Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
        None => println!("maintenance is already running elsewhere"),
    }
    return Ok(());
}

fn cmd_send(
    broker: &Arc<Broker>,
    topic: &str,
    to: &str,
    from: &str,
    kind: &str,
    ttl: Option<&str>,
    payload: &str,
) -> CmdResult {
    let kind = EventKind::from_name(kind).ok_or_else(|| format!("unknown event type {:?}", kind))?;
    let mut event = Event::new(topic, to, from, kind);
    match ttl {
        Some(ttl) => event.set_expiration_from_str(ttl)?,
        None => event.set_expires_in(broker.config().default_event_ttl),
    }
    if !event.set_payload_str(payload) {
        eprintln!("payload cut to {} bytes", event.payload().len());
    }
    let outcome = broker.send_event(&mut event, true);
    println!("stored as event {} ({:?})", outcome.key(), outcome);
    return Ok(());
}

fn cmd_reset(config: BrokerConfig, force: bool) -> CmdResult {
    let name = config.segment_name.clone();
    if !Segment::exists(&name)? {
        println!("no broker segment {}", name);
        return Ok(());
    }
    if !force {
        let broker = Broker::open(config)?;
        let live = broker.live_processes();
        if !live.is_empty() {
            let ids: Vec<&str> = live.iter().map(|p| p.id()).collect();
            return Err(format!(
                "processes still registered ({}), use --force to reset anyway",
                ids.join(", ")
            )
            .into());
        }
    }
    Broker::reset(&name)?;
    println!("removed {}", name);
    return Ok(());
}
