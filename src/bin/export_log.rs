//! export_log - write an archived session's activity log as CSV

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, IsTerminal, Write};

use occupancy_kernel::{write_records_csv, LogArchive, SqliteLogArchive, EXPORT_FILE_NAME};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the session archive database.
    #[arg(long, env = "OCCUPANCY_ARCHIVE_DB", default_value = "occupancy.db")]
    db: String,
    /// Session id, or a stream name to export its latest session.
    #[arg(long)]
    session: Option<String>,
    /// Output file path for the CSV log.
    #[arg(long, default_value = EXPORT_FILE_NAME)]
    output: String,
    /// List archived sessions instead of exporting.
    #[arg(long)]
    list: bool,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let mut archive = {
        let _stage = ui.stage("Open archive");
        SqliteLogArchive::open(&args.db)?
    };

    if args.list {
        let sessions = archive.list_sessions(args.session.as_deref())?;
        if sessions.is_empty() {
            println!("no archived sessions in {}", args.db);
        }
        for s in sessions {
            println!(
                "{}  {:<16} {} .. {}  records={} on={} off={} final={} ({})",
                s.id,
                s.name,
                s.started_at.format("%Y-%m-%d %H:%M:%S"),
                s.ended_at.format("%Y-%m-%d %H:%M:%S"),
                s.record_count,
                s.transitions_on,
                s.transitions_off,
                s.final_state,
                s.end_reason
            );
        }
        return Ok(());
    }

    let selector = args
        .session
        .as_deref()
        .ok_or_else(|| anyhow!("--session is required unless --list is given"))?;
    let session = archive.resolve(selector)?;
    let records = {
        let _stage = ui.stage("Load activity log");
        archive.load_records(&session.id)?
    };
    {
        let _stage = ui.stage("Write CSV");
        let file = File::create(&args.output)
            .with_context(|| format!("create output file {}", args.output))?;
        let mut writer = BufWriter::new(file);
        write_records_csv(&records, &mut writer)?;
        writer.flush()?;
    }

    println!(
        "exported {} record(s) from session {} ({}) to {}",
        records.len(),
        session.id,
        session.name,
        args.output
    );
    Ok(())
}
